//! Plugin manifest model and validation
//!
//! A manifest (`plugin.yaml`) declares a plugin's identity, the runtime that
//! executes it, the HTTP endpoints it serves, the permissions it requests and
//! the plugins it depends on. Parsing and validation are pure functions.
//!
//! ```yaml
//! id: cluster-inventory
//! name: Cluster Inventory
//! version: 1.2.0
//! author: acme
//! compatibility:
//!   host: ">=0.1.0, <2.0.0"
//! runtime:
//!   kind: native
//!   entrypoint: libcluster_inventory.so
//! endpoints:
//!   - path: /clusters/{name}
//!     method: GET
//!     handler: get_cluster
//! permissions:
//!   - clusters.read
//! ```

use crate::core::error::ManifestError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// File names recognised as a plugin manifest, in lookup order
pub const MANIFEST_FILE_NAMES: &[&str] = &["plugin.yaml", "plugin.yml", "plugin.json"];

/// Compatibility key checked against the running host version
pub const HOST_COMPATIBILITY_KEY: &str = "host";

const MAX_ENDPOINTS: usize = 50;
const MAX_DEPENDENCIES: usize = 20;
const MAX_PERMISSIONS: usize = 30;

const VALIDATED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "text/plain",
    "multipart/form-data",
];

/// Declarative descriptor of a plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,

    /// Version ranges keyed by component; `host` is enforced at load time
    #[serde(default)]
    pub compatibility: BTreeMap<String, String>,

    #[serde(default)]
    pub runtime: RuntimeSpec,

    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,

    /// Requested scopes in `resource.action` form
    #[serde(default)]
    pub permissions: Vec<String>,

    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    /// Free-form settings handed to the plugin at initialization
    #[serde(default)]
    pub configuration: HashMap<String, Value>,

    #[serde(default)]
    pub security: SecuritySpec,

    #[serde(default)]
    pub health: HealthSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,

    /// Directory of static assets relative to the plugin root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<String>,
}

/// Execution strategy for the plugin's code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Dynamic library exporting the plugin ABI
    #[default]
    Native,
    /// WASM module executed by an embedded engine
    Wasm,
    /// Supervised subprocess speaking JSON lines on stdio
    Process,
    /// Factory compiled into the host
    Builtin,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Native => write!(f, "native"),
            RuntimeKind::Wasm => write!(f, "wasm"),
            RuntimeKind::Process => write!(f, "process"),
            RuntimeKind::Builtin => write!(f, "builtin"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub kind: RuntimeKind,

    /// Code file relative to the plugin root; the factory name for builtins
    #[serde(default)]
    pub entrypoint: String,

    /// Interpreter for process plugins, e.g. `python3`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

/// One HTTP endpoint served by the plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub path: String,
    pub method: String,
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSpec>,
}

/// Request quota per caller over a sliding window
///
/// ```yaml
/// rate_limit:
///   requests: 60
///   window_ms: 60000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    #[serde(alias = "rpm")]
    pub requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_window_ms() -> u64 {
    60_000
}

/// Checks a request must pass before it reaches the handler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSpec {
    /// Accepted media types; the `Content-Type` header must contain one
    #[serde(default, alias = "content_type")]
    pub content_types: Vec<String>,
    /// Top-level fields the JSON body must carry
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub id: String,
    /// Semver range the loaded dependency must satisfy
    #[serde(default = "default_dependency_version")]
    pub version: String,
    #[serde(default)]
    pub optional: bool,
}

fn default_dependency_version() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySpec {
    /// Hex sha256 of the entrypoint, optionally prefixed with `sha256:`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

impl Default for HealthSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Build step run after fetching a remote source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Shell command executed in the plugin root
    pub command: String,
    /// Working directory relative to the plugin root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

/// HTTP methods a plugin endpoint may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            other => Err(ManifestError::Invalid {
                field: "endpoints.method".to_string(),
                reason: format!("unsupported method '{other}'"),
            }),
        }
    }
}

impl EndpointSpec {
    pub fn http_method(&self) -> Result<HttpMethod, ManifestError> {
        self.method.parse()
    }
}

impl PluginManifest {
    /// Parse a manifest from YAML (JSON is accepted as a YAML subset)
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ManifestError::Malformed("manifest is empty".to_string()));
        }
        Ok(serde_yaml::from_slice(bytes)?)
    }

    /// Read and parse a manifest file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ManifestError::Malformed(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&bytes)
    }

    /// Manifest version as semver; a leading `v` is tolerated
    pub fn semver(&self) -> Result<semver::Version, ManifestError> {
        parse_version(&self.version)
    }

    /// Host compatibility range, if one is declared
    pub fn host_requirement(&self) -> Result<Option<semver::VersionReq>, ManifestError> {
        self.compatibility
            .get(HOST_COMPATIBILITY_KEY)
            .map(|raw| parse_requirement("compatibility.host", raw))
            .transpose()
    }

    /// Entrypoint used by the runtime; builtins fall back to the plugin id
    pub fn entrypoint(&self) -> &str {
        if self.runtime.entrypoint.is_empty() && self.runtime.kind == RuntimeKind::Builtin {
            &self.id
        } else {
            &self.runtime.entrypoint
        }
    }

    /// Handler names referenced by endpoints, deduplicated in declaration order
    pub fn handler_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.endpoints
            .iter()
            .filter(|e| seen.insert(e.handler.as_str()))
            .map(|e| e.handler.clone())
            .collect()
    }

    /// Validate the manifest against the running host version
    pub fn validate(&self, host_version: &semver::Version) -> Result<(), ManifestError> {
        self.validate_required()?;
        self.validate_identity()?;
        self.validate_runtime()?;
        self.validate_endpoints()?;
        self.validate_permissions()?;
        self.validate_dependencies()?;
        self.validate_compatibility(host_version)
    }

    fn validate_required(&self) -> Result<(), ManifestError> {
        for (field, value) in [("id", &self.id), ("name", &self.name), ("version", &self.version)] {
            if value.trim().is_empty() {
                return Err(ManifestError::MissingRequiredField(field.to_string()));
            }
        }
        Ok(())
    }

    fn validate_identity(&self) -> Result<(), ManifestError> {
        let id_ok = (3..=50).contains(&self.id.len())
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !id_ok {
            return Err(invalid(
                "id",
                "must be 3-50 characters of letters, digits, '_' or '-'",
            ));
        }
        if self.name.len() > 100 {
            return Err(invalid("name", "must be at most 100 characters"));
        }
        self.semver()?;
        Ok(())
    }

    fn validate_runtime(&self) -> Result<(), ManifestError> {
        if self.runtime.kind != RuntimeKind::Builtin && self.runtime.entrypoint.trim().is_empty() {
            return Err(ManifestError::MissingRequiredField(
                "runtime.entrypoint".to_string(),
            ));
        }
        let entry = Path::new(&self.runtime.entrypoint);
        if entry.is_absolute()
            || entry
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(invalid(
                "runtime.entrypoint",
                "must be a path inside the plugin directory",
            ));
        }
        if let Some(assets) = &self.assets {
            let assets = Path::new(assets);
            if assets.is_absolute()
                || assets
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(invalid("assets", "must be a path inside the plugin directory"));
            }
        }
        Ok(())
    }

    fn validate_endpoints(&self) -> Result<(), ManifestError> {
        if self.endpoints.len() > MAX_ENDPOINTS {
            return Err(invalid(
                "endpoints",
                &format!("at most {MAX_ENDPOINTS} endpoints allowed"),
            ));
        }

        let mut routes = HashSet::new();
        let mut handlers = HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint.path.starts_with('/') {
                return Err(invalid(
                    "endpoints.path",
                    &format!("'{}' must start with '/'", endpoint.path),
                ));
            }
            if endpoint.path.contains("..") || endpoint.path.contains("//") {
                return Err(invalid(
                    "endpoints.path",
                    &format!("'{}' is not a normalized path", endpoint.path),
                ));
            }
            let method = endpoint.http_method()?;
            if !is_identifier(&endpoint.handler) {
                return Err(invalid(
                    "endpoints.handler",
                    &format!("'{}' is not a valid handler name", endpoint.handler),
                ));
            }
            if !handlers.insert(endpoint.handler.as_str()) {
                return Err(invalid(
                    "endpoints.handler",
                    &format!("'{}' is bound to more than one endpoint", endpoint.handler),
                ));
            }
            if let Some(rate_limit) = &endpoint.rate_limit {
                if rate_limit.requests == 0 || rate_limit.window_ms == 0 {
                    return Err(invalid(
                        "endpoints.rate_limit",
                        "requests and window_ms must be positive",
                    ));
                }
            }
            if let Some(validation) = &endpoint.validation {
                validate_request_rules(validation)?;
            }

            let key = (method, normalize_path(&endpoint.path));
            if !routes.insert(key) {
                return Err(ManifestError::DuplicateEndpoint(format!(
                    "{} {}",
                    method, endpoint.path
                )));
            }
        }
        Ok(())
    }

    fn validate_permissions(&self) -> Result<(), ManifestError> {
        if self.permissions.len() > MAX_PERMISSIONS {
            return Err(invalid(
                "permissions",
                &format!("at most {MAX_PERMISSIONS} permissions allowed"),
            ));
        }
        let mut seen = HashSet::new();
        for permission in &self.permissions {
            let well_formed = permission
                .split_once('.')
                .is_some_and(|(resource, action)| {
                    !resource.is_empty()
                        && !action.is_empty()
                        && permission
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '*'))
                });
            if !well_formed {
                return Err(invalid(
                    "permissions",
                    &format!("'{permission}' must have the form resource.action"),
                ));
            }
            if !seen.insert(permission.as_str()) {
                return Err(invalid(
                    "permissions",
                    &format!("'{permission}' is listed twice"),
                ));
            }
        }
        Ok(())
    }

    fn validate_dependencies(&self) -> Result<(), ManifestError> {
        if self.dependencies.len() > MAX_DEPENDENCIES {
            return Err(invalid(
                "dependencies",
                &format!("at most {MAX_DEPENDENCIES} dependencies allowed"),
            ));
        }
        let mut seen = HashSet::new();
        for dependency in &self.dependencies {
            if dependency.id == self.id {
                return Err(invalid("dependencies", "a plugin cannot depend on itself"));
            }
            if !seen.insert(dependency.id.as_str()) {
                return Err(invalid(
                    "dependencies",
                    &format!("'{}' is listed twice", dependency.id),
                ));
            }
            parse_requirement("dependencies.version", &dependency.version)?;
        }
        Ok(())
    }

    fn validate_compatibility(&self, host_version: &semver::Version) -> Result<(), ManifestError> {
        for (key, raw) in &self.compatibility {
            parse_requirement(&format!("compatibility.{key}"), raw)?;
        }
        match self.host_requirement()? {
            Some(requirement) if !requirement.matches(host_version) => {
                Err(ManifestError::IncompatibleVersion {
                    host: host_version.to_string(),
                    required: requirement.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

fn validate_request_rules(validation: &ValidationSpec) -> Result<(), ManifestError> {
    if validation.required.iter().any(|field| field.trim().is_empty()) {
        return Err(invalid(
            "endpoints.validation",
            "required field names cannot be empty",
        ));
    }
    if let Some(unknown) = validation
        .content_types
        .iter()
        .find(|ct| !VALIDATED_CONTENT_TYPES.contains(&ct.as_str()))
    {
        return Err(invalid(
            "endpoints.validation",
            &format!("unsupported content type '{unknown}'"),
        ));
    }
    Ok(())
}

/// Parse a version with an optional leading `v`
pub fn parse_version(raw: &str) -> Result<semver::Version, ManifestError> {
    semver::Version::parse(raw.trim().trim_start_matches('v'))
        .map_err(|e| invalid("version", &format!("'{raw}' is not a semantic version: {e}")))
}

fn parse_requirement(field: &str, raw: &str) -> Result<semver::VersionReq, ManifestError> {
    semver::VersionReq::parse(raw.trim())
        .map_err(|e| invalid(field, &format!("'{raw}' is not a version range: {e}")))
}

/// Replace path parameters with a placeholder so `{a}` and `:b` compare equal
pub(crate) fn normalize_path(path: &str) -> String {
    path.trim_end_matches('/')
        .split('/')
        .map(|segment| {
            if (segment.starts_with('{') && segment.ends_with('}')) || segment.starts_with(':') {
                "{}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn invalid(field: &str, reason: &str) -> ManifestError {
    ManifestError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
