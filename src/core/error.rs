// ! Error types for the plugin host
// !
// ! Module defines the error taxonomy shared by every stage of the plugin
// ! lifecycle: acquiring code, validating manifests, loading, executing and
// ! unloading. Every variant maps to a stable machine-readable kind.

use thiserror::Error;

/// Failures while materializing a plugin from its source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source could not be fetched or read
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// The uploaded or downloaded archive is corrupt or of an unknown format
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    /// An archive entry would be written outside the extraction directory
    #[error("Archive entry escapes destination: {0}")]
    PathTraversal(String),

    /// Neither the root nor any first-level subdirectory holds a plugin
    #[error("Plugin manifest not found: {0}")]
    ManifestNotFound(String),

    /// The optional build step exited unsuccessfully
    #[error("Plugin build failed: {0}")]
    BuildFailed(String),

    /// Remote repository is not on the allow-list
    #[error("Repository not allowed: {0}")]
    NotAllowed(String),

    /// Archive exceeds the configured size ceiling
    #[error("Archive too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// The resolution ceiling elapsed
    #[error("Source resolution timed out after {0}s")]
    TimedOut(u64),

    /// A manifest was found but is unusable
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Failures while parsing or validating a plugin manifest
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// The descriptor is not valid YAML/JSON or has the wrong shape
    #[error("Malformed manifest: {0}")]
    Malformed(String),

    /// A required field is empty or absent
    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    /// A field is present but its value is unacceptable
    #[error("Invalid manifest field '{field}': {reason}")]
    Invalid { field: String, reason: String },

    /// The compatibility range excludes the running host
    #[error("Plugin requires host {required}, running {host}")]
    IncompatibleVersion { host: String, required: String },

    /// Two endpoints share a method and path
    #[error("Duplicate endpoint: {0}")]
    DuplicateEndpoint(String),
}

/// Failures while turning an artifact into a live instance
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// A plugin with the same id is already loaded
    #[error("Plugin already loaded: {0}")]
    DuplicateId(String),

    /// The executable artifact could not be opened
    #[error("Failed to open plugin code: {0}")]
    OpenFailed(String),

    /// The plugin's initialization hook failed
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    /// A declared endpoint collides with a route owned by another plugin
    #[error("Route {route} conflicts with plugin '{owner}'")]
    RouteConflict { route: String, owner: String },

    /// A declared dependency is not loaded or has the wrong version
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// The entrypoint does not hash to the declared checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The requested runtime is not compiled into this host
    #[error("Unsupported runtime: {0}")]
    UnsupportedRuntime(String),
}

/// The main error type for the plugin host
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error(transparent)]
    Source(SourceError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Load(#[from] LoadError),

    /// Plugin code panicked or crashed; the host kept running
    #[error("Plugin runtime fault: {0}")]
    RuntimeFault(String),

    /// Operation exceeded its time ceiling and was cancelled
    #[error("Operation '{operation}' timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Non-fatal failure while tearing a plugin down
    #[error("Unload error: {0}")]
    Unload(String),

    /// Caller lacks the scope required for the operation
    #[error("Permission denied: {0}")]
    Permission(String),

    /// No plugin with this id is known
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// The plugin is in a state that does not allow the operation
    #[error("Plugin '{id}' is {state}; cannot {operation}")]
    InvalidState {
        id: String,
        state: String,
        operation: String,
    },

    /// Durable registry failure
    #[error("Registry error: {0}")]
    Registry(String),

    /// Invalid host configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors from the standard library
    #[error("I/O error: {0}")]
    Io(String),

    /// The operation was cancelled before completing
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The endpoint's request quota is used up for this caller
    #[error("Rate limit exceeded for {route}; retry after {retry_after_secs}s")]
    RateLimited { route: String, retry_after_secs: u64 },

    /// The request does not satisfy the endpoint's validation rules
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SourceError> for PluginError {
    fn from(err: SourceError) -> Self {
        // Manifest failures surface the same way whichever resolver hit them
        match err {
            SourceError::Manifest(e) => PluginError::Manifest(e),
            other => PluginError::Source(other),
        }
    }
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        PluginError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ManifestError {
    fn from(err: serde_yaml::Error) -> Self {
        ManifestError::Malformed(err.to_string())
    }
}

impl From<semver::Error> for ManifestError {
    fn from(err: semver::Error) -> Self {
        ManifestError::Invalid {
            field: "version".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Unavailable(err.to_string())
    }
}

/// Result type alias for plugin host operations
pub type PluginResult<T> = Result<T, PluginError>;

impl PluginError {
    /// Create a new runtime fault
    pub fn runtime_fault<S: Into<String>>(message: S) -> Self {
        Self::RuntimeFault(message.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a new permission error
    pub fn permission<S: Into<String>>(message: S) -> Self {
        Self::Permission(message.into())
    }

    /// Create a new registry error
    pub fn registry<S: Into<String>>(message: S) -> Self {
        Self::Registry(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new invalid-state error
    pub fn invalid_state(id: &str, state: impl ToString, operation: &str) -> Self {
        Self::InvalidState {
            id: id.to_string(),
            state: state.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Machine-readable error kind exposed to API callers
    pub fn kind(&self) -> &'static str {
        match self {
            PluginError::Source(e) => match e {
                SourceError::Unavailable(_) => "source_unavailable",
                SourceError::InvalidArchive(_) => "invalid_archive",
                SourceError::PathTraversal(_) => "path_traversal",
                SourceError::ManifestNotFound(_) => "manifest_not_found",
                SourceError::BuildFailed(_) => "build_failed",
                SourceError::NotAllowed(_) => "source_not_allowed",
                SourceError::TooLarge { .. } => "archive_too_large",
                SourceError::TimedOut(_) => "source_timeout",
                SourceError::Manifest(e) => PluginError::Manifest(e.clone()).kind(),
            },
            PluginError::Manifest(e) => match e {
                ManifestError::Malformed(_) => "malformed_manifest",
                ManifestError::MissingRequiredField(_) => "missing_required_field",
                ManifestError::Invalid { .. } => "invalid_manifest",
                ManifestError::IncompatibleVersion { .. } => "incompatible_version",
                ManifestError::DuplicateEndpoint(_) => "duplicate_endpoint",
            },
            PluginError::Load(e) => match e {
                LoadError::DuplicateId(_) => "duplicate_id",
                LoadError::OpenFailed(_) => "load_failure",
                LoadError::InitializationFailed(_) => "initialization_failed",
                LoadError::RouteConflict { .. } => "route_conflict",
                LoadError::MissingDependency(_) => "missing_dependency",
                LoadError::ChecksumMismatch { .. } => "checksum_mismatch",
                LoadError::UnsupportedRuntime(_) => "unsupported_runtime",
            },
            PluginError::RuntimeFault(_) => "runtime_fault",
            PluginError::Timeout { .. } => "timeout",
            PluginError::Unload(_) => "unload_error",
            PluginError::Permission(_) => "permission_denied",
            PluginError::NotFound(_) => "not_found",
            PluginError::InvalidState { .. } => "invalid_state",
            PluginError::Registry(_) => "registry_error",
            PluginError::Config(_) => "config_error",
            PluginError::Serialization(_) => "serialization_error",
            PluginError::Io(_) => "io_error",
            PluginError::Cancelled(_) => "cancelled",
            PluginError::RateLimited { .. } => "rate_limited",
            PluginError::InvalidRequest(_) => "invalid_request",
            PluginError::Internal(_) => "internal_error",
        }
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            PluginError::Source(_) => "source",
            PluginError::Manifest(_) => "manifest",
            PluginError::Load(_) => "load",
            PluginError::RuntimeFault(_) => "runtime",
            PluginError::Timeout { .. } => "timeout",
            PluginError::Unload(_) => "unload",
            PluginError::Permission(_) => "permission",
            PluginError::NotFound(_) | PluginError::InvalidState { .. } => "lifecycle",
            PluginError::Registry(_) => "registry",
            PluginError::Config(_) => "config",
            PluginError::Serialization(_) | PluginError::Io(_) => "io",
            PluginError::Cancelled(_) => "cancelled",
            PluginError::RateLimited { .. } | PluginError::InvalidRequest(_) => "request",
            PluginError::Internal(_) => "internal",
        }
    }

    /// Check if retrying the same request could succeed
    ///
    /// Source, manifest and load failures describe the plugin itself and are
    /// never retried automatically.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PluginError::Source(SourceError::Unavailable(_))
            | PluginError::Source(SourceError::TimedOut(_)) => true,
            PluginError::Timeout { .. } => true,
            PluginError::Io(_) => true,
            PluginError::Registry(_) => true,
            PluginError::InvalidState { .. } => true,
            PluginError::RateLimited { .. } => true,
            _ => false,
        }
    }

    /// HTTP status code used by the REST surface
    pub fn http_status(&self) -> u16 {
        match self {
            PluginError::Permission(_) => 403,
            PluginError::NotFound(_) => 404,
            PluginError::Load(LoadError::DuplicateId(_)) | PluginError::InvalidState { .. } => 409,
            PluginError::Manifest(_) | PluginError::Source(SourceError::Manifest(_)) => 400,
            PluginError::InvalidRequest(_) => 400,
            PluginError::RateLimited { .. } => 429,
            PluginError::Source(SourceError::InvalidArchive(_))
            | PluginError::Source(SourceError::PathTraversal(_))
            | PluginError::Source(SourceError::ManifestNotFound(_))
            | PluginError::Source(SourceError::NotAllowed(_))
            | PluginError::Source(SourceError::TooLarge { .. }) => 400,
            PluginError::Serialization(_) => 400,
            PluginError::Timeout { .. } | PluginError::Source(SourceError::TimedOut(_)) => 504,
            _ => 500,
        }
    }
}
