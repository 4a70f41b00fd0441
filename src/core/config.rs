// ! Host configuration
// !
// ! Module defines the YAML configuration of the plugin host together with
// ! environment overrides and validation.

use crate::core::error::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration of the plugin host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Version plugins are checked against; defaults to the crate version
    #[serde(default = "default_host_version")]
    pub host_version: String,

    /// Directory holding installed plugin artifacts
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Registry file; `None` keeps the registry in memory only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,

    /// Address the REST surface binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prefix under which plugin endpoints are served
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Reload plugins recorded in the registry at startup
    #[serde(default = "default_auto_load")]
    pub auto_load: bool,

    /// Watch local plugin sources and reload on change
    #[serde(default)]
    pub hot_reload: bool,

    #[serde(default)]
    pub limits: LimitSettings,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Time and size ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Ceiling for load/unload/reload/enable/disable (seconds)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Ceiling for a single plugin endpoint invocation (seconds)
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_secs: u64,

    /// Ceiling for a plugin's shutdown hook (seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Largest accepted archive, compressed or uncompressed (bytes)
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,

    /// Sample process memory around mutating operations
    #[serde(default = "default_track_memory")]
    pub track_memory: bool,

    /// Extra time a timed-out operation gets to unwind after it is aborted
    /// (milliseconds); callers wait at most the ceiling plus this grace
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,
}

/// Remote repository resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Ceiling for fetch plus build (seconds)
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,

    /// URL prefixes that may be fetched; empty allows any
    #[serde(default)]
    pub allowed_repos: Vec<String>,

    /// Git executable used for clones
    #[serde(default = "default_git_binary")]
    pub git_binary: String,

    /// Run the manifest's build step after fetching
    #[serde(default = "default_allow_build")]
    pub allow_build: bool,
}

/// Periodic health probing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Consecutive successes before reporting healthy
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failures before reporting unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_route_prefix() -> String {
    "/api/plugins".to_string()
}

fn default_auto_load() -> bool {
    true
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_invoke_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_max_archive_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_track_memory() -> bool {
    true
}

fn default_cancel_grace() -> u64 {
    250
}

fn default_remote_timeout() -> u64 {
    120
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_allow_build() -> bool {
    true
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_version: default_host_version(),
            plugin_dir: default_plugin_dir(),
            registry_path: None,
            bind_addr: default_bind_addr(),
            route_prefix: default_route_prefix(),
            auto_load: default_auto_load(),
            hot_reload: false,
            limits: LimitSettings::default(),
            remote: RemoteSettings::default(),
            health: HealthSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout(),
            invoke_timeout_secs: default_invoke_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_archive_bytes: default_max_archive_bytes(),
            track_memory: default_track_memory(),
            cancel_grace_ms: default_cancel_grace(),
        }
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_remote_timeout(),
            allowed_repos: Vec::new(),
            git_binary: default_git_binary(),
            allow_build: default_allow_build(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval_secs: default_health_interval(),
            probe_timeout_secs: default_probe_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LimitSettings {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl RemoteSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether `url` starts with one of the allowed prefixes
    pub fn is_allowed(&self, url: &str) -> bool {
        self.allowed_repos.is_empty()
            || self
                .allowed_repos
                .iter()
                .any(|prefix| url.starts_with(prefix.as_str()))
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl HostConfig {
    /// Load configuration from a YAML file
    pub async fn from_file(path: impl AsRef<Path>) -> PluginResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            PluginError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> PluginResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| PluginError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("PLUGIN_DIR") {
            self.plugin_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("PLUGIN_REGISTRY_PATH") {
            self.registry_path = Some(PathBuf::from(path));
        }
        if let Some(addr) = lookup("PLUGIN_HOST_BIND") {
            self.bind_addr = addr;
        }
        if let Some(repos) = lookup("PLUGIN_ALLOWED_REPOS") {
            self.remote.allowed_repos = repos
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(flag) = lookup("AUTO_LOAD_PLUGINS") {
            self.auto_load = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Check the configuration for values the host cannot run with
    pub fn validate(&self) -> PluginResult<()> {
        self.parsed_host_version()?;

        if !self.route_prefix.starts_with('/') || self.route_prefix.ends_with('/') {
            return Err(PluginError::Config(format!(
                "route_prefix must start with '/' and not end with '/': {}",
                self.route_prefix
            )));
        }
        if self.limits.operation_timeout_secs == 0 || self.limits.invoke_timeout_secs == 0 {
            return Err(PluginError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.health.healthy_threshold == 0 || self.health.unhealthy_threshold == 0 {
            return Err(PluginError::Config(
                "health thresholds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Host version as semver
    pub fn parsed_host_version(&self) -> PluginResult<semver::Version> {
        semver::Version::parse(self.host_version.trim_start_matches('v')).map_err(|e| {
            PluginError::Config(format!("invalid host_version '{}': {e}", self.host_version))
        })
    }
}
