//! Plugin runtime
//!
//! This module loads third-party code at runtime and manages it for the
//! lifetime of the host:
//!
//! - Resolving plugins from local directories, archives and remote repositories
//! - Validating manifests against the host version and loaded dependencies
//! - Opening native libraries, WASM modules, subprocesses and builtins
//! - Serialized, fault-contained lifecycle operations
//! - Route binding, health probing and hot reloading

pub mod api;
pub mod executor;
pub mod health;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod routes;
pub mod runtime;
pub mod source;
pub mod store;
pub mod types;
#[cfg(feature = "watch")]
pub mod watcher;


pub use api::{PluginContext, PluginModule, PluginRequest, PluginResponse};
pub use executor::SafeExecutor;
pub use health::{HealthReporter, HealthStatus, ProbeResult};
pub use loader::PluginLoader;
pub use manager::{PluginManager, PluginManagerBuilder, RestoreReport, UninstallReport, UninstallStatus};
pub use manifest::PluginManifest;
pub use metrics::{MetricsSummary, PluginStats};
pub use registry::{FileRegistry, InMemoryRegistry, PluginRecord, RecordStatus, RegistryStore};
pub use routes::RouteTable;
pub use runtime::{BuiltinCatalog, ExecutionHandle, UnloadSemantics};
pub use source::SourceDescriptor;
pub use types::*;
#[cfg(feature = "watch")]
pub use watcher::PluginWatcher;

// Re-export the macro
pub use crate::export_plugin;

/// Plugin lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    /// Plugin was loaded
    Loaded { plugin_id: String, version: String },

    /// Plugin was unloaded
    Unloaded { plugin_id: String },

    /// Plugin was replaced by new code
    Reloaded { plugin_id: String, version: String },

    Enabled { plugin_id: String },

    Disabled { plugin_id: String },

    /// Plugin files and registry entry were removed
    Uninstalled { plugin_id: String },

    /// Plugin encountered an error
    Error { plugin_id: String, error: String },
}

impl PluginEvent {
    pub fn plugin_id(&self) -> &str {
        match self {
            PluginEvent::Loaded { plugin_id, .. }
            | PluginEvent::Unloaded { plugin_id }
            | PluginEvent::Reloaded { plugin_id, .. }
            | PluginEvent::Enabled { plugin_id }
            | PluginEvent::Disabled { plugin_id }
            | PluginEvent::Uninstalled { plugin_id }
            | PluginEvent::Error { plugin_id, .. } => plugin_id,
        }
    }
}
