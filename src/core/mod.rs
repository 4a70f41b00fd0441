// ! Core host infrastructure
// !
// ! Module contains the error taxonomy, configuration, logging setup and
// ! caller capabilities shared by the plugin runtime and the REST surface.

pub mod auth;
pub mod config;
pub mod error;
pub mod logging;

pub use auth::{Capabilities, PLUGINS_RESOURCE, Scope};
pub use config::HostConfig;
pub use error::{LoadError, ManifestError, PluginError, PluginResult, SourceError};
