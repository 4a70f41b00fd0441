// ! Plugin API definitions
// !
// ! Module defines the trait in-process plugins implement, the request and
// ! response types exchanged with every runtime, and the export macro used by
// ! native plugin libraries.

use crate::core::error::PluginResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// ABI revision native libraries must report through `_plugin_host_abi_version`
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Symbol returning a boxed [`PluginModule`]
pub const CREATE_SYMBOL: &[u8] = b"_plugin_host_create\0";

/// Symbol returning [`PLUGIN_ABI_VERSION`]
pub const ABI_VERSION_SYMBOL: &[u8] = b"_plugin_host_abi_version\0";

/// Core trait implemented by in-process plugins (native and builtin)
#[async_trait]
pub trait PluginModule: Send + Sync {
    /// Handler names this module can serve
    fn handlers(&self) -> Vec<String>;

    /// Serve one request routed to `handler`
    async fn handle(&self, handler: &str, request: PluginRequest) -> PluginResult<PluginResponse>;

    /// Initialize the plugin (called once after loading)
    async fn initialize(&mut self, _context: PluginContext) -> PluginResult<()> {
        Ok(())
    }

    /// Check if the plugin is healthy
    async fn health_check(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Shutdown the plugin (called before unloading)
    async fn shutdown(&mut self) -> PluginResult<()> {
        Ok(())
    }
}

/// Plugin factory function type exported by native libraries
pub type PluginFactory = unsafe extern "C" fn() -> *mut Box<dyn PluginModule>;

/// Capability-scoped view of the host handed to a plugin at initialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginContext {
    pub plugin_id: String,
    pub instance_id: String,
    pub version: String,
    pub host_version: String,

    /// Scopes granted to this plugin
    pub permissions: Vec<String>,

    /// The manifest's `configuration` section
    pub configuration: HashMap<String, Value>,

    /// Private writable directory for this instance
    pub data_dir: PathBuf,

    /// Cancelled when the host abandons the operation or unloads the plugin
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

impl PluginContext {
    /// Whether `permission` was granted, honouring `resource.*` wildcards
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|granted| {
            granted == permission
                || granted
                    .strip_suffix(".*")
                    .is_some_and(|resource| {
                        permission
                            .strip_prefix(resource)
                            .is_some_and(|rest| rest.starts_with('.'))
                    })
        })
    }

    /// Look up a configuration value
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.configuration.get(key)
    }
}

/// Request routed to a plugin handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginRequest {
    pub method: String,
    /// Path relative to the plugin route prefix
    pub path: String,
    /// Values captured by `{param}` segments
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// Response produced by a plugin handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

fn default_status() -> u16 {
    200
}

impl PluginResponse {
    /// 200 response with a JSON body
    pub fn ok(body: Value) -> Self {
        Self::with_status(200, body)
    }

    /// Response with an explicit status
    pub fn with_status(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    /// Add a response header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Export a [`PluginModule`] implementation from a native plugin library
///
/// The type must implement `Default`. Construction panics are caught and
/// reported to the host as a null module.
#[macro_export]
macro_rules! export_plugin {
    ($plugin_type:ty) => {
        /// ABI revision this library was built against
        #[unsafe(no_mangle)]
        pub extern "C" fn _plugin_host_abi_version() -> u32 {
            $crate::plugin::api::PLUGIN_ABI_VERSION
        }

        /// Plugin creation function with C ABI
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn _plugin_host_create()
        -> *mut Box<dyn $crate::plugin::api::PluginModule> {
            match std::panic::catch_unwind(|| {
                let module: Box<dyn $crate::plugin::api::PluginModule> =
                    Box::new(<$plugin_type>::default());
                module
            }) {
                Ok(module) => Box::into_raw(Box::new(module)),
                Err(_) => std::ptr::null_mut(),
            }
        }
    };
}
