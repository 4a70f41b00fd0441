//! Native dynamic library runtime
//!
//! Module handles the low-level loading of plugin libraries from disk.
//! Libraries export the symbols generated by [`export_plugin!`](crate::export_plugin).
//! The library stays open for as long as any clone of the handle is alive,
//! so an in-flight request never calls into unmapped code.

use super::{ExecutionHandle, ModuleHandle, UnloadSemantics};
use crate::core::error::{LoadError, PluginResult};
use crate::plugin::api::{
    ABI_VERSION_SYMBOL, CREATE_SYMBOL, PLUGIN_ABI_VERSION, PluginContext, PluginFactory,
    PluginRequest, PluginResponse,
};
use crate::plugin::manifest::RuntimeKind;
use async_trait::async_trait;
use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Plugin loaded from a dynamic library
pub struct NativeHandle {
    module: ModuleHandle,
    path: PathBuf,
    // Declared after `module`: fields drop in order, so the module's drop
    // glue runs while its code is still mapped.
    _library: Library,
}

impl NativeHandle {
    /// Open a library and build its module. Blocking.
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        info!("Loading native plugin from: {:?}", path);

        // SAFETY: loading runs the library's initializers; plugins are trusted
        // to the same degree as any code the operator installs.
        let library = unsafe {
            Library::new(path).map_err(|e| {
                error!("Failed to load library: {}", e);
                LoadError::OpenFailed(format!("{}: {e}", path.display()))
            })?
        };

        let abi = {
            // SAFETY: symbol type matches the signature generated by export_plugin!
            let version: Symbol<extern "C" fn() -> u32> = unsafe {
                library.get(ABI_VERSION_SYMBOL).map_err(|e| {
                    LoadError::OpenFailed(format!("missing _plugin_host_abi_version export: {e}"))
                })?
            };
            version()
        };
        if abi != PLUGIN_ABI_VERSION {
            return Err(LoadError::OpenFailed(format!(
                "plugin ABI {abi} is not supported (host ABI {PLUGIN_ABI_VERSION})"
            )));
        }

        let module = {
            // SAFETY: as above; the factory returns a leaked Box we take back
            let create: Symbol<PluginFactory> = unsafe {
                library.get(CREATE_SYMBOL).map_err(|e| {
                    LoadError::OpenFailed(format!("missing _plugin_host_create export: {e}"))
                })?
            };
            let raw = unsafe { create() };
            if raw.is_null() {
                return Err(LoadError::OpenFailed(
                    "plugin creation returned null".to_string(),
                ));
            }
            *unsafe { Box::from_raw(raw) }
        };

        debug!(path = %path.display(), "Native plugin module created");
        Ok(Self {
            module: ModuleHandle::new(module, RuntimeKind::Native, UnloadSemantics::Released),
            path: path.to_path_buf(),
            _library: library,
        })
    }

    /// Library file backing this handle
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ExecutionHandle for NativeHandle {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Native
    }

    fn unload_semantics(&self) -> UnloadSemantics {
        UnloadSemantics::Released
    }

    fn handlers(&self) -> Option<Vec<String>> {
        self.module.handlers()
    }

    async fn initialize(&self, context: PluginContext) -> PluginResult<()> {
        self.module.initialize(context).await
    }

    async fn invoke(&self, handler: &str, request: PluginRequest) -> PluginResult<PluginResponse> {
        self.module.invoke(handler, request).await
    }

    async fn health(&self) -> PluginResult<()> {
        self.module.health().await
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.module.shutdown().await
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        info!("Native plugin library released: {:?}", self.path);
    }
}
