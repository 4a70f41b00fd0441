//! WASM runtime backed by Extism
//!
//! Each declared handler is an exported guest function taking the JSON
//! encoded [`PluginRequest`] and returning a JSON [`PluginResponse`] (or a bare
//! JSON body). Optional `initialize`, `health` and `shutdown` exports are
//! called when present.

use super::{ExecutionHandle, UnloadSemantics};
use crate::core::error::{LoadError, PluginError, PluginResult};
use crate::plugin::api::{PluginContext, PluginRequest, PluginResponse};
use crate::plugin::manifest::RuntimeKind;
use async_trait::async_trait;
use extism::{Manifest, Plugin, Wasm};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Plugin instantiated in a WASM sandbox
pub struct WasmHandle {
    plugin: Arc<Mutex<Plugin>>,
    handlers: Vec<String>,
    path: PathBuf,
}

impl WasmHandle {
    /// Compile and instantiate the module. Blocking.
    pub fn open(path: &Path, declared: Vec<String>) -> Result<Self, LoadError> {
        info!("Loading wasm plugin from: {:?}", path);
        let manifest = Manifest::new([Wasm::file(path)]);
        let plugin = Plugin::new(&manifest, [], true)
            .map_err(|e| LoadError::OpenFailed(format!("{}: {e}", path.display())))?;

        let handlers = declared
            .into_iter()
            .filter(|name| plugin.function_exists(name))
            .collect::<Vec<_>>();
        debug!(path = %path.display(), ?handlers, "Wasm exports resolved");

        Ok(Self {
            plugin: Arc::new(Mutex::new(plugin)),
            handlers,
            path: path.to_path_buf(),
        })
    }

    async fn call(&self, function: &'static str, input: String) -> PluginResult<Option<String>> {
        self.call_named(function.to_string(), input, true).await
    }

    async fn call_named(
        &self,
        function: String,
        input: String,
        optional: bool,
    ) -> PluginResult<Option<String>> {
        let plugin = Arc::clone(&self.plugin);
        tokio::task::spawn_blocking(move || {
            let mut plugin = plugin
                .lock()
                .map_err(|_| PluginError::runtime_fault("wasm instance poisoned"))?;
            if !plugin.function_exists(&function) {
                if optional {
                    return Ok(None);
                }
                return Err(PluginError::not_found(format!("handler '{function}'")));
            }
            plugin
                .call::<String, String>(&function, input)
                .map(Some)
                .map_err(|e| PluginError::runtime_fault(format!("wasm call '{function}' trapped: {e}")))
        })
        .await
        .map_err(|e| PluginError::runtime_fault(format!("wasm task failed: {e}")))?
    }
}

#[async_trait]
impl ExecutionHandle for WasmHandle {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Wasm
    }

    fn unload_semantics(&self) -> UnloadSemantics {
        UnloadSemantics::Released
    }

    fn handlers(&self) -> Option<Vec<String>> {
        Some(self.handlers.clone())
    }

    async fn initialize(&self, context: PluginContext) -> PluginResult<()> {
        self.call("initialize", serde_json::to_string(&context)?)
            .await
            .map(|_| ())
    }

    async fn invoke(&self, handler: &str, request: PluginRequest) -> PluginResult<PluginResponse> {
        let output = self
            .call_named(handler.to_string(), serde_json::to_string(&request)?, false)
            .await?
            .unwrap_or_default();
        let value: Value = if output.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&output).unwrap_or(Value::String(output))
        };
        match serde_json::from_value::<PluginResponse>(value.clone()) {
            Ok(response) if value.get("body").is_some() || value.get("status").is_some() => {
                Ok(response)
            }
            _ => Ok(PluginResponse::ok(value)),
        }
    }

    async fn health(&self) -> PluginResult<()> {
        self.call("health", String::new()).await.map(|_| ())
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.call("shutdown", String::new()).await.map(|_| ())
    }
}

impl Drop for WasmHandle {
    fn drop(&mut self) {
        info!("Wasm plugin instance released: {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.wasm");
        std::fs::write(&path, b"\0asm garbage").unwrap();
        assert!(matches!(
            WasmHandle::open(&path, vec!["run".to_string()]),
            Err(LoadError::OpenFailed(_))
        ));
    }
}
