//! Execution handles
//!
//! Every loaded plugin owns one [`ExecutionHandle`]: an opaque capability to
//! invoke handlers, probe health and shut the plugin down. Variants differ in
//! how code runs and in what unloading means:
//!
//! | Runtime   | Code                        | Unload                       |
//! |-----------|-----------------------------|------------------------------|
//! | `native`  | dynamic library             | library closed ([`UnloadSemantics::Released`]) |
//! | `wasm`    | WASM module                 | engine instance dropped      |
//! | `process` | supervised subprocess       | process killed               |
//! | `builtin` | factory compiled into host  | instance dropped, code stays ([`UnloadSemantics::Simulated`]) |

pub mod builtin;
#[cfg(feature = "native")]
pub mod native;
pub mod process;
#[cfg(feature = "wasm")]
pub mod wasm;

use crate::core::error::{LoadError, PluginResult};
use crate::plugin::api::{PluginContext, PluginModule, PluginRequest, PluginResponse};
use crate::plugin::manifest::{PluginManifest, RuntimeKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use builtin::BuiltinCatalog;

/// What unloading a plugin actually reclaims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnloadSemantics {
    /// Code and state are released from the host process
    Released,
    /// State is dropped but code stays mapped in the host
    Simulated,
}

/// Opaque capability to a running plugin
#[async_trait]
pub trait ExecutionHandle: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn unload_semantics(&self) -> UnloadSemantics;

    /// Handlers the plugin serves; `None` when the runtime cannot enumerate them
    fn handlers(&self) -> Option<Vec<String>>;

    /// Run the plugin's initialization hook
    async fn initialize(&self, context: PluginContext) -> PluginResult<()>;

    /// Invoke a handler by name
    async fn invoke(&self, handler: &str, request: PluginRequest) -> PluginResult<PluginResponse>;

    /// Liveness check; an error carries the reason
    async fn health(&self) -> PluginResult<()>;

    /// Run the plugin's cleanup hook and release runtime resources
    async fn shutdown(&self) -> PluginResult<()>;
}

/// Open the code an artifact points at
pub async fn open(
    manifest: &PluginManifest,
    entrypoint: Option<&Path>,
    builtins: &BuiltinCatalog,
) -> Result<Arc<dyn ExecutionHandle>, LoadError> {
    let require_entrypoint = || {
        entrypoint.ok_or_else(|| LoadError::OpenFailed("artifact has no entrypoint".to_string()))
    };

    match manifest.runtime.kind {
        RuntimeKind::Builtin => builtins.instantiate(manifest.entrypoint()),
        RuntimeKind::Process => {
            let handle = process::ProcessHandle::spawn(manifest, require_entrypoint()?).await?;
            Ok(Arc::new(handle))
        }
        #[cfg(feature = "native")]
        RuntimeKind::Native => {
            let path = require_entrypoint()?.to_path_buf();
            // dlopen runs library constructors; keep it off the async workers
            let handle = tokio::task::spawn_blocking(move || native::NativeHandle::open(&path))
                .await
                .map_err(|e| LoadError::OpenFailed(format!("library loader task failed: {e}")))??;
            Ok(Arc::new(handle))
        }
        #[cfg(not(feature = "native"))]
        RuntimeKind::Native => Err(LoadError::UnsupportedRuntime(
            "native (built without the `native` feature)".to_string(),
        )),
        #[cfg(feature = "wasm")]
        RuntimeKind::Wasm => {
            let path = require_entrypoint()?.to_path_buf();
            let handlers = manifest.handler_names();
            let handle =
                tokio::task::spawn_blocking(move || wasm::WasmHandle::open(&path, handlers))
                    .await
                    .map_err(|e| LoadError::OpenFailed(format!("wasm loader task failed: {e}")))??;
            Ok(Arc::new(handle))
        }
        #[cfg(not(feature = "wasm"))]
        RuntimeKind::Wasm => Err(LoadError::UnsupportedRuntime(
            "wasm (built without the `wasm` feature)".to_string(),
        )),
    }
}

/// Shared wrapper around an in-process [`PluginModule`]
pub struct ModuleHandle {
    module: RwLock<Box<dyn PluginModule>>,
    handlers: Vec<String>,
    kind: RuntimeKind,
    semantics: UnloadSemantics,
}

impl ModuleHandle {
    pub fn new(module: Box<dyn PluginModule>, kind: RuntimeKind, semantics: UnloadSemantics) -> Self {
        let handlers = module.handlers();
        Self {
            module: RwLock::new(module),
            handlers,
            kind,
            semantics,
        }
    }
}

#[async_trait]
impl ExecutionHandle for ModuleHandle {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn unload_semantics(&self) -> UnloadSemantics {
        self.semantics
    }

    fn handlers(&self) -> Option<Vec<String>> {
        Some(self.handlers.clone())
    }

    async fn initialize(&self, context: PluginContext) -> PluginResult<()> {
        self.module.write().await.initialize(context).await
    }

    async fn invoke(&self, handler: &str, request: PluginRequest) -> PluginResult<PluginResponse> {
        self.module.read().await.handle(handler, request).await
    }

    async fn health(&self) -> PluginResult<()> {
        self.module.read().await.health_check().await
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.module.write().await.shutdown().await
    }
}
