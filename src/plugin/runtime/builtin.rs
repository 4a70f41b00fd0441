//! Builtin plugin factories
//!
//! Plugins compiled into the host register a factory under a name. Each
//! load builds a fresh module, so no state survives an unload even though
//! the code stays in the binary.

use super::{ExecutionHandle, ModuleHandle, UnloadSemantics};
use crate::core::error::LoadError;
use crate::plugin::api::PluginModule;
use crate::plugin::manifest::RuntimeKind;
use std::collections::HashMap;
use std::sync::Arc;

type Factory = Arc<dyn Fn() -> Box<dyn PluginModule> + Send + Sync>;

/// Named factories for builtin plugins
#[derive(Clone, Default)]
pub struct BuiltinCatalog {
    factories: HashMap<String, Factory>,
}

impl BuiltinCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn PluginModule> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn PluginModule> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Register a `Default` module type under `name`
    pub fn with_default<T>(self, name: impl Into<String>) -> Self
    where
        T: PluginModule + Default + 'static,
    {
        self.with(name, || Box::new(T::default()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a fresh module behind an execution handle
    pub fn instantiate(&self, name: &str) -> Result<Arc<dyn ExecutionHandle>, LoadError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LoadError::OpenFailed(format!("no builtin plugin named '{name}'")))?;
        let module = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| factory()))
            .map_err(|_| LoadError::OpenFailed(format!("builtin factory '{name}' panicked")))?;
        Ok(Arc::new(ModuleHandle::new(
            module,
            RuntimeKind::Builtin,
            UnloadSemantics::Simulated,
        )))
    }
}

impl std::fmt::Debug for BuiltinCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinCatalog")
            .field("factories", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::PluginResult;
    use crate::plugin::api::{PluginRequest, PluginResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl PluginModule for Counter {
        fn handlers(&self) -> Vec<String> {
            vec!["count".to_string()]
        }

        async fn handle(&self, _handler: &str, _request: PluginRequest) -> PluginResult<PluginResponse> {
            let hits = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(PluginResponse::ok(json!({ "hits": hits })))
        }
    }

    #[tokio::test]
    async fn test_each_instance_is_fresh() {
        let catalog = BuiltinCatalog::new().with_default::<Counter>("counter");

        let first = catalog.instantiate("counter").unwrap();
        first.invoke("count", PluginRequest::default()).await.unwrap();
        let response = first.invoke("count", PluginRequest::default()).await.unwrap();
        assert_eq!(response.body, json!({"hits": 2}));

        let second = catalog.instantiate("counter").unwrap();
        let response = second.invoke("count", PluginRequest::default()).await.unwrap();
        assert_eq!(response.body, json!({"hits": 1}));
        assert_eq!(second.unload_semantics(), UnloadSemantics::Simulated);
        assert_eq!(second.handlers(), Some(vec!["count".to_string()]));
    }

    #[test]
    fn test_unknown_builtin() {
        let catalog = BuiltinCatalog::new();
        assert!(matches!(
            catalog.instantiate("missing"),
            Err(LoadError::OpenFailed(_))
        ));
    }

    #[test]
    fn test_panicking_factory() {
        let catalog = BuiltinCatalog::new().with("broken", || -> Box<dyn PluginModule> {
            panic!("factory exploded")
        });
        assert!(matches!(
            catalog.instantiate("broken"),
            Err(LoadError::OpenFailed(_))
        ));
    }
}
