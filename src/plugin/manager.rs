// ! High-level plugin manager
// !
// ! Module owns the plugin lifecycle. Every mutating operation runs through
// ! the safe executor, which serializes them system-wide; results are
// ! committed to the route table, the instance table and the registry while
// ! the executor lock is still held.

use crate::core::config::HostConfig;
use crate::core::error::{LoadError, PluginError, PluginResult};
use crate::core::logging::{ErrorContext, log_plugin_error};
use crate::plugin::api::{PluginModule, PluginRequest, PluginResponse};
use crate::plugin::executor::SafeExecutor;
use crate::plugin::loader::{LoadContext, PluginLoader, PreparedPlugin};
use crate::plugin::metrics::{MetricsSummary, PluginMetrics};
use crate::plugin::registry::{FileRegistry, InMemoryRegistry, PluginRecord, RecordStatus, RegistryStore};
use crate::plugin::routes::RouteTable;
use crate::plugin::runtime::{BuiltinCatalog, ExecutionHandle};
use crate::plugin::source::{ResolverSet, SourceDescriptor, SourceResolver};
use crate::plugin::store::PluginStore;
use crate::plugin::PluginEvent;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub use crate::plugin::types::{LifecycleState, PluginInfo, PluginInstance, PluginStatus, PluginSummary};

/// Type alias for event handlers to reduce complexity
type EventHandlers = Vec<Box<dyn Fn(PluginEvent) + Send + Sync>>;

/// Outcome of an uninstall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UninstallStatus {
    Completed,
    Partial,
}

/// Per-step report of an uninstall
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UninstallReport {
    pub plugin_id: String,
    pub status: UninstallStatus,
    pub completed: Vec<String>,
    /// Failed steps with their reasons
    pub failed: Vec<(String, String)>,
}

/// Result of restoring plugins from the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Transitional states visible while an operation is in flight
#[derive(Debug, Clone, Default)]
struct PendingStates {
    states: Arc<StdMutex<HashMap<String, (LifecycleState, u64)>>>,
}

impl PendingStates {
    fn mark(&self, id: &str, state: LifecycleState, generation: u64) -> PendingGuard {
        if let Ok(mut states) = self.states.lock() {
            states.insert(id.to_string(), (state, generation));
        }
        PendingGuard {
            states: self.clone(),
            id: id.to_string(),
            generation,
        }
    }

    fn get(&self, id: &str) -> Option<LifecycleState> {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(id).map(|(state, _)| *state))
    }
}

/// Clears a pending state when the operation that set it ends
struct PendingGuard {
    states: PendingStates,
    id: String,
    generation: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut states) = self.states.states.lock() {
            // A later operation may already own the entry
            if states.get(&self.id).is_some_and(|(_, g)| *g == self.generation) {
                states.remove(&self.id);
            }
        }
    }
}

struct ManagerInner {
    config: HostConfig,
    executor: SafeExecutor,
    resolvers: ResolverSet,
    loader: PluginLoader,
    registry: Arc<dyn RegistryStore>,
    routes: Arc<RouteTable>,
    instances: RwLock<HashMap<String, PluginInstance>>,
    pending: PendingStates,
    event_handlers: RwLock<EventHandlers>,
}

/// Builder for [`PluginManager`]
pub struct PluginManagerBuilder {
    config: HostConfig,
    registry: Option<Arc<dyn RegistryStore>>,
    builtins: BuiltinCatalog,
    resolvers: Vec<Arc<dyn SourceResolver>>,
}

impl PluginManagerBuilder {
    /// Use a specific registry store; defaults to in-memory
    pub fn registry(mut self, registry: Arc<dyn RegistryStore>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Factories for `builtin` runtime plugins
    pub fn builtins(mut self, builtins: BuiltinCatalog) -> Self {
        self.builtins = builtins;
        self
    }

    /// Register one builtin factory
    pub fn builtin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn PluginModule> + Send + Sync + 'static,
    {
        self.builtins.register(name, factory);
        self
    }

    /// Override the resolver for the source kind it handles
    pub fn resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn build(self) -> PluginResult<PluginManager> {
        self.config.validate()?;
        let host_version = self.config.parsed_host_version()?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(InMemoryRegistry::new()));
        let routes = Arc::new(RouteTable::new());
        let store = PluginStore::new(&self.config.plugin_dir);
        let loader = PluginLoader::new(
            host_version,
            self.builtins,
            store,
            routes.clone(),
            registry.clone(),
        );
        let resolvers = self
            .resolvers
            .into_iter()
            .try_fold(ResolverSet::from_config(&self.config)?, |set, resolver| {
                Ok::<_, PluginError>(set.with_resolver(resolver))
            })?;

        Ok(PluginManager {
            inner: Arc::new(ManagerInner {
                executor: SafeExecutor::new(self.config.limits.track_memory)
                    .with_cancel_grace(self.config.limits.cancel_grace()),
                config: self.config,
                resolvers,
                loader,
                registry,
                routes,
                instances: RwLock::new(HashMap::new()),
                pending: PendingStates::default(),
                event_handlers: RwLock::new(Vec::new()),
            }),
        })
    }
}

/// Plugin manager for the host
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

impl PluginManager {
    pub fn builder(config: HostConfig) -> PluginManagerBuilder {
        PluginManagerBuilder {
            config,
            registry: None,
            builtins: BuiltinCatalog::new(),
            resolvers: Vec::new(),
        }
    }

    /// Build a manager with the registry the configuration names
    pub async fn open(config: HostConfig, builtins: BuiltinCatalog) -> PluginResult<Self> {
        let registry: Arc<dyn RegistryStore> = match &config.registry_path {
            Some(path) => Arc::new(FileRegistry::open(path).await?),
            None => Arc::new(InMemoryRegistry::new()),
        };
        Self::builder(config)
            .registry(registry)
            .builtins(builtins)
            .build()
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.inner.routes
    }

    pub fn registry(&self) -> &Arc<dyn RegistryStore> {
        &self.inner.registry
    }

    pub fn executor(&self) -> &SafeExecutor {
        &self.inner.executor
    }

    /// Load a plugin from a source
    pub async fn load(&self, source: SourceDescriptor) -> PluginResult<PluginInfo> {
        info!("Loading plugin from {}", source.describe());
        let timeout = self.inner.timeout_for(&source);
        let inner = self.inner.clone();
        let context = ErrorContext::new("load").with_source(source.describe());

        let result = self
            .inner
            .executor
            .execute("load", timeout, move |token| async move {
                let artifact = inner.resolvers.resolve(&source).await?;
                let id = artifact.manifest.id.clone();
                let pending = inner.pending.mark(
                    &id,
                    LifecycleState::Loading,
                    inner.executor.generation(),
                );
                let load_context = inner.load_context(None).await;
                match inner.loader.prepare(artifact, &load_context, token).await {
                    Ok(prepared) => Ok((prepared, pending)),
                    Err(e) => {
                        inner.record_failure(&id, &e).await;
                        Err(e)
                    }
                }
            })
            .await;

        let execution = match result {
            Ok(execution) => execution,
            Err(e) => {
                log_plugin_error(&e, &context);
                return Err(e);
            }
        };
        let (prepared, _pending) = execution.value;
        let plugin_id = prepared.manifest.id.clone();
        match self.inner.commit_load(prepared).await {
            Ok(info) => Ok(info),
            Err(e) => {
                log_plugin_error(&e, &context.with_plugin(plugin_id));
                Err(e)
            }
        }
    }

    /// Unload a plugin
    ///
    /// Teardown continues when the plugin's cleanup hook fails; the failure
    /// is logged and recorded on the registry entry.
    pub async fn unload(&self, id: &str) -> PluginResult<()> {
        info!("Unloading plugin: {}", id);
        let inner = self.inner.clone();
        let plugin_id = id.to_string();
        let timeout = self.inner.config.limits.operation_timeout()
            + self.inner.config.limits.shutdown_timeout();
        self.inner
            .executor
            .execute("unload", timeout, move |_| async move {
                inner.unload_loaded(&plugin_id).await
            })
            .await
            .map(|execution| execution.into_value())
            .inspect_err(|e| log_plugin_error(e, &ErrorContext::new("unload").with_plugin(id)))
    }

    /// Unload a plugin, delete its files and forget it
    ///
    /// Steps that fail are reported instead of aborting the remaining ones.
    pub async fn uninstall(&self, id: &str) -> PluginResult<UninstallReport> {
        info!("Uninstalling plugin: {}", id);
        let inner = self.inner.clone();
        let plugin_id = id.to_string();
        let timeout = self.inner.config.limits.operation_timeout()
            + self.inner.config.limits.shutdown_timeout();
        let report = self
            .inner
            .executor
            .execute("uninstall", timeout, move |_| async move {
                inner.uninstall(&plugin_id).await
            })
            .await?
            .into_value();
        if report.status == UninstallStatus::Partial {
            warn!(plugin_id = id, failed = ?report.failed, "Uninstall completed partially");
        }
        Ok(report)
    }

    /// Enable a disabled plugin; enabling an active plugin is a no-op
    pub async fn enable(&self, id: &str) -> PluginResult<PluginInfo> {
        self.set_enabled(id, true).await
    }

    /// Disable a plugin; its routes stay reserved but answer 404
    pub async fn disable(&self, id: &str) -> PluginResult<PluginInfo> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> PluginResult<PluginInfo> {
        let operation = if enabled { "enable" } else { "disable" };
        let inner = self.inner.clone();
        let plugin_id = id.to_string();
        self.inner
            .executor
            .execute(
                operation,
                self.inner.config.limits.operation_timeout(),
                move |_| async move { inner.set_enabled(&plugin_id, enabled).await },
            )
            .await
            .map(|execution| execution.into_value())
    }

    /// Replace a plugin with freshly resolved code from its source
    ///
    /// The new code is opened and initialized before the old instance is
    /// touched; on failure the old instance keeps serving.
    pub async fn reload(&self, id: &str) -> PluginResult<PluginInfo> {
        info!("Reloading plugin: {}", id);
        let source = {
            let instances = self.inner.instances.read().await;
            instances
                .get(id)
                .map(|instance| instance.source.clone())
                .ok_or_else(|| PluginError::not_found(id))?
        };
        let timeout = self.inner.timeout_for(&source);
        let inner = self.inner.clone();
        let plugin_id = id.to_string();

        let result = self
            .inner
            .executor
            .execute("reload", timeout, move |token| async move {
                // Re-read under the lock; the plugin may have gone meanwhile
                let source = inner
                    .instances
                    .read()
                    .await
                    .get(&plugin_id)
                    .map(|instance| instance.source.clone())
                    .ok_or_else(|| PluginError::not_found(&plugin_id))?;
                let artifact = inner.resolvers.resolve(&source).await?;
                let load_context = inner.load_context(Some(&plugin_id)).await;
                inner.loader.prepare(artifact, &load_context, token).await
            })
            .await;

        let context = ErrorContext::new("reload").with_plugin(id);
        let execution = result.inspect_err(|e| log_plugin_error(e, &context))?;
        let prepared = execution.value;
        self.inner
            .commit_reload(prepared)
            .await
            .inspect_err(|e| log_plugin_error(e, &context))
    }

    /// Load every plugin the registry marks active or disabled
    pub async fn restore(&self) -> RestoreReport {
        let mut report = RestoreReport::default();
        let records = match self.inner.registry.list().await {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to read plugin registry: {}", e);
                report.failed.push(("registry".to_string(), e.to_string()));
                return report;
            }
        };

        for record in records {
            if !matches!(record.status, RecordStatus::Active | RecordStatus::Disabled) {
                continue;
            }
            if self.inner.instances.read().await.contains_key(&record.id) {
                continue;
            }
            info!(plugin_id = %record.id, "Restoring plugin");
            let result = match self.load(record.source.clone()).await {
                Ok(_) if record.status == RecordStatus::Disabled => {
                    self.disable(&record.id).await.map(|_| ())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.restored.push(record.id),
                Err(e) => report.failed.push((record.id, e.to_string())),
            }
        }
        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Plugin restore finished"
        );
        report
    }

    /// Detailed view of a loaded plugin
    pub async fn get(&self, id: &str) -> PluginResult<PluginInfo> {
        let instance = self
            .inner
            .instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::not_found(id))?;
        Ok(self.inner.info(&instance).await)
    }

    /// All loaded plugins ordered by id
    pub async fn list(&self) -> Vec<PluginSummary> {
        let mut summaries: Vec<_> = self
            .inner
            .instances
            .read()
            .await
            .values()
            .map(PluginInstance::summary)
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Lifecycle state of a plugin id, including transitional states
    pub async fn state(&self, id: &str) -> LifecycleState {
        if let Some(state) = self.inner.pending.get(id) {
            return state;
        }
        if let Some(instance) = self.inner.instances.read().await.get(id) {
            return instance.status.into();
        }
        match self.inner.registry.get(id).await {
            Ok(Some(record)) if record.status == RecordStatus::Error => LifecycleState::Error,
            _ => LifecycleState::Unloaded,
        }
    }

    /// Snapshot of a loaded plugin
    pub async fn instance(&self, id: &str) -> Option<PluginInstance> {
        self.inner.instances.read().await.get(id).cloned()
    }

    /// Execution handle and status of a loaded plugin
    pub async fn handle_for(&self, id: &str) -> Option<(Arc<dyn ExecutionHandle>, PluginStatus)> {
        self.inner
            .instances
            .read()
            .await
            .get(id)
            .map(|instance| (instance.handle.clone(), instance.status))
    }

    /// Ids of every loaded plugin
    pub async fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.instances.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Route a request to the plugin endpoint serving `method path`
    ///
    /// `path` is relative to the route prefix. Disabled plugins and unknown
    /// paths are reported as not found; a faulted plugin refuses the
    /// request. The endpoint's quota and validation rules are applied before
    /// the plugin is invoked.
    pub async fn dispatch(
        &self,
        method: &str,
        path: &str,
        mut request: PluginRequest,
    ) -> PluginResult<PluginResponse> {
        let route = self
            .inner
            .routes
            .resolve(method, path)
            .await
            .filter(|route| route.active)
            .ok_or_else(|| PluginError::not_found(format!("{method} {path}")))?;

        let instance = self.instance(&route.plugin_id).await;
        let (handle, metrics) = match instance {
            Some(instance) if instance.status == PluginStatus::Active => {
                (instance.handle, instance.metrics)
            }
            Some(instance) if instance.status == PluginStatus::Error => {
                return Err(PluginError::invalid_state(
                    &instance.id,
                    LifecycleState::Error,
                    "serve requests",
                ));
            }
            _ => return Err(PluginError::not_found(format!("{method} {path}"))),
        };

        metrics.record_request();
        route.policy.admit(&route.pattern, &request)?;

        debug!(plugin_id = %route.plugin_id, handler = %route.handler, "Dispatching plugin request");
        request.params = route.params;
        let handler = route.handler;
        self.inner
            .executor
            .isolate(
                "invoke",
                self.inner.config.limits.invoke_timeout(),
                async move { handle.invoke(&handler, request).await },
            )
            .await
            .inspect_err(|e| {
                metrics.record_error(e);
                log_plugin_error(e, &ErrorContext::new("invoke").with_plugin(&route.plugin_id))
            })
    }

    /// Totals across every loaded plugin
    pub async fn metrics(&self) -> MetricsSummary {
        let instances: Vec<PluginInstance> =
            self.inner.instances.read().await.values().cloned().collect();
        let mut summary = MetricsSummary {
            total_plugins: instances.len(),
            total_routes: self.inner.routes.len().await,
            ..Default::default()
        };
        for instance in &instances {
            match instance.status {
                PluginStatus::Active => summary.active_plugins += 1,
                PluginStatus::Disabled => summary.disabled_plugins += 1,
                PluginStatus::Error => summary.faulted_plugins += 1,
            }
            summary.total_requests += instance.metrics.request_count();
            summary.total_errors += instance.metrics.error_count();
        }
        summary
    }

    /// Add a failure to a loaded plugin's error history
    pub async fn record_error(&self, id: &str, error: &PluginError) {
        if let Some(instance) = self.inner.instances.read().await.get(id) {
            instance.metrics.record_error(error);
        }
    }

    /// Take an active plugin out of service after repeated failures
    ///
    /// The plugin stays loaded with its routes reserved; requests to it are
    /// refused until [`clear_fault`](Self::clear_fault) or a reload.
    pub async fn mark_faulted(&self, id: &str, reason: &str) -> PluginResult<()> {
        self.set_fault(id, Some(reason.to_string())).await
    }

    /// Return a faulted plugin to service; a no-op for any other status
    pub async fn clear_fault(&self, id: &str) -> PluginResult<()> {
        self.set_fault(id, None).await
    }

    async fn set_fault(&self, id: &str, reason: Option<String>) -> PluginResult<()> {
        let inner = self.inner.clone();
        let plugin_id = id.to_string();
        self.inner
            .executor
            .execute(
                "fault",
                self.inner.config.limits.operation_timeout(),
                move |_| async move { inner.set_fault(&plugin_id, reason).await },
            )
            .await
            .map(|execution| execution.into_value())
    }

    /// Add an event handler
    pub async fn on_event<F>(&self, handler: F)
    where
        F: Fn(PluginEvent) + Send + Sync + 'static,
    {
        self.inner.event_handlers.write().await.push(Box::new(handler));
    }

    /// Unload every plugin, used at host shutdown
    pub async fn shutdown(&self) {
        for id in self.loaded_ids().await {
            if let Err(e) = self.unload(&id).await {
                warn!(plugin_id = %id, "Failed to unload plugin at shutdown: {}", e);
            }
        }
    }
}

impl ManagerInner {
    fn timeout_for(&self, source: &SourceDescriptor) -> Duration {
        let base = self.config.limits.operation_timeout();
        match source {
            SourceDescriptor::Remote { .. } => base + self.config.remote.timeout(),
            _ => base,
        }
    }

    async fn load_context(&self, replacing: Option<&str>) -> LoadContext {
        let loaded = self
            .instances
            .read()
            .await
            .iter()
            .map(|(id, instance)| (id.clone(), instance.manifest.version.clone()))
            .collect();
        LoadContext {
            loaded,
            replacing: replacing.map(str::to_string),
        }
    }

    /// Mark an existing registry record as failed
    async fn record_failure(&self, id: &str, error: &PluginError) {
        // The record belongs to the plugin already holding this id
        if matches!(error, PluginError::Load(LoadError::DuplicateId(_))) {
            return;
        }
        if self.instances.read().await.contains_key(id) {
            return;
        }
        if let Err(e) = self
            .registry
            .set_status(id, RecordStatus::Error, Some(error.to_string()))
            .await
        {
            warn!(plugin_id = id, "Failed to record load failure: {}", e);
        }
        self.emit_event(PluginEvent::Error {
            plugin_id: id.to_string(),
            error: error.to_string(),
        })
        .await;
    }

    async fn commit_load(&self, prepared: PreparedPlugin) -> PluginResult<PluginInfo> {
        let routes = match self.routes.bind(&prepared.manifest).await {
            Ok(routes) => routes,
            Err(e) => {
                self.release(&prepared.handle, &prepared.manifest.id).await;
                return Err(e.into());
            }
        };

        let plugin_dir = prepared.staged.plugin_dir().to_path_buf();
        let install_dir = prepared.staged.dir().to_path_buf();
        let source = prepared.reload_source(&install_dir);
        let record = self.record_for(&prepared, &source, &install_dir).await;
        if let Err(e) = self.registry.upsert(record).await {
            self.routes.unbind(&routes).await;
            self.release(&prepared.handle, &prepared.manifest.id).await;
            return Err(e);
        }

        let PreparedPlugin {
            manifest,
            handle,
            instance_id,
            staged,
            ..
        } = prepared;
        staged.commit();
        let instance = PluginInstance {
            id: manifest.id.clone(),
            instance_id,
            manifest,
            handle,
            status: PluginStatus::Active,
            loaded_at: Utc::now(),
            routes,
            install_dir: install_dir.clone(),
            source,
            metrics: Arc::new(PluginMetrics::new()),
        };
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        self.loader.store().prune(&plugin_dir, &install_dir).await;

        info!(
            plugin_id = %instance.id,
            version = %instance.manifest.version,
            runtime = %instance.handle.kind(),
            routes = instance.routes.len(),
            "Plugin loaded"
        );
        self.emit_event(PluginEvent::Loaded {
            plugin_id: instance.id.clone(),
            version: instance.manifest.version.clone(),
        })
        .await;
        Ok(self.info(&instance).await)
    }

    async fn commit_reload(&self, prepared: PreparedPlugin) -> PluginResult<PluginInfo> {
        let id = prepared.manifest.id.clone();
        let Some(old) = self.instances.read().await.get(&id).cloned() else {
            self.release(&prepared.handle, &id).await;
            return Err(PluginError::not_found(&id));
        };

        let routes = match self.routes.replace(&prepared.manifest).await {
            Ok(routes) => routes,
            Err(e) => {
                self.release(&prepared.handle, &id).await;
                return Err(e.into());
            }
        };

        let plugin_dir = prepared.staged.plugin_dir().to_path_buf();
        let install_dir = prepared.staged.dir().to_path_buf();
        let source = prepared.reload_source(&install_dir);
        let record = self.record_for(&prepared, &source, &install_dir).await;
        if let Err(e) = self.registry.upsert(record).await {
            // Put the old routes back; the old instance never stopped
            if let Err(rebind) = self.routes.replace(&old.manifest).await {
                error!(plugin_id = %id, "Failed to restore routes after reload failure: {}", rebind);
            }
            self.routes.set_active(&id, old.status == PluginStatus::Active).await;
            self.release(&prepared.handle, &id).await;
            return Err(e);
        }

        let PreparedPlugin {
            manifest,
            handle,
            instance_id,
            staged,
            ..
        } = prepared;
        staged.commit();
        let instance = PluginInstance {
            id: id.clone(),
            instance_id,
            manifest,
            handle,
            status: PluginStatus::Active,
            loaded_at: Utc::now(),
            routes,
            install_dir: install_dir.clone(),
            source,
            metrics: old.metrics.clone(),
        };
        self.instances
            .write()
            .await
            .insert(id.clone(), instance.clone());

        // New code is serving; retire the old instance
        self.release(&old.handle, &id).await;
        drop(old);
        self.loader.store().prune(&plugin_dir, &install_dir).await;

        info!(
            plugin_id = %id,
            version = %instance.manifest.version,
            "Plugin reloaded"
        );
        self.emit_event(PluginEvent::Reloaded {
            plugin_id: id,
            version: instance.manifest.version.clone(),
        })
        .await;
        Ok(self.info(&instance).await)
    }

    async fn record_for(
        &self,
        prepared: &PreparedPlugin,
        source: &SourceDescriptor,
        install_dir: &std::path::Path,
    ) -> PluginRecord {
        let now = Utc::now();
        let installed_at = match self.registry.get(&prepared.manifest.id).await {
            Ok(Some(existing)) => existing.installed_at,
            _ => now,
        };
        PluginRecord {
            id: prepared.manifest.id.clone(),
            name: prepared.manifest.name.clone(),
            version: prepared.manifest.version.clone(),
            author_id: prepared.manifest.author.clone(),
            enabled: true,
            status: RecordStatus::Active,
            source: source.clone(),
            install_dir: Some(install_dir.to_path_buf()),
            installed_at,
            updated_at: now,
            last_error: None,
        }
    }

    /// Detach a loaded plugin and run its cleanup hook
    async fn unload_loaded(&self, id: &str) -> PluginResult<()> {
        let instance = self
            .instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::not_found(id))?;
        let _pending = self
            .pending
            .mark(id, LifecycleState::Unloading, self.executor.generation());

        // No new request can reach the plugin past this point
        self.routes.unbind(&instance.routes).await;
        self.routes.unbind_plugin(id).await;
        self.instances.write().await.remove(id);

        let hook_error = self.release(&instance.handle, id).await;
        if let Err(e) = self
            .registry
            .set_status(id, RecordStatus::Unloaded, hook_error.clone())
            .await
        {
            error!(plugin_id = id, "Failed to record unload: {}", e);
        }

        info!(
            plugin_id = id,
            semantics = ?instance.handle.unload_semantics(),
            clean = hook_error.is_none(),
            "Plugin unloaded"
        );
        self.emit_event(PluginEvent::Unloaded {
            plugin_id: id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn uninstall(&self, id: &str) -> PluginResult<UninstallReport> {
        let record = self.registry.get(id).await?;
        let loaded = self.instances.read().await.get(id).cloned();
        if record.is_none() && loaded.is_none() {
            return Err(PluginError::not_found(id));
        }

        let mut completed = Vec::new();
        let mut failed = Vec::new();

        if loaded.is_some() {
            match self.unload_loaded(id).await {
                Ok(()) => completed.push("unload".to_string()),
                Err(e) => failed.push(("unload".to_string(), e.to_string())),
            }
        }

        let install_dir = loaded
            .as_ref()
            .map(|instance| instance.install_dir.clone())
            .or_else(|| record.as_ref().and_then(|r| r.install_dir.clone()));
        if let Some(plugin_dir) = install_dir.as_deref().and_then(|dir| dir.parent()) {
            match self.loader.store().remove_plugin(plugin_dir).await {
                Ok(()) => completed.push("remove_files".to_string()),
                Err(e) => failed.push(("remove_files".to_string(), e.to_string())),
            }
        }

        if record.is_some() {
            match self.registry.delete(id).await {
                Ok(_) => completed.push("registry".to_string()),
                Err(e) => failed.push(("registry".to_string(), e.to_string())),
            }
        }

        let status = if failed.is_empty() {
            UninstallStatus::Completed
        } else {
            UninstallStatus::Partial
        };
        self.emit_event(PluginEvent::Uninstalled {
            plugin_id: id.to_string(),
        })
        .await;
        Ok(UninstallReport {
            plugin_id: id.to_string(),
            status,
            completed,
            failed,
        })
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> PluginResult<PluginInfo> {
        let instance = self
            .instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::not_found(id))?;

        let target = if enabled {
            PluginStatus::Active
        } else {
            PluginStatus::Disabled
        };
        if instance.status == target {
            return Ok(self.info(&instance).await);
        }
        if instance.status == PluginStatus::Error {
            return Err(PluginError::invalid_state(
                id,
                LifecycleState::Error,
                if enabled { "enable" } else { "disable" },
            ));
        }

        let record_status = if enabled {
            RecordStatus::Active
        } else {
            RecordStatus::Disabled
        };
        self.registry.set_status(id, record_status, None).await?;
        self.routes.set_active(id, enabled).await;
        let updated = instance.with_status(target);
        self.instances
            .write()
            .await
            .insert(id.to_string(), updated.clone());

        info!(plugin_id = id, enabled, "Plugin state changed");
        let event = if enabled {
            PluginEvent::Enabled {
                plugin_id: id.to_string(),
            }
        } else {
            PluginEvent::Disabled {
                plugin_id: id.to_string(),
            }
        };
        self.emit_event(event).await;
        Ok(self.info(&updated).await)
    }

    async fn set_fault(&self, id: &str, reason: Option<String>) -> PluginResult<()> {
        let instance = self
            .instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::not_found(id))?;
        let (from, to) = match reason {
            Some(_) => (PluginStatus::Active, PluginStatus::Error),
            None => (PluginStatus::Error, PluginStatus::Active),
        };
        if instance.status != from {
            return Ok(());
        }

        // The record stays active so a restart loads the plugin again
        if let Err(e) = self
            .registry
            .set_status(id, RecordStatus::Active, reason.clone())
            .await
        {
            warn!(plugin_id = id, "Failed to record plugin fault: {}", e);
        }
        self.instances
            .write()
            .await
            .insert(id.to_string(), instance.with_status(to));

        match reason {
            Some(reason) => {
                warn!(plugin_id = id, reason = %reason, "Plugin taken out of service");
                self.emit_event(PluginEvent::Error {
                    plugin_id: id.to_string(),
                    error: reason,
                })
                .await;
            }
            None => info!(plugin_id = id, "Plugin back in service"),
        }
        Ok(())
    }

    /// Run a plugin's cleanup hook, bounded and fault-contained
    ///
    /// Returns the failure reason, if any; never fails itself.
    async fn release(&self, handle: &Arc<dyn ExecutionHandle>, id: &str) -> Option<String> {
        let handle = handle.clone();
        match self
            .executor
            .isolate(
                "shutdown",
                self.config.limits.shutdown_timeout(),
                async move { handle.shutdown().await },
            )
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!(plugin_id = id, "Plugin cleanup hook failed: {}", e);
                self.emit_event(PluginEvent::Error {
                    plugin_id: id.to_string(),
                    error: e.to_string(),
                })
                .await;
                Some(e.to_string())
            }
        }
    }

    async fn info(&self, instance: &PluginInstance) -> PluginInfo {
        let prefix = self.config.route_prefix.trim_end_matches('/');
        let routes = self
            .routes
            .routes_for(&instance.id)
            .await
            .into_iter()
            .map(|mut route| {
                route.path = format!("{prefix}{}", route.path);
                route
            })
            .collect();
        PluginInfo {
            id: instance.id.clone(),
            instance_id: instance.instance_id,
            name: instance.manifest.name.clone(),
            version: instance.manifest.version.clone(),
            description: instance.manifest.description.clone(),
            author: instance.manifest.author.clone(),
            status: instance.status.into(),
            runtime: instance.manifest.runtime.kind,
            unload_semantics: instance.handle.unload_semantics(),
            loaded_at: instance.loaded_at,
            permissions: instance.manifest.permissions.clone(),
            routes,
            source: instance.source.clone(),
            metrics: instance.metrics.stats(instance.loaded_at),
        }
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: PluginEvent) {
        let handlers = self.event_handlers.read().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}
