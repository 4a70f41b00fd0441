// ! Plugin health reporting
// !
// ! Module probes loaded plugins on demand and periodically. Probes are
// ! bounded and fault-isolated. A plugin that crosses the unhealthy
// ! threshold is taken out of service and returns once it probes healthy
// ! again; it is never unloaded.

use crate::core::config::HealthSettings;
use crate::plugin::manager::PluginManager;
use crate::plugin::metrics::MetricsSummary;
use crate::plugin::types::PluginStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Enough consecutive successful probes
    Healthy,
    /// Recent probes disagree
    Degraded,
    /// Enough consecutive failed probes
    Unhealthy,
    /// Not probed yet
    Unknown,
}

impl HealthStatus {
    /// Check if status indicates the plugin is serving
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Get a numeric score for this status (higher is better)
    pub fn score(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 100,
            HealthStatus::Degraded => 75,
            HealthStatus::Unhealthy => 25,
            HealthStatus::Unknown => 0,
        }
    }

    /// Combine two health statuses, returning the worse of the two
    pub fn combine(self, other: HealthStatus) -> HealthStatus {
        if self.score() < other.score() {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProbeResult {
    Healthy { latency_ms: u64 },
    Unhealthy { reason: String },
    NotFound,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy { .. })
    }
}

/// Accumulated health of one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginHealth {
    pub plugin_id: String,
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

impl PluginHealth {
    fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            status: HealthStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_error: None,
            last_checked: None,
        }
    }

    fn record(&mut self, result: &ProbeResult, settings: &HealthSettings) {
        self.last_checked = Some(Utc::now());
        match result {
            ProbeResult::Healthy { .. } => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
                self.last_error = None;
            }
            ProbeResult::Unhealthy { reason } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
                self.last_error = Some(reason.clone());
            }
            ProbeResult::NotFound => return,
        }

        self.status = if self.consecutive_successes >= settings.healthy_threshold {
            HealthStatus::Healthy
        } else if self.consecutive_failures >= settings.unhealthy_threshold {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
    }
}

/// Health of every loaded plugin
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    /// Worst status across plugins; healthy when none are loaded
    pub status: HealthStatus,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub plugins: Vec<PluginHealth>,
    pub metrics: MetricsSummary,
}

impl HealthSummary {
    fn from_plugins(plugins: Vec<PluginHealth>, metrics: MetricsSummary) -> Self {
        let count = |status: HealthStatus| plugins.iter().filter(|p| p.status == status).count();
        let status = plugins
            .iter()
            .fold(HealthStatus::Healthy, |acc, p| acc.combine(p.status));
        Self {
            status,
            healthy: count(HealthStatus::Healthy),
            degraded: count(HealthStatus::Degraded),
            unhealthy: count(HealthStatus::Unhealthy),
            unknown: count(HealthStatus::Unknown),
            plugins,
            metrics,
        }
    }
}

/// On-demand and periodic plugin health probing
pub struct HealthReporter {
    manager: PluginManager,
    settings: HealthSettings,
    states: RwLock<HashMap<String, PluginHealth>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthReporter {
    pub fn new(manager: PluginManager, settings: HealthSettings) -> Arc<Self> {
        Arc::new(Self {
            manager,
            settings,
            states: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Probe one plugin and fold the result into its counters
    pub async fn probe(&self, id: &str) -> ProbeResult {
        let Some((handle, _)) = self.manager.handle_for(id).await else {
            self.states.write().await.remove(id);
            return ProbeResult::NotFound;
        };

        let started = Instant::now();
        let result = match self
            .manager
            .executor()
            .isolate(
                "health",
                self.settings.probe_timeout(),
                async move { handle.health().await },
            )
            .await
        {
            Ok(()) => ProbeResult::Healthy {
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Err(e) => {
                self.manager.record_error(id, &e).await;
                ProbeResult::Unhealthy {
                    reason: e.to_string(),
                }
            }
        };

        let (previous, current) = {
            let mut states = self.states.write().await;
            let health = states
                .entry(id.to_string())
                .or_insert_with(|| PluginHealth::new(id));
            let previous = health.status;
            health.record(&result, &self.settings);
            (previous, health.clone())
        };
        if current.status != previous {
            self.on_transition(id, &current).await;
        }
        result
    }

    async fn on_transition(&self, id: &str, health: &PluginHealth) {
        let outcome = match health.status {
            HealthStatus::Unhealthy => {
                let reason = health.last_error.as_deref().unwrap_or("health check failed");
                warn!(plugin_id = id, reason, "Plugin became unhealthy");
                self.manager.mark_faulted(id, reason).await
            }
            HealthStatus::Healthy => {
                info!(plugin_id = id, status = %health.status, "Plugin health changed");
                self.manager.clear_fault(id).await
            }
            status => {
                info!(plugin_id = id, %status, "Plugin health changed");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            debug!(plugin_id = id, "Health transition not applied: {}", e);
        }
    }

    /// Last recorded health of a plugin, `None` when never probed
    pub async fn status(&self, id: &str) -> Option<PluginHealth> {
        self.states.read().await.get(id).cloned()
    }

    /// Health of every loaded plugin
    pub async fn summary(&self) -> HealthSummary {
        let loaded = self.manager.loaded_ids().await;
        let mut states = self.states.write().await;
        // Forget plugins unloaded since their last probe
        states.retain(|id, _| loaded.contains(id));
        let plugins = loaded
            .iter()
            .map(|id| {
                states
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| PluginHealth::new(id))
            })
            .collect();
        drop(states);
        HealthSummary::from_plugins(plugins, self.manager.metrics().await)
    }

    /// Probe every serving or faulted plugin whose manifest enables health
    /// checks and whose own interval has elapsed
    pub async fn probe_due(&self) -> usize {
        let mut probed = 0;
        for id in self.manager.loaded_ids().await {
            let Some(instance) = self.manager.instance(&id).await else {
                continue;
            };
            let spec = &instance.manifest.health;
            if instance.status == PluginStatus::Disabled || !spec.enabled {
                continue;
            }
            if let Some(interval) = spec.interval_secs.map(Duration::from_secs) {
                let last = self
                    .states
                    .read()
                    .await
                    .get(&id)
                    .and_then(|h| h.last_checked);
                let due = last.is_none_or(|at| {
                    (Utc::now() - at).to_std().unwrap_or_default() >= interval
                });
                if !due {
                    continue;
                }
            }
            self.probe(&id).await;
            probed += 1;
        }
        probed
    }

    /// Start periodic probing; a no-op if already running or disabled
    pub async fn start(self: &Arc<Self>) {
        if !self.settings.enabled {
            debug!("Periodic health probing disabled");
            return;
        }
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let reporter = Arc::clone(self);
        let interval = self.settings.interval();
        info!(interval_secs = interval.as_secs(), "Starting plugin health reporter");
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = reporter.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let probed = reporter.probe_due().await;
                        debug!(probed, "Health probe round finished");
                    }
                }
            }
        }));
    }

    /// Stop periodic probing and wait for the task to finish
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Health reporter task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::HostConfig;
    use crate::core::error::{PluginError, PluginResult};
    use crate::plugin::api::{PluginModule, PluginRequest, PluginResponse};
    use crate::plugin::runtime::BuiltinCatalog;
    use crate::plugin::source::SourceDescriptor;
    use crate::plugin::types::LifecycleState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    static FAILING: AtomicBool = AtomicBool::new(false);
    static WOBBLY_FAILING: AtomicBool = AtomicBool::new(false);

    #[derive(Default)]
    struct Flaky;

    #[async_trait]
    impl PluginModule for Flaky {
        fn handlers(&self) -> Vec<String> {
            vec!["ping".to_string()]
        }

        async fn handle(&self, _handler: &str, _request: PluginRequest) -> PluginResult<PluginResponse> {
            Ok(PluginResponse::ok(json!("pong")))
        }

        async fn health_check(&self) -> PluginResult<()> {
            if FAILING.load(Ordering::SeqCst) {
                Err(PluginError::runtime_fault("upstream down"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct Wobbly;

    #[async_trait]
    impl PluginModule for Wobbly {
        fn handlers(&self) -> Vec<String> {
            vec!["ping".to_string()]
        }

        async fn handle(&self, _handler: &str, _request: PluginRequest) -> PluginResult<PluginResponse> {
            Ok(PluginResponse::ok(json!("pong")))
        }

        async fn health_check(&self) -> PluginResult<()> {
            if WOBBLY_FAILING.load(Ordering::SeqCst) {
                Err(PluginError::runtime_fault("dependency unreachable"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct Hanging;

    #[async_trait]
    impl PluginModule for Hanging {
        fn handlers(&self) -> Vec<String> {
            vec!["ping".to_string()]
        }

        async fn handle(&self, _handler: &str, _request: PluginRequest) -> PluginResult<PluginResponse> {
            Ok(PluginResponse::ok(json!("pong")))
        }

        async fn health_check(&self) -> PluginResult<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    async fn manager_with(workspace: &std::path::Path, id: &str, builtin: &str) -> PluginManager {
        let config = HostConfig {
            plugin_dir: workspace.join("store"),
            ..Default::default()
        };
        let manager = PluginManager::builder(config)
            .builtins(
                BuiltinCatalog::new()
                    .with_default::<Flaky>("flaky")
                    .with_default::<Wobbly>("wobbly")
                    .with_default::<Hanging>("hanging"),
            )
            .build()
            .unwrap();

        let dir = workspace.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.yaml"),
            format!(
                "id: {id}\nname: {id}\nversion: 1.0.0\nruntime:\n  kind: builtin\n  entrypoint: {builtin}\nendpoints:\n  - path: /{id}\n    method: GET\n    handler: ping\n"
            ),
        )
        .unwrap();
        manager.load(SourceDescriptor::local(dir)).await.unwrap();
        manager
    }

    fn settings() -> HealthSettings {
        HealthSettings {
            probe_timeout_secs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_thresholds() {
        let settings = settings();
        let mut health = PluginHealth::new("p");
        let ok = ProbeResult::Healthy { latency_ms: 1 };
        let bad = ProbeResult::Unhealthy {
            reason: "boom".to_string(),
        };

        health.record(&ok, &settings);
        assert_eq!(health.status, HealthStatus::Degraded);
        health.record(&ok, &settings);
        assert_eq!(health.status, HealthStatus::Healthy);

        health.record(&bad, &settings);
        health.record(&bad, &settings);
        assert_eq!(health.status, HealthStatus::Degraded);
        health.record(&bad, &settings);
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_probe_reports_without_unloading() {
        let workspace = tempfile::tempdir().unwrap();
        let manager = manager_with(workspace.path(), "flaky", "flaky").await;
        let reporter = HealthReporter::new(manager.clone(), settings());

        assert!(reporter.probe("flaky").await.is_healthy());
        FAILING.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            assert!(matches!(
                reporter.probe("flaky").await,
                ProbeResult::Unhealthy { .. }
            ));
        }
        FAILING.store(false, Ordering::SeqCst);

        let health = reporter.status("flaky").await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(manager.list().await.len(), 1);
        assert_eq!(reporter.probe("missing").await, ProbeResult::NotFound);
    }

    #[tokio::test]
    async fn test_unhealthy_plugin_is_faulted_until_it_recovers() {
        let workspace = tempfile::tempdir().unwrap();
        let manager = manager_with(workspace.path(), "wobbly", "wobbly").await;
        let reporter = HealthReporter::new(manager.clone(), settings());
        let request = || PluginRequest {
            method: "GET".to_string(),
            path: "/wobbly".to_string(),
            ..Default::default()
        };

        WOBBLY_FAILING.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            reporter.probe("wobbly").await;
        }
        assert_eq!(manager.state("wobbly").await, LifecycleState::Error);
        let err = manager.dispatch("GET", "/wobbly", request()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");

        let info = manager.get("wobbly").await.unwrap();
        assert_eq!(info.metrics.error_count, 3);
        assert_eq!(info.metrics.recent_errors.len(), 3);
        let summary = reporter.summary().await;
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.metrics.faulted_plugins, 1);

        // Faulted plugins keep being probed
        WOBBLY_FAILING.store(false, Ordering::SeqCst);
        assert_eq!(reporter.probe_due().await, 1);
        reporter.probe("wobbly").await;
        assert_eq!(manager.state("wobbly").await, LifecycleState::Active);
        manager.dispatch("GET", "/wobbly", request()).await.unwrap();
        // Refused while faulted, so only the last request counts
        assert_eq!(manager.metrics().await.total_requests, 1);
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out() {
        let workspace = tempfile::tempdir().unwrap();
        let manager = manager_with(workspace.path(), "stuck", "hanging").await;
        let reporter = HealthReporter::new(manager, settings());

        match reporter.probe("stuck").await {
            ProbeResult::Unhealthy { reason } => assert!(reason.contains("timed out")),
            other => panic!("Expected Unhealthy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_summary_tracks_loaded_plugins() {
        let workspace = tempfile::tempdir().unwrap();
        let manager = manager_with(workspace.path(), "stuck", "hanging").await;
        let reporter = HealthReporter::new(manager.clone(), settings());

        let summary = reporter.summary().await;
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.status, HealthStatus::Unknown);

        manager.unload("stuck").await.unwrap();
        let summary = reporter.summary().await;
        assert!(summary.plugins.is_empty());
        assert_eq!(summary.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let workspace = tempfile::tempdir().unwrap();
        let manager = manager_with(workspace.path(), "steady", "flaky").await;
        let reporter = HealthReporter::new(
            manager,
            HealthSettings {
                interval_secs: 1,
                ..settings()
            },
        );

        reporter.start().await;
        reporter.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        reporter.stop().await;
        assert!(reporter.status("steady").await.is_some());
    }
}
