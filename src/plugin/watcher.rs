// ! File system watcher for plugin hot reload
// !
// ! Module watches the source directories of plugins loaded from local paths
// ! and reloads a plugin once its files have been quiet for the debounce
// ! period.

use crate::core::error::{PluginError, PluginResult};
use crate::plugin::PluginEvent;
use crate::plugin::manager::PluginManager;
use crate::plugin::source::SourceDescriptor;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

enum WatchMessage {
    Fs(Event),
    /// The set of loaded plugins changed
    Sync,
}

/// Plugin source watcher for hot reload
pub struct PluginWatcher {
    manager: PluginManager,
    debounce: Duration,
    /// Watched source directories and their plugin ids
    watched: Arc<StdMutex<HashMap<PathBuf, String>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PluginWatcher {
    pub fn new(manager: PluginManager) -> Self {
        Self {
            manager,
            debounce: DEFAULT_DEBOUNCE,
            watched: Arc::new(StdMutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Set the quiet period before a reload
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start watching every plugin loaded from a local directory
    pub async fn start(&mut self) -> PluginResult<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();

        let fs_tx = tx.clone();
        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    // Receiver gone means the watcher is shutting down
                    let _ = fs_tx.send(WatchMessage::Fs(event));
                }
                Err(e) => error!("Plugin watch error: {}", e),
            }
        })
        .map_err(|e| PluginError::internal(format!("Failed to create watcher: {e}")))?;

        let sync_tx = tx;
        self.manager
            .on_event(move |event| {
                if matches!(
                    event,
                    PluginEvent::Loaded { .. }
                        | PluginEvent::Unloaded { .. }
                        | PluginEvent::Reloaded { .. }
                ) {
                    let _ = sync_tx.send(WatchMessage::Sync);
                }
            })
            .await;

        let mut state = WatchState {
            watcher,
            manager: self.manager.clone(),
            watched: self.watched.clone(),
            pending: HashMap::new(),
            debounce: self.debounce,
        };
        state.sync().await;

        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(state.run(rx, cancel)));
        info!(debounce_ms = self.debounce.as_millis() as u64, "Plugin watcher started");
        Ok(())
    }

    /// Stop watching
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Plugin watcher task ended abnormally: {}", e);
            }
            info!("Plugin watcher stopped");
        }
    }

    /// Watched directories and their plugin ids
    pub fn watched_paths(&self) -> Vec<(PathBuf, String)> {
        let mut paths: Vec<_> = self
            .watched
            .lock()
            .map(|watched| {
                watched
                    .iter()
                    .map(|(path, id)| (path.clone(), id.clone()))
                    .collect()
            })
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatchState {
    watcher: RecommendedWatcher,
    manager: PluginManager,
    watched: Arc<StdMutex<HashMap<PathBuf, String>>>,
    /// Plugins with unsettled changes and the time of the latest one
    pending: HashMap<String, Instant>,
    debounce: Duration,
}

impl WatchState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WatchMessage>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval((self.debounce / 4).max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(WatchMessage::Fs(event)) => self.record(event),
                    Some(WatchMessage::Sync) => self.sync().await,
                    None => break,
                },
                _ = ticker.tick() => self.reload_settled().await,
            }
        }
    }

    /// Re-derive the watch set from the loaded plugins
    async fn sync(&mut self) {
        let store_root = self.manager.config().plugin_dir.clone();
        let mut wanted = HashMap::new();
        for id in self.manager.loaded_ids().await {
            let Some(instance) = self.manager.instance(&id).await else {
                continue;
            };
            if let SourceDescriptor::Local { path } = &instance.source {
                // Installed copies of archives are not user files
                if !path.starts_with(&store_root) {
                    wanted.insert(path.clone(), id);
                }
            }
        }

        let Ok(mut watched) = self.watched.lock() else {
            return;
        };
        let stale: Vec<PathBuf> = watched
            .keys()
            .filter(|path| !wanted.contains_key(*path))
            .cloned()
            .collect();
        for path in stale {
            if let Err(e) = self.watcher.unwatch(&path) {
                debug!(path = %path.display(), "Failed to unwatch: {}", e);
            }
            watched.remove(&path);
        }
        for (path, id) in wanted {
            if watched.contains_key(&path) {
                continue;
            }
            match self.watcher.watch(&path, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!(plugin_id = %id, path = %path.display(), "Watching plugin source");
                    watched.insert(path, id);
                }
                Err(e) => warn!(plugin_id = %id, path = %path.display(), "Failed to watch plugin source: {}", e),
            }
        }
    }

    fn record(&mut self, event: Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        let Ok(watched) = self.watched.lock() else {
            return;
        };
        for path in &event.paths {
            if let Some(id) = owner(&watched, path) {
                debug!(plugin_id = %id, path = %path.display(), "Plugin source changed");
                self.pending.insert(id.to_string(), Instant::now());
            }
        }
    }

    async fn reload_settled(&mut self) {
        let now = Instant::now();
        let settled: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, changed)| now.duration_since(**changed) >= self.debounce)
            .map(|(id, _)| id.clone())
            .collect();

        for id in settled {
            self.pending.remove(&id);
            info!(plugin_id = %id, "Plugin source changed, reloading");
            if let Err(e) = self.manager.reload(&id).await {
                error!(plugin_id = %id, "Hot reload failed: {}", e);
            }
        }
    }
}

/// Plugin whose watched directory contains `path`
fn owner<'a>(watched: &'a HashMap<PathBuf, String>, path: &Path) -> Option<&'a str> {
    watched
        .iter()
        .filter(|(dir, _)| path.starts_with(dir))
        .max_by_key(|(dir, _)| dir.components().count())
        .map(|(_, id)| id.as_str())
}
