// ! Durable plugin registry
// !
// ! Module keeps one record per installed plugin, keyed by plugin id. The
// ! record is the authority for which plugins are enabled and where their
// ! code came from, so the host can restore them after a restart.

use crate::core::error::{PluginError, PluginResult};
use crate::plugin::source::SourceDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

const REGISTRY_FORMAT_VERSION: u32 = 1;

/// Persisted status of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Disabled,
    Error,
    Unloaded,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Active => write!(f, "active"),
            RecordStatus::Disabled => write!(f, "disabled"),
            RecordStatus::Error => write!(f, "error"),
            RecordStatus::Unloaded => write!(f, "unloaded"),
        }
    }
}

/// Registry entry for one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author_id: String,
    pub enabled: bool,
    pub status: RecordStatus,

    /// Descriptor used to restore or reload the plugin
    pub source: SourceDescriptor,

    /// Directory holding the installed artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,

    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PluginRecord {
    /// Update status fields and bump `updated_at`
    pub fn transition(&mut self, status: RecordStatus, last_error: Option<String>) {
        self.status = status;
        self.enabled = status == RecordStatus::Active;
        self.last_error = last_error;
        self.updated_at = Utc::now();
    }
}

/// Persistence port for plugin records
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get(&self, id: &str) -> PluginResult<Option<PluginRecord>>;

    /// All records ordered by id
    async fn list(&self) -> PluginResult<Vec<PluginRecord>>;

    /// Insert or replace the record with the same id
    async fn upsert(&self, record: PluginRecord) -> PluginResult<()>;

    /// Delete a record; returns whether one existed
    async fn delete(&self, id: &str) -> PluginResult<bool>;

    /// Record with the same name, version and author, if any
    async fn find_duplicate(
        &self,
        name: &str,
        version: &str,
        author_id: &str,
    ) -> PluginResult<Option<PluginRecord>> {
        Ok(self.list().await?.into_iter().find(|record| {
            record.name == name && record.version == version && record.author_id == author_id
        }))
    }

    /// Change a record's status; unknown ids are ignored
    async fn set_status(
        &self,
        id: &str,
        status: RecordStatus,
        last_error: Option<String>,
    ) -> PluginResult<()> {
        if let Some(mut record) = self.get(id).await? {
            record.transition(status, last_error);
            self.upsert(record).await?;
        }
        Ok(())
    }
}

/// Registry kept in memory only
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    records: RwLock<HashMap<String, PluginRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistry {
    async fn get(&self, id: &str) -> PluginResult<Option<PluginRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> PluginResult<Vec<PluginRecord>> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn upsert(&self, record: PluginRecord) -> PluginResult<()> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> PluginResult<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    plugins: BTreeMap<String, PluginRecord>,
}

/// Registry persisted as a JSON file
///
/// Every write replaces the file atomically (write to a sibling temp file,
/// then rename), so a crash never leaves a half-written registry.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    records: RwLock<BTreeMap<String, PluginRecord>>,
}

impl FileRegistry {
    /// Open the registry at `path`, starting empty if the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> PluginResult<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: RegistryFile = serde_json::from_slice(&bytes).map_err(|e| {
                    PluginError::registry(format!("corrupt registry {}: {e}", path.display()))
                })?;
                if file.version > REGISTRY_FORMAT_VERSION {
                    return Err(PluginError::registry(format!(
                        "registry format {} is newer than supported {}",
                        file.version, REGISTRY_FORMAT_VERSION
                    )));
                }
                file.plugins
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(PluginError::registry(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        info!(path = %path.display(), records = records.len(), "Plugin registry opened");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<String, PluginRecord>) -> PluginResult<()> {
        let file = RegistryFile {
            version: REGISTRY_FORMAT_VERSION,
            plugins: records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(registry_io)?;
            }
        }
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        tokio::fs::write(&temp, &bytes).await.map_err(registry_io)?;
        tokio::fs::rename(&temp, &self.path).await.map_err(registry_io)?;
        debug!(path = %self.path.display(), "Registry persisted");
        Ok(())
    }
}

fn registry_io(err: std::io::Error) -> PluginError {
    PluginError::registry(err.to_string())
}

#[async_trait]
impl RegistryStore for FileRegistry {
    async fn get(&self, id: &str) -> PluginResult<Option<PluginRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> PluginResult<Vec<PluginRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn upsert(&self, record: PluginRecord) -> PluginResult<()> {
        let mut records = self.records.write().await;
        let previous = records.insert(record.id.clone(), record.clone());
        if let Err(e) = self.persist(&records).await {
            // Keep memory consistent with disk
            match previous {
                Some(previous) => records.insert(record.id.clone(), previous),
                None => records.remove(&record.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> PluginResult<bool> {
        let mut records = self.records.write().await;
        let Some(previous) = records.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&records).await {
            records.insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: &str, name: &str, version: &str) -> PluginRecord {
        let now = Utc::now();
        PluginRecord {
            id: id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            author_id: "acme".to_string(),
            enabled: true,
            status: RecordStatus::Active,
            source: SourceDescriptor::local(format!("/srv/plugins/{id}")),
            install_dir: None,
            installed_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_in_memory_crud() {
        let registry = InMemoryRegistry::new();
        registry.upsert(record("beta", "Beta", "1.0.0")).await.unwrap();
        registry.upsert(record("alpha", "Alpha", "1.0.0")).await.unwrap();

        let ids: Vec<_> = registry.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);

        registry
            .set_status("alpha", RecordStatus::Disabled, None)
            .await
            .unwrap();
        let alpha = registry.get("alpha").await.unwrap().unwrap();
        assert_eq!(alpha.status, RecordStatus::Disabled);
        assert!(!alpha.enabled);

        assert!(registry.delete("alpha").await.unwrap());
        assert!(!registry.delete("alpha").await.unwrap());
        assert!(registry.get("alpha").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_duplicate() {
        let registry = InMemoryRegistry::new();
        registry.upsert(record("hello", "Hello", "1.0.0")).await.unwrap();

        let found = registry.find_duplicate("Hello", "1.0.0", "acme").await.unwrap();
        assert_eq!(found.map(|r| r.id), Some("hello".to_string()));
        assert!(registry
            .find_duplicate("Hello", "2.0.0", "acme")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_file_registry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("registry.json");

        {
            let registry = FileRegistry::open(&path).await.unwrap();
            registry.upsert(record("hello", "Hello", "1.0.0")).await.unwrap();
            registry.upsert(record("world", "World", "0.3.0")).await.unwrap();
            registry
                .set_status("world", RecordStatus::Unloaded, Some("shutdown hook failed".into()))
                .await
                .unwrap();
            registry.delete("hello").await.unwrap();
        }

        let reopened = FileRegistry::open(&path).await.unwrap();
        let records = reopened.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "world");
        assert_eq!(records[0].status, RecordStatus::Unloaded);
        assert_eq!(records[0].last_error.as_deref(), Some("shutdown hook failed"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_registry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            FileRegistry::open(&path).await,
            Err(PluginError::Registry(_))
        ));
    }
}
