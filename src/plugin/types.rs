// ! Plugin lifecycle types

use crate::plugin::manifest::{PluginManifest, RuntimeKind};
use crate::plugin::metrics::{PluginMetrics, PluginStats};
use crate::plugin::routes::{RouteId, RouteInfo};
use crate::plugin::runtime::{ExecutionHandle, UnloadSemantics};
use crate::plugin::source::SourceDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Position of a plugin id in the lifecycle
///
/// ```text
/// Unloaded -> Loading -> Active <-> Disabled -> Unloading -> Unloaded
///                 \-> Error -> Unloaded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Active,
    Disabled,
    Unloading,
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::Loading => "loading",
            LifecycleState::Active => "active",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Unloading => "unloading",
            LifecycleState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Status of a loaded instance
///
/// `Error` marks a loaded plugin that failed its health checks; it keeps its
/// routes but does not serve until it recovers or is reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Active,
    Disabled,
    Error,
}

impl From<PluginStatus> for LifecycleState {
    fn from(status: PluginStatus) -> Self {
        match status {
            PluginStatus::Active => LifecycleState::Active,
            PluginStatus::Disabled => LifecycleState::Disabled,
            PluginStatus::Error => LifecycleState::Error,
        }
    }
}

/// A loaded plugin
///
/// Cheap to clone; state changes replace the whole snapshot in the instance
/// table so readers never observe a half-updated entry.
#[derive(Clone)]
pub struct PluginInstance {
    pub id: String,
    pub instance_id: Uuid,
    pub manifest: Arc<PluginManifest>,
    pub handle: Arc<dyn ExecutionHandle>,
    pub status: PluginStatus,
    pub loaded_at: DateTime<Utc>,
    pub routes: Vec<RouteId>,
    pub install_dir: PathBuf,
    pub source: SourceDescriptor,
    pub metrics: Arc<PluginMetrics>,
}

impl PluginInstance {
    pub fn with_status(&self, status: PluginStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            status: self.status.into(),
            runtime: self.manifest.runtime.kind,
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("version", &self.manifest.version)
            .field("status", &self.status)
            .field("runtime", &self.handle.kind())
            .field("routes", &self.routes)
            .finish()
    }
}

/// Compact listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: LifecycleState,
    pub runtime: RuntimeKind,
}

/// Detailed view of one plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub instance_id: Uuid,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub status: LifecycleState,
    pub runtime: RuntimeKind,
    pub unload_semantics: UnloadSemantics,
    pub loaded_at: DateTime<Utc>,
    pub permissions: Vec<String>,
    /// Full paths including the route prefix
    pub routes: Vec<RouteInfo>,
    pub source: SourceDescriptor,
    pub metrics: PluginStats,
}
