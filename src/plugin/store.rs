//! Installed artifact store
//!
//! Every load copies the resolved artifact into a fresh directory
//! `{root}/{sanitized-name}-{id}/{instance-id}/`. A fresh path per instance
//! means a reload never reuses a library the dynamic loader still has cached,
//! and lets the previous instance keep running from its own files until the
//! swap is committed. A plugin's `data/` directory survives reloads.

use crate::core::error::{PluginError, PluginResult};
use crate::plugin::manifest::PluginManifest;
use crate::plugin::source::PluginArtifact;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DATA_DIR: &str = "data";

#[derive(Debug, Clone)]
pub struct PluginStore {
    root: PathBuf,
}

impl PluginStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every instance of a plugin
    pub fn plugin_dir(&self, manifest: &PluginManifest) -> PathBuf {
        self.root
            .join(format!("{}-{}", sanitize(&manifest.name), manifest.id))
    }

    /// Persistent data directory of a plugin
    pub fn data_dir(&self, manifest: &PluginManifest) -> PathBuf {
        self.plugin_dir(manifest).join(DATA_DIR)
    }

    /// Copy an artifact into a new instance directory
    pub async fn stage(
        &self,
        artifact: &PluginArtifact,
        instance_id: Uuid,
    ) -> PluginResult<StagedInstall> {
        let plugin_dir = self.plugin_dir(&artifact.manifest);
        let dir = plugin_dir.join(instance_id.to_string());
        let source = artifact.root.clone();
        let data_dir = plugin_dir.join(DATA_DIR);

        let staged = StagedInstall {
            dir: dir.clone(),
            plugin_dir,
            committed: false,
        };
        tokio::task::spawn_blocking(move || -> PluginResult<()> {
            fs::create_dir_all(&data_dir)?;
            let source = source.canonicalize()?;
            fs::create_dir_all(&dir)?;
            let dest = dir.canonicalize()?;
            if dest.starts_with(&source) {
                return Err(PluginError::internal(format!(
                    "cannot stage {} into itself",
                    source.display()
                )));
            }
            copy_tree(&source, &dest)
        })
        .await
        .map_err(|e| PluginError::internal(format!("staging task failed: {e}")))??;

        debug!(dir = %staged.dir.display(), "Artifact staged");
        Ok(staged)
    }

    /// Remove every instance directory of a plugin except `keep`
    pub async fn prune(&self, plugin_dir: &Path, keep: &Path) -> usize {
        let plugin_dir = plugin_dir.to_path_buf();
        let keep = keep.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let Ok(entries) = fs::read_dir(&plugin_dir) else {
                return 0;
            };
            let mut removed = 0;
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                let is_instance = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| Uuid::parse_str(n).is_ok());
                if !is_instance || path == keep {
                    continue;
                }
                match fs::remove_dir_all(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), "Failed to prune instance: {}", e),
                }
            }
            removed
        })
        .await
        .unwrap_or(0)
    }

    /// Delete all files of a plugin, including its data directory
    pub async fn remove_plugin(&self, plugin_dir: &Path) -> PluginResult<()> {
        if !plugin_dir.starts_with(&self.root) {
            return Err(PluginError::internal(format!(
                "refusing to remove {} outside the plugin store",
                plugin_dir.display()
            )));
        }
        match tokio::fs::remove_dir_all(plugin_dir).await {
            Ok(()) => {
                info!(dir = %plugin_dir.display(), "Plugin files removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Instance directory removed on drop unless committed
#[derive(Debug)]
pub struct StagedInstall {
    dir: PathBuf,
    plugin_dir: PathBuf,
    committed: bool,
}

impl StagedInstall {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Keep the directory; returns its path
    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.dir.clone()
    }
}

impl Drop for StagedInstall {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), "Failed to remove staged install: {}", e);
            }
        }
        // Only succeeds when no other instance or data is left
        let data_dir = self.plugin_dir.join(DATA_DIR);
        if fs::read_dir(&data_dir).is_ok_and(|mut d| d.next().is_none()) {
            let _ = fs::remove_dir(&data_dir);
        }
        let _ = fs::remove_dir(&self.plugin_dir);
    }
}

fn copy_tree(source: &Path, dest: &Path) -> PluginResult<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        let target = dest.join(&name);
        if file_type.is_dir() {
            if name == ".git" {
                continue;
            }
            fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }
    Ok(())
}

fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    let out = out.trim_matches('-');
    let out: String = out.chars().take(40).collect();
    if out.is_empty() {
        "plugin".to_string()
    } else {
        out
    }
}
