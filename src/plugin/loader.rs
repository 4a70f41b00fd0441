//! Plugin loader
//!
//! Turns a resolved [`PluginArtifact`] into a ready-to-commit
//! [`PreparedPlugin`]: the manifest is validated, the code is staged into the
//! store, opened by its runtime and initialized. Nothing here touches the
//! instance table or the registry; the manager commits a prepared plugin
//! while it still holds the operation lock, and dropping one instead releases
//! the code and removes the staged files.

use crate::core::error::{LoadError, ManifestError, PluginResult};
use crate::plugin::api::PluginContext;
use crate::plugin::manifest::PluginManifest;
use crate::plugin::registry::RegistryStore;
use crate::plugin::routes::RouteTable;
use crate::plugin::runtime::{self, BuiltinCatalog, ExecutionHandle};
use crate::plugin::source::{PluginArtifact, SourceDescriptor};
use crate::plugin::store::{PluginStore, StagedInstall};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the loader needs to know about the currently loaded plugins
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    /// Version of every loaded plugin (active or disabled), keyed by id
    pub loaded: HashMap<String, String>,
    /// Id of the plugin a reload will replace
    pub replacing: Option<String>,
}

/// Plugin opened and initialized but not yet visible
pub struct PreparedPlugin {
    pub manifest: Arc<PluginManifest>,
    pub handle: Arc<dyn ExecutionHandle>,
    pub instance_id: Uuid,
    pub staged: StagedInstall,
    pub source: SourceDescriptor,
}

impl PreparedPlugin {
    /// Descriptor to reload this plugin from once `install_dir` is committed
    ///
    /// Uploaded archives are not kept, so they reload from the installed copy.
    pub fn reload_source(&self, install_dir: &Path) -> SourceDescriptor {
        match &self.source {
            SourceDescriptor::Archive { .. } => SourceDescriptor::local(install_dir),
            other => other.clone(),
        }
    }
}

impl std::fmt::Debug for PreparedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedPlugin")
            .field("id", &self.manifest.id)
            .field("instance_id", &self.instance_id)
            .field("staged", &self.staged)
            .finish()
    }
}

/// Validates, stages, opens and initializes plugins
#[derive(Clone)]
pub struct PluginLoader {
    host_version: semver::Version,
    builtins: BuiltinCatalog,
    store: PluginStore,
    routes: Arc<RouteTable>,
    registry: Arc<dyn RegistryStore>,
}

impl PluginLoader {
    pub fn new(
        host_version: semver::Version,
        builtins: BuiltinCatalog,
        store: PluginStore,
        routes: Arc<RouteTable>,
        registry: Arc<dyn RegistryStore>,
    ) -> Self {
        Self {
            host_version,
            builtins,
            store,
            routes,
            registry,
        }
    }

    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    pub fn builtins(&self) -> &BuiltinCatalog {
        &self.builtins
    }

    /// Prepare an artifact for commit
    ///
    /// On error every partially opened resource has been released.
    pub async fn prepare(
        &self,
        artifact: PluginArtifact,
        context: &LoadContext,
        cancellation: CancellationToken,
    ) -> PluginResult<PreparedPlugin> {
        let manifest = &artifact.manifest;
        info!(plugin_id = %manifest.id, version = %manifest.version, "Preparing plugin");

        manifest.validate(&self.host_version)?;
        self.check_identity(manifest, context).await?;
        check_dependencies(manifest, &context.loaded)?;
        self.routes
            .check_conflicts(manifest, context.replacing.as_deref())
            .await?;
        if let (Some(expected), Some(entrypoint)) =
            (manifest.security.checksum.as_deref(), artifact.entrypoint.as_ref())
        {
            verify_checksum(entrypoint.clone(), expected).await?;
        }

        let instance_id = Uuid::new_v4();
        let staged = self.store.stage(&artifact, instance_id).await?;
        let entrypoint = artifact
            .entrypoint
            .as_ref()
            .map(|_| staged.dir().join(&manifest.runtime.entrypoint));

        let handle = runtime::open(manifest, entrypoint.as_deref(), &self.builtins).await?;
        debug!(plugin_id = %manifest.id, runtime = %handle.kind(), "Plugin code opened");

        let plugin_context = PluginContext {
            plugin_id: manifest.id.clone(),
            instance_id: instance_id.to_string(),
            version: manifest.version.clone(),
            host_version: self.host_version.to_string(),
            permissions: manifest.permissions.clone(),
            configuration: manifest.configuration.clone(),
            data_dir: self.store.data_dir(manifest),
            cancellation,
        };
        if let Err(e) = handle.initialize(plugin_context).await {
            release(&handle, &manifest.id).await;
            return Err(LoadError::InitializationFailed(e.to_string()).into());
        }

        if let Some(exported) = handle.handlers() {
            let missing: Vec<String> = manifest
                .handler_names()
                .into_iter()
                .filter(|name| !exported.contains(name))
                .collect();
            if !missing.is_empty() {
                release(&handle, &manifest.id).await;
                return Err(LoadError::OpenFailed(format!(
                    "handlers not exported by plugin: {}",
                    missing.join(", ")
                ))
                .into());
            }
        }

        let PluginArtifact {
            manifest, source, ..
        } = artifact;
        Ok(PreparedPlugin {
            manifest: Arc::new(manifest),
            handle,
            instance_id,
            staged,
            source,
        })
    }

    async fn check_identity(
        &self,
        manifest: &PluginManifest,
        context: &LoadContext,
    ) -> PluginResult<()> {
        match context.replacing.as_deref() {
            Some(replacing) if replacing != manifest.id => {
                return Err(ManifestError::Invalid {
                    field: "id".to_string(),
                    reason: format!(
                        "reload of '{replacing}' produced a manifest for '{}'",
                        manifest.id
                    ),
                }
                .into());
            }
            Some(_) => {}
            None => {
                if context.loaded.contains_key(&manifest.id) {
                    return Err(LoadError::DuplicateId(manifest.id.clone()).into());
                }
            }
        }

        if let Some(existing) = self
            .registry
            .find_duplicate(&manifest.name, &manifest.version, &manifest.author)
            .await?
        {
            if existing.id != manifest.id {
                return Err(LoadError::DuplicateId(format!(
                    "{} {} by '{}' is already installed as '{}'",
                    manifest.name, manifest.version, manifest.author, existing.id
                ))
                .into());
            }
        }
        Ok(())
    }
}

fn check_dependencies(
    manifest: &PluginManifest,
    loaded: &HashMap<String, String>,
) -> Result<(), LoadError> {
    for dependency in manifest.dependencies.iter().filter(|d| !d.optional) {
        let satisfied = loaded.get(&dependency.id).is_some_and(|version| {
            let requirement = semver::VersionReq::parse(&dependency.version);
            let version = crate::plugin::manifest::parse_version(version);
            matches!((requirement, version), (Ok(req), Ok(v)) if req.matches(&v))
        });
        if !satisfied {
            return Err(LoadError::MissingDependency(format!(
                "{} {}",
                dependency.id, dependency.version
            )));
        }
    }
    Ok(())
}

async fn verify_checksum(path: PathBuf, expected: &str) -> PluginResult<()> {
    let expected = expected
        .trim()
        .trim_start_matches("sha256:")
        .to_ascii_lowercase();
    let actual = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| LoadError::OpenFailed(format!("checksum task failed: {e}")))??;

    if actual != expected {
        return Err(LoadError::ChecksumMismatch { expected, actual }.into());
    }
    Ok(())
}

/// Best-effort shutdown of a handle that will not be committed
async fn release(handle: &Arc<dyn ExecutionHandle>, plugin_id: &str) {
    if let Err(e) = handle.shutdown().await {
        warn!(plugin_id, "Cleanup after failed load reported: {}", e);
    }
}
