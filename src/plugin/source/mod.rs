//! Source resolvers
//!
//! A resolver materializes a plugin from its source descriptor into a
//! [`PluginArtifact`]: a directory on disk holding a parsed manifest and the
//! code entrypoint. Scratch directories are owned by the artifact and removed
//! when it drops, so a failed or abandoned resolution leaves nothing behind.

pub mod archive;
pub mod local;
pub mod remote;

use crate::core::config::HostConfig;
use crate::core::error::{ManifestError, PluginResult, SourceError};
use crate::plugin::manifest::{MANIFEST_FILE_NAMES, PluginManifest, RuntimeKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::debug;

pub use archive::{ArchiveFormat, ArchiveResolver};
pub use local::LocalResolver;
pub use remote::RemoteResolver;

/// Where a plugin's code comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// Directory holding manifest and code side by side
    Local { path: PathBuf },

    /// Uploaded `.zip` / `.tar.gz` archive
    Archive {
        file_name: String,
        #[serde(skip)]
        data: Vec<u8>,
    },

    /// Git repository or archive URL
    Remote {
        url: String,
        /// Branch or tag to check out
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        /// Plugin directory inside the repository
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdir: Option<String>,
    },
}

/// Discriminant of [`SourceDescriptor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    Archive,
    Remote,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Local => write!(f, "local"),
            SourceKind::Archive => write!(f, "archive"),
            SourceKind::Remote => write!(f, "remote"),
        }
    }
}

impl SourceDescriptor {
    /// Local directory source
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    /// Uploaded archive source
    pub fn archive(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Archive {
            file_name: file_name.into(),
            data,
        }
    }

    /// Remote repository source
    pub fn remote(url: impl Into<String>) -> Self {
        Self::Remote {
            url: url.into(),
            reference: None,
            subdir: None,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceDescriptor::Local { .. } => SourceKind::Local,
            SourceDescriptor::Archive { .. } => SourceKind::Archive,
            SourceDescriptor::Remote { .. } => SourceKind::Remote,
        }
    }

    /// Short human-readable description for logs
    pub fn describe(&self) -> String {
        match self {
            SourceDescriptor::Local { path } => format!("local:{}", path.display()),
            SourceDescriptor::Archive { file_name, data } => {
                format!("archive:{file_name} ({} bytes)", data.len())
            }
            SourceDescriptor::Remote { url, reference, .. } => match reference {
                Some(reference) => format!("remote:{url}@{reference}"),
                None => format!("remote:{url}"),
            },
        }
    }
}

/// Materialized plugin bundle, owned transiently by the loader
#[derive(Debug)]
pub struct PluginArtifact {
    pub manifest: PluginManifest,
    /// Directory holding the manifest
    pub root: PathBuf,
    /// Resolved code entrypoint; `None` for builtins
    pub entrypoint: Option<PathBuf>,
    /// Static asset directory, if declared and present
    pub assets: Option<PathBuf>,
    /// Descriptor the artifact was resolved from
    pub source: SourceDescriptor,
    scratch: Option<TempDir>,
}

impl PluginArtifact {
    /// Build an artifact from a plugin root directory
    pub fn from_root(
        manifest: PluginManifest,
        root: PathBuf,
        source: SourceDescriptor,
        scratch: Option<TempDir>,
    ) -> Self {
        let entrypoint = match manifest.runtime.kind {
            RuntimeKind::Builtin => None,
            _ => Some(root.join(&manifest.runtime.entrypoint)),
        };
        let assets = manifest
            .assets
            .as_ref()
            .map(|dir| root.join(dir))
            .filter(|dir| dir.is_dir());
        Self {
            manifest,
            root,
            entrypoint,
            assets,
            source,
            scratch,
        }
    }

    /// Whether the artifact lives in a scratch directory removed on drop
    pub fn is_scratch(&self) -> bool {
        self.scratch.is_some()
    }
}

/// Strategy materializing one kind of source
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Source kind handled by this resolver
    fn kind(&self) -> SourceKind;

    /// Resolve a descriptor into an artifact
    async fn resolve(&self, descriptor: &SourceDescriptor) -> Result<PluginArtifact, SourceError>;
}

/// One resolver per source kind
#[derive(Clone)]
pub struct ResolverSet {
    local: Arc<dyn SourceResolver>,
    archive: Arc<dyn SourceResolver>,
    remote: Arc<dyn SourceResolver>,
}

impl ResolverSet {
    /// Default resolvers configured from the host config
    pub fn from_config(config: &HostConfig) -> PluginResult<Self> {
        let scratch_root = config.plugin_dir.join(".scratch");
        Ok(Self {
            local: Arc::new(LocalResolver::new()),
            archive: Arc::new(ArchiveResolver::new(
                scratch_root.clone(),
                config.limits.max_archive_bytes,
            )),
            remote: Arc::new(RemoteResolver::new(
                scratch_root,
                config.remote.clone(),
                config.limits.max_archive_bytes,
            )),
        })
    }

    /// Replace the resolver for the kind it reports
    pub fn with_resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        match resolver.kind() {
            SourceKind::Local => self.local = resolver,
            SourceKind::Archive => self.archive = resolver,
            SourceKind::Remote => self.remote = resolver,
        }
        self
    }

    /// Resolve a descriptor with the matching strategy
    pub async fn resolve(&self, descriptor: &SourceDescriptor) -> Result<PluginArtifact, SourceError> {
        debug!(source = %descriptor.describe(), "Resolving plugin source");
        match descriptor.kind() {
            SourceKind::Local => self.local.resolve(descriptor).await,
            SourceKind::Archive => self.archive.resolve(descriptor).await,
            SourceKind::Remote => self.remote.resolve(descriptor).await,
        }
    }
}

/// Find the manifest file directly inside `dir`
pub fn find_manifest_file(dir: &Path) -> Option<PathBuf> {
    MANIFEST_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Locate the plugin root: `dir` itself, then each first-level subdirectory
///
/// A candidate qualifies when it holds a manifest and, if
/// `require_entrypoint` is set, the code entrypoint the manifest names.
/// Blocking; call from a blocking context.
pub fn locate_plugin_root(
    dir: &Path,
    require_entrypoint: bool,
) -> Result<(PathBuf, PluginManifest), SourceError> {
    if let Some(found) = inspect_candidate(dir, require_entrypoint)? {
        return Ok(found);
    }

    let mut subdirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .map(|entry| entry.path())
        .filter(|path| {
            // Skip metadata directories such as __MACOSX and .git
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && !n.starts_with("__"))
        })
        .collect();
    subdirs.sort();

    for subdir in subdirs {
        if let Some(found) = inspect_candidate(&subdir, require_entrypoint)? {
            return Ok(found);
        }
    }

    Err(SourceError::ManifestNotFound(format!(
        "no plugin manifest with its entrypoint under {}",
        dir.display()
    )))
}

fn inspect_candidate(
    dir: &Path,
    require_entrypoint: bool,
) -> Result<Option<(PathBuf, PluginManifest)>, SourceError> {
    let Some(manifest_path) = find_manifest_file(dir) else {
        return Ok(None);
    };
    let bytes = std::fs::read(&manifest_path)?;
    let manifest = PluginManifest::parse(&bytes).map_err(|e| match e {
        ManifestError::Malformed(reason) => {
            ManifestError::Malformed(format!("{}: {reason}", manifest_path.display()))
        }
        other => other,
    })?;

    let has_code = manifest.runtime.kind == RuntimeKind::Builtin
        || (!manifest.runtime.entrypoint.is_empty()
            && dir.join(&manifest.runtime.entrypoint).is_file());
    if require_entrypoint && !has_code {
        debug!(dir = %dir.display(), "Manifest found without entrypoint; skipping");
        return Ok(None);
    }
    Ok(Some((dir.to_path_buf(), manifest)))
}

/// Create a scratch directory under `root`, creating `root` first
pub(crate) fn scratch_dir(root: &Path, prefix: &str) -> Result<TempDir, SourceError> {
    std::fs::create_dir_all(root)?;
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(root)
        .map_err(SourceError::from)
}
