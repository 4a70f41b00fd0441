//! Remote repository resolver
//!
//! Fetches a plugin with `git clone` or, for archive URLs, an HTTP download;
//! then runs the manifest's optional build step. The whole resolution is
//! bounded by the configured ceiling. Child processes are killed and the
//! scratch directory removed if the future is dropped.

use super::archive::{ArchiveFormat, extract_archive, safe_entry_path};
use super::{
    PluginArtifact, SourceDescriptor, SourceKind, SourceResolver, locate_plugin_root, scratch_dir,
};
use crate::core::config::RemoteSettings;
use crate::core::error::SourceError;
use crate::plugin::manifest::{BuildSpec, RuntimeKind};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

const STDERR_TAIL: usize = 2048;

/// Resolves plugins from git repositories and archive URLs
#[derive(Debug, Clone)]
pub struct RemoteResolver {
    scratch_root: PathBuf,
    settings: RemoteSettings,
    max_bytes: u64,
    #[cfg(feature = "remote")]
    client: reqwest::Client,
}

impl RemoteResolver {
    pub fn new(scratch_root: impl Into<PathBuf>, settings: RemoteSettings, max_bytes: u64) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            settings,
            max_bytes,
            #[cfg(feature = "remote")]
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_and_build(
        &self,
        descriptor: &SourceDescriptor,
        url: &url::Url,
        reference: Option<&str>,
        subdir: Option<&str>,
    ) -> Result<PluginArtifact, SourceError> {
        let scratch = scratch_dir(&self.scratch_root, "remote-")?;
        let checkout = scratch.path().join("src");

        if let Some(format) = archive_format(url) {
            let data = self.download(url).await?;
            let dest = checkout.clone();
            let max_bytes = self.max_bytes;
            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&dest)?;
                extract_archive(format, &data, &dest, max_bytes)
            })
            .await
            .map_err(|e| SourceError::Unavailable(format!("extraction task failed: {e}")))??;
        } else {
            self.git_clone(url.as_str(), reference, &checkout).await?;
        }

        let base = match subdir {
            Some(subdir) => match safe_entry_path(subdir)? {
                Some(relative) => checkout.join(relative),
                None => checkout,
            },
            None => checkout,
        };
        let (root, manifest) =
            tokio::task::spawn_blocking(move || locate_plugin_root(&base, false))
                .await
                .map_err(|e| SourceError::Unavailable(format!("resolver task failed: {e}")))??;

        if let Some(build) = &manifest.build {
            if self.settings.allow_build {
                run_build(build, &root).await?;
            } else {
                warn!(plugin_id = %manifest.id, "Build step declared but builds are disabled");
            }
        }

        if manifest.runtime.kind != RuntimeKind::Builtin
            && !root.join(&manifest.runtime.entrypoint).is_file()
        {
            return Err(SourceError::ManifestNotFound(format!(
                "entrypoint '{}' missing after fetch",
                manifest.runtime.entrypoint
            )));
        }

        Ok(PluginArtifact::from_root(
            manifest,
            root,
            descriptor.clone(),
            Some(scratch),
        ))
    }

    async fn git_clone(
        &self,
        url: &str,
        reference: Option<&str>,
        dest: &Path,
    ) -> Result<(), SourceError> {
        info!(url, reference, "Cloning plugin repository");
        let mut command = Command::new(&self.settings.git_binary);
        command.args(["clone", "--depth", "1"]);
        if let Some(reference) = reference {
            command.args(["--branch", reference]);
        }
        command
            .arg(url)
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = command.output().await.map_err(|e| {
            SourceError::Unavailable(format!("failed to run {}: {e}", self.settings.git_binary))
        })?;
        if !output.status.success() {
            return Err(SourceError::Unavailable(format!(
                "git clone failed: {}",
                tail(&output.stderr)
            )));
        }
        Ok(())
    }

    #[cfg(feature = "remote")]
    async fn download(&self, url: &url::Url) -> Result<Vec<u8>, SourceError> {
        info!(url = %url, "Downloading plugin archive");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Unavailable(format!("download failed: {e}")))?;

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(SourceError::TooLarge {
                    size: length,
                    limit: self.max_bytes,
                });
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::Unavailable(format!("download failed: {e}")))?;
        if bytes.len() as u64 > self.max_bytes {
            return Err(SourceError::TooLarge {
                size: bytes.len() as u64,
                limit: self.max_bytes,
            });
        }
        debug!(url = %url, bytes = bytes.len(), "Archive downloaded");
        Ok(bytes.to_vec())
    }

    #[cfg(not(feature = "remote"))]
    async fn download(&self, url: &url::Url) -> Result<Vec<u8>, SourceError> {
        Err(SourceError::Unavailable(format!(
            "cannot download {url}: built without the `remote` feature"
        )))
    }
}

#[async_trait]
impl SourceResolver for RemoteResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    async fn resolve(&self, descriptor: &SourceDescriptor) -> Result<PluginArtifact, SourceError> {
        let SourceDescriptor::Remote {
            url,
            reference,
            subdir,
        } = descriptor
        else {
            return Err(SourceError::Unavailable(format!(
                "remote resolver cannot handle {}",
                descriptor.describe()
            )));
        };

        if !self.settings.is_allowed(url) {
            return Err(SourceError::NotAllowed(url.clone()));
        }
        let parsed = url::Url::parse(url)
            .map_err(|e| SourceError::Unavailable(format!("invalid repository url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https" | "git" | "ssh" | "file") {
            return Err(SourceError::Unavailable(format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }

        let ceiling = self.settings.timeout();
        tokio::time::timeout(
            ceiling,
            self.fetch_and_build(descriptor, &parsed, reference.as_deref(), subdir.as_deref()),
        )
        .await
        .map_err(|_| {
            warn!(url = %url, "Remote resolution exceeded ceiling");
            SourceError::TimedOut(ceiling.as_secs())
        })?
    }
}

fn archive_format(url: &url::Url) -> Option<ArchiveFormat> {
    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".zip") || path.ends_with(".tar.gz") || path.ends_with(".tgz") {
        ArchiveFormat::detect(&path, &[])
    } else {
        None
    }
}

async fn run_build(build: &BuildSpec, root: &Path) -> Result<(), SourceError> {
    let dir = match build.directory.as_deref().map(safe_entry_path).transpose()? {
        Some(Some(relative)) => root.join(relative),
        _ => root.to_path_buf(),
    };
    info!(command = %build.command, dir = %dir.display(), "Running plugin build step");

    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/C");
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c");
        command
    };
    let output = command
        .arg(&build.command)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SourceError::BuildFailed(format!("failed to start build: {e}")))?;

    if !output.status.success() {
        return Err(SourceError::BuildFailed(format!(
            "'{}' exited with {}: {}",
            build.command,
            output.status,
            tail(&output.stderr)
        )));
    }
    Ok(())
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().rev().nth(STDERR_TAIL) {
        Some((index, _)) => format!("...{}", &text[index..]),
        None => text.to_string(),
    }
}
