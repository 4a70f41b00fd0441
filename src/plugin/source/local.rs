// ! Local directory resolver
// !
// ! The directory is used in place; nothing is copied or deleted here.

use super::{PluginArtifact, SourceDescriptor, SourceKind, SourceResolver, locate_plugin_root};
use crate::core::error::SourceError;
use async_trait::async_trait;

/// Resolves plugins from a directory on the host filesystem
#[derive(Debug, Default, Clone)]
pub struct LocalResolver;

impl LocalResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceResolver for LocalResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    async fn resolve(&self, descriptor: &SourceDescriptor) -> Result<PluginArtifact, SourceError> {
        let SourceDescriptor::Local { path } = descriptor else {
            return Err(SourceError::Unavailable(format!(
                "local resolver cannot handle {}",
                descriptor.describe()
            )));
        };

        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            SourceError::Unavailable(format!("{}: {e}", path.display()))
        })?;
        if !metadata.is_dir() {
            return Err(SourceError::Unavailable(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        let dir = path.clone();
        let (root, manifest) = tokio::task::spawn_blocking(move || locate_plugin_root(&dir, true))
            .await
            .map_err(|e| SourceError::Unavailable(format!("resolver task failed: {e}")))??;

        Ok(PluginArtifact::from_root(
            manifest,
            root,
            descriptor.clone(),
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_resolve_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("plugin.yml"),
            "id: local-one\nname: Local\nversion: 0.1.0\nruntime:\n  kind: builtin\n",
        )
        .unwrap();

        let artifact = LocalResolver::new()
            .resolve(&SourceDescriptor::local(dir.path()))
            .await
            .unwrap();
        assert_eq!(artifact.manifest.id, "local-one");
        assert!(artifact.entrypoint.is_none());
        assert!(!artifact.is_scratch());
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let result = LocalResolver::new()
            .resolve(&SourceDescriptor::local("/definitely/not/here"))
            .await;
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
    }
}
