// ! Uploaded archive resolver
// !
// ! Archives are validated entry by entry before anything is written: an
// ! entry that is absolute, contains `..` or is a link rejects the whole
// ! archive. Extraction happens inside a scratch directory that is removed
// ! when the resulting artifact drops.

use super::{
    PluginArtifact, SourceDescriptor, SourceKind, SourceResolver, locate_plugin_root, scratch_dir,
};
use crate::core::error::SourceError;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from the file name, falling back to magic bytes
    pub fn detect(file_name: &str, data: &[u8]) -> Option<Self> {
        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            return Some(ArchiveFormat::Zip);
        }
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            return Some(ArchiveFormat::TarGz);
        }
        match data {
            [b'P', b'K', 0x03, 0x04, ..] => Some(ArchiveFormat::Zip),
            [0x1f, 0x8b, ..] => Some(ArchiveFormat::TarGz),
            _ => None,
        }
    }
}

/// Resolves plugins from uploaded archives
#[derive(Debug, Clone)]
pub struct ArchiveResolver {
    scratch_root: PathBuf,
    max_bytes: u64,
}

impl ArchiveResolver {
    pub fn new(scratch_root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            max_bytes,
        }
    }
}

#[async_trait]
impl SourceResolver for ArchiveResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Archive
    }

    async fn resolve(&self, descriptor: &SourceDescriptor) -> Result<PluginArtifact, SourceError> {
        let SourceDescriptor::Archive { file_name, data } = descriptor else {
            return Err(SourceError::Unavailable(format!(
                "archive resolver cannot handle {}",
                descriptor.describe()
            )));
        };

        if data.is_empty() {
            return Err(SourceError::InvalidArchive("archive is empty".to_string()));
        }
        let size = data.len() as u64;
        if size > self.max_bytes {
            return Err(SourceError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        let format = ArchiveFormat::detect(file_name, data).ok_or_else(|| {
            SourceError::InvalidArchive(format!(
                "unsupported archive '{file_name}', expected .zip or .tar.gz"
            ))
        })?;

        let data = data.clone();
        let file_name = file_name.clone();
        let scratch_root = self.scratch_root.clone();
        let max_bytes = self.max_bytes;

        tokio::task::spawn_blocking(move || {
            let scratch = scratch_dir(&scratch_root, "archive-")?;
            let entries = extract_archive(format, &data, scratch.path(), max_bytes)?;
            debug!(file_name = %file_name, entries, "Archive extracted");

            let (root, manifest) = locate_plugin_root(scratch.path(), true)?;
            let source = SourceDescriptor::Archive {
                file_name,
                data: Vec::new(),
            };
            Ok(PluginArtifact::from_root(manifest, root, source, Some(scratch)))
        })
        .await
        .map_err(|e| SourceError::Unavailable(format!("extraction task failed: {e}")))?
    }
}

/// Extract `data` into `dest`, returning the number of files written
///
/// Every entry is checked before the first byte is written. Blocking.
pub fn extract_archive(
    format: ArchiveFormat,
    data: &[u8],
    dest: &Path,
    max_unpacked: u64,
) -> Result<usize, SourceError> {
    match format {
        ArchiveFormat::Zip => extract_zip(data, dest, max_unpacked),
        ArchiveFormat::TarGz => extract_tar_gz(data, dest, max_unpacked),
    }
}

/// Map an archive entry name to a path relative to the destination
///
/// Returns `None` for entries that name the destination itself (`./`).
pub fn safe_entry_path(name: &str) -> Result<Option<PathBuf>, SourceError> {
    let normalized = name.replace('\\', "/");
    let mut relative = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                warn!(entry = name, "Rejecting archive entry outside destination");
                return Err(SourceError::PathTraversal(name.to_string()));
            }
        }
    }
    Ok((!relative.as_os_str().is_empty()).then_some(relative))
}

fn invalid(err: impl std::fmt::Display) -> SourceError {
    SourceError::InvalidArchive(err.to_string())
}

fn extract_zip(data: &[u8], dest: &Path, max_unpacked: u64) -> Result<usize, SourceError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(invalid)?;

    let mut declared: u64 = 0;
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(invalid)?;
        safe_entry_path(entry.name())?;
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            return Err(SourceError::PathTraversal(format!(
                "{}: symbolic links are not allowed",
                entry.name()
            )));
        }
        declared = declared.saturating_add(entry.size());
    }
    if declared > max_unpacked {
        return Err(SourceError::TooLarge {
            size: declared,
            limit: max_unpacked,
        });
    }

    let mut written = 0;
    let mut unpacked: u64 = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(invalid)?;
        let Some(relative) = safe_entry_path(entry.name())? else {
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        let mode = entry.unix_mode();
        unpacked += write_entry(&mut entry, &target, max_unpacked - unpacked)?;
        apply_mode(&target, mode)?;
        written += 1;
    }
    Ok(written)
}

fn extract_tar_gz(data: &[u8], dest: &Path, max_unpacked: u64) -> Result<usize, SourceError> {
    {
        let mut archive = tar::Archive::new(GzDecoder::new(data));
        for entry in archive.entries().map_err(invalid)? {
            let entry = entry.map_err(invalid)?;
            let path = entry.path().map_err(invalid)?.to_string_lossy().into_owned();
            safe_entry_path(&path)?;
            match entry.header().entry_type() {
                tar::EntryType::Symlink | tar::EntryType::Link => {
                    return Err(SourceError::PathTraversal(format!(
                        "{path}: link entries are not allowed"
                    )));
                }
                _ => {}
            }
        }
    }

    let mut written = 0;
    let mut unpacked: u64 = 0;
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    for entry in archive.entries().map_err(invalid)? {
        let mut entry = entry.map_err(invalid)?;
        let path = entry.path().map_err(invalid)?.to_string_lossy().into_owned();
        let Some(relative) = safe_entry_path(&path)? else {
            continue;
        };
        let target = dest.join(relative);
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mode = entry.header().mode().ok();
                unpacked += write_entry(&mut entry, &target, max_unpacked - unpacked)?;
                apply_mode(&target, mode)?;
                written += 1;
            }
            other => debug!(entry = %path, kind = ?other, "Skipping archive entry"),
        }
    }
    Ok(written)
}

fn write_entry(reader: &mut impl Read, target: &Path, budget: u64) -> Result<u64, SourceError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(target)?;
    let copied = io::copy(&mut reader.take(budget.saturating_add(1)), &mut file)?;
    if copied > budget {
        return Err(SourceError::TooLarge {
            size: copied,
            limit: budget,
        });
    }
    Ok(copied)
}

#[cfg(unix)]
fn apply_mode(target: &Path, mode: Option<u32>) -> Result<(), SourceError> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o755))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_target: &Path, _mode: Option<u32>) -> Result<(), SourceError> {
    Ok(())
}
