//! Local directory listing

use std::fs::Metadata;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use tracing::debug;

use super::entry::{extension_of, DirectoryEntry, EntryIcon, EntryInfo, FileEntry, FileSystemEntry};
use super::{finish_listing, FilesystemIndexer, IndexError};
use crate::config::Scope;
use crate::sftp::path_utils::local_parent;

impl FilesystemIndexer {
    /// List `path` on the local disk; an empty path lists the user's home.
    pub async fn list_local(&self, path: &str) -> Result<Vec<FileSystemEntry>, IndexError> {
        let dir = resolve_local(path)?;
        let entries = self.read_local_children(&dir).await?;
        Ok(finish_listing(entries, local_parent(&dir)))
    }

    /// Load the children of a local directory, descending into every
    /// subdirectory when `recursive` is set.
    pub async fn expand_local(&self, path: &str, recursive: bool) -> Result<DirectoryEntry, IndexError> {
        let dir = resolve_local(path)?;
        let metadata = tokio::fs::metadata(&dir).await.map_err(|e| map_io(e, &dir))?;
        let info = local_info(&dir, &metadata, EntryIcon::Folder);
        self.expand_local_inner(info, dir, recursive).await
    }

    fn expand_local_inner(
        &self,
        info: EntryInfo,
        dir: PathBuf,
        recursive: bool,
    ) -> BoxFuture<'_, Result<DirectoryEntry, IndexError>> {
        async move {
            let mut children = self.read_local_children(&dir).await?;

            if recursive {
                for child in children.iter_mut() {
                    if let FileSystemEntry::Directory(sub) = child {
                        let sub_info = sub.info().clone();
                        let sub_path = PathBuf::from(&sub_info.path);
                        match self.expand_local_inner(sub_info, sub_path, true).await {
                            Ok(expanded) => *sub = expanded,
                            // An unreadable subdirectory stays unexpanded
                            Err(IndexError::PermissionDenied(p)) => debug!("Skipping denied {}", p),
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            let aggregate = self.options.aggregates_directories(Scope::Local);
            Ok(DirectoryEntry::with_children(info, children, aggregate))
        }
        .boxed()
    }

    async fn read_local_children(&self, dir: &Path) -> Result<Vec<FileSystemEntry>, IndexError> {
        let mut read_dir = tokio::fs::read_dir(dir).await.map_err(|e| map_io(e, dir))?;
        let show_size = self.options.shows_size(Scope::Local);
        let mut entries = Vec::new();

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            // Follow symlinks; broken links and files deleted mid-listing are skipped
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };

            if metadata.is_dir() {
                let info = local_info(&path, &metadata, EntryIcon::Folder);
                entries.push(FileSystemEntry::Directory(DirectoryEntry::new(info)));
            } else {
                let name = entry.file_name().to_string_lossy().to_string();
                let extension = extension_of(&name);
                let mut info = local_info(
                    &path,
                    &metadata,
                    EntryIcon::for_extension(extension.as_deref()),
                );
                if show_size {
                    info.size = Some(metadata.len());
                }
                entries.push(FileSystemEntry::File(FileEntry {
                    info,
                    extension,
                    permissions: local_permissions(&metadata),
                }));
            }
        }

        Ok(entries)
    }
}

fn resolve_local(path: &str) -> Result<PathBuf, IndexError> {
    if path.trim().is_empty() {
        dirs::home_dir().ok_or(IndexError::NoHomeDir)
    } else {
        Ok(PathBuf::from(path))
    }
}

fn map_io(err: std::io::Error, path: &Path) -> IndexError {
    let shown = path.to_string_lossy().to_string();
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => IndexError::PermissionDenied(shown),
        std::io::ErrorKind::NotFound => IndexError::NotFound(shown),
        _ => IndexError::Io(err),
    }
}

fn local_info(path: &Path, metadata: &Metadata, icon: EntryIcon) -> EntryInfo {
    EntryInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string()),
        parent_path: local_parent(path).unwrap_or_default(),
        path: path.to_string_lossy().to_string(),
        created: metadata.created().ok().map(DateTime::<Utc>::from),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        size: None,
        icon,
    }
}

#[cfg(unix)]
fn local_permissions(metadata: &Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    Some(super::entry::owner_permissions(metadata.permissions().mode()))
}

#[cfg(not(unix))]
fn local_permissions(_metadata: &Metadata) -> Option<String> {
    None
}
