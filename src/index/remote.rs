//! Remote directory listing over the file-transfer channel

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use tracing::debug;

use super::entry::{
    extension_of, owner_permissions, DirectoryEntry, EntryIcon, EntryInfo, FileEntry,
    FileSystemEntry,
};
use super::{finish_listing, FilesystemIndexer, IndexError};
use crate::config::Scope;
use crate::sftp::path_utils::{join_remote_path, remote_file_name, remote_parent};
use crate::sftp::{RemoteDirEntry, RemoteFs, RemoteMetadata};

impl FilesystemIndexer {
    /// List `path` on the server; an empty path lists the login directory.
    pub async fn list_remote(
        &self,
        fs: &dyn RemoteFs,
        path: &str,
    ) -> Result<Vec<FileSystemEntry>, IndexError> {
        let path = if path.trim().is_empty() {
            fs.canonicalize(".").await?
        } else {
            path.to_string()
        };
        let entries = self.read_remote_children(fs, &path).await?;
        Ok(finish_listing(entries, remote_parent(&path)))
    }

    /// Load the children of a remote directory, descending when `recursive` is set.
    pub async fn expand_remote(
        &self,
        fs: &dyn RemoteFs,
        path: &str,
        recursive: bool,
    ) -> Result<DirectoryEntry, IndexError> {
        let metadata = fs.metadata(path).await?;
        let info = remote_info(
            remote_file_name(path),
            remote_parent(path).as_deref().unwrap_or("/"),
            path,
            &metadata,
            EntryIcon::Folder,
        );
        self.expand_remote_inner(fs, info, recursive).await
    }

    fn expand_remote_inner<'a>(
        &'a self,
        fs: &'a dyn RemoteFs,
        info: EntryInfo,
        recursive: bool,
    ) -> BoxFuture<'a, Result<DirectoryEntry, IndexError>> {
        async move {
            let mut children = self.read_remote_children(fs, &info.path).await?;

            if recursive {
                for child in children.iter_mut() {
                    if let FileSystemEntry::Directory(sub) = child {
                        let sub_info = sub.info().clone();
                        match self.expand_remote_inner(fs, sub_info, true).await {
                            Ok(expanded) => *sub = expanded,
                            Err(IndexError::PermissionDenied(p)) => debug!("Skipping denied {}", p),
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            let aggregate = self.options.aggregates_directories(Scope::Remote);
            Ok(DirectoryEntry::with_children(info, children, aggregate))
        }
        .boxed()
    }

    async fn read_remote_children(
        &self,
        fs: &dyn RemoteFs,
        dir: &str,
    ) -> Result<Vec<FileSystemEntry>, IndexError> {
        let listing = fs.list_dir(dir).await?;
        let show_size = self.options.shows_size(Scope::Remote);

        Ok(listing
            .into_iter()
            .filter(|entry| entry.name != "." && entry.name != "..")
            .map(|entry| remote_entry(dir, entry, show_size))
            .collect())
    }
}

fn remote_entry(dir: &str, entry: RemoteDirEntry, show_size: bool) -> FileSystemEntry {
    let path = join_remote_path(dir, &entry.name);
    if entry.metadata.is_dir {
        let info = remote_info(&entry.name, dir, &path, &entry.metadata, EntryIcon::Folder);
        return FileSystemEntry::Directory(DirectoryEntry::new(info));
    }

    let extension = extension_of(&entry.name);
    let mut info = remote_info(
        &entry.name,
        dir,
        &path,
        &entry.metadata,
        EntryIcon::for_extension(extension.as_deref()),
    );
    if show_size {
        info.size = entry.metadata.size;
    }
    FileSystemEntry::File(FileEntry {
        info,
        extension,
        permissions: entry.metadata.permissions.map(owner_permissions),
    })
}

fn remote_info(
    name: &str,
    parent: &str,
    path: &str,
    metadata: &RemoteMetadata,
    icon: EntryIcon,
) -> EntryInfo {
    EntryInfo {
        name: name.to_string(),
        parent_path: parent.to_string(),
        path: path.to_string(),
        // SFTP v3 has no creation time
        created: None,
        modified: metadata
            .modified
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        size: None,
        icon,
    }
}
