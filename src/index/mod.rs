//! Filesystem indexing
//!
//! Lists local and remote directories into [`FileSystemEntry`] trees. A
//! permission-denied listing is reported as [`IndexError::PermissionDenied`],
//! never as an empty directory.

mod entry;
mod local;
mod remote;

pub use entry::{
    extension_of, owner_permissions, sort_listing, DirectoryEntry, EntryIcon, EntryInfo,
    FileEntry, FileSystemEntry, PARENT_ENTRY_NAME,
};

use thiserror::Error;

use crate::config::AppOptions;
use crate::sftp::SftpError;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Access denied: {0}")]
    PermissionDenied(String),

    #[error("Directory not found: {0}")]
    NotFound(String),

    #[error("Cannot determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote error: {0}")]
    Remote(SftpError),
}

impl From<SftpError> for IndexError {
    fn from(err: SftpError) -> Self {
        match err {
            SftpError::PermissionDenied(path) => IndexError::PermissionDenied(path),
            SftpError::FileNotFound(path) => IndexError::NotFound(path),
            other => IndexError::Remote(other),
        }
    }
}

/// Lists directories with the size/indexing rules of one options snapshot.
#[derive(Debug, Clone, Default)]
pub struct FilesystemIndexer {
    options: AppOptions,
}

impl FilesystemIndexer {
    pub fn new(options: AppOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AppOptions {
        &self.options
    }
}

/// Sort a listing and prepend the navigate-up row unless the listing is a root.
fn finish_listing(mut entries: Vec<FileSystemEntry>, parent: Option<String>) -> Vec<FileSystemEntry> {
    sort_listing(&mut entries);
    if let Some(parent) = parent {
        let link = FileSystemEntry::parent_link(&parent, entries.clone());
        entries.insert(0, link);
    }
    entries
}
