//! Filesystem entry model
//!
//! Local and remote listings produce the same [`FileSystemEntry`] values, so
//! the session and transfer code never care which side a row came from.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Name of the synthetic navigate-up entry
pub const PARENT_ENTRY_NAME: &str = "...";

/// Display icon category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryIcon {
    Folder,
    Parent,
    Pdf,
    Word,
    Video,
    Executable,
    Generic,
}

impl EntryIcon {
    /// Classify a file by extension (case-insensitive, with or without the dot).
    pub fn for_extension(extension: Option<&str>) -> Self {
        let Some(ext) = extension else {
            return EntryIcon::Generic;
        };
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => EntryIcon::Pdf,
            "doc" | "docx" => EntryIcon::Word,
            "mp4" | "mov" | "avi" | "wmv" | "mkv" | "webm" => EntryIcon::Video,
            "exe" | "appimage" | "app" => EntryIcon::Executable,
            _ => EntryIcon::Generic,
        }
    }
}

/// Fields shared by files and directories
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub name: String,
    /// Directory containing the entry
    pub parent_path: String,
    /// Full path of the entry itself
    pub path: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub icon: EntryIcon,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    #[serde(flatten)]
    pub info: EntryInfo,
    /// Extension without the dot
    pub extension: Option<String>,
    /// Owner permission bits as `rwx`, where the platform exposes them
    pub permissions: Option<String>,
}

/// A directory whose children are loaded on demand.
///
/// Size is only ever set together with the children it was summed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    #[serde(flatten)]
    info: EntryInfo,
    children: Option<Vec<FileSystemEntry>>,
}

impl DirectoryEntry {
    /// Unexpanded directory
    pub fn new(mut info: EntryInfo) -> Self {
        info.size = None;
        Self {
            info,
            children: None,
        }
    }

    /// Expanded directory; `aggregate` sums the immediate children's sizes.
    pub fn with_children(info: EntryInfo, children: Vec<FileSystemEntry>, aggregate: bool) -> Self {
        let mut dir = Self::new(info);
        dir.set_children(children, aggregate);
        dir
    }

    pub fn set_children(&mut self, children: Vec<FileSystemEntry>, aggregate: bool) {
        self.info.size = if aggregate {
            Some(children.iter().filter_map(FileSystemEntry::size).sum())
        } else {
            None
        };
        self.children = Some(children);
    }

    pub fn info(&self) -> &EntryInfo {
        &self.info
    }

    /// `None` until expanded
    pub fn children(&self) -> Option<&[FileSystemEntry]> {
        self.children.as_deref()
    }

    pub fn is_expanded(&self) -> bool {
        self.children.is_some()
    }

    pub fn into_children(self) -> Option<Vec<FileSystemEntry>> {
        self.children
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileSystemEntry {
    File(FileEntry),
    Directory(DirectoryEntry),
}

impl FileSystemEntry {
    pub fn info(&self) -> &EntryInfo {
        match self {
            FileSystemEntry::File(file) => &file.info,
            FileSystemEntry::Directory(dir) => dir.info(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    pub fn path(&self) -> &str {
        &self.info().path
    }

    pub fn size(&self) -> Option<u64> {
        self.info().size
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileSystemEntry::Directory(_))
    }

    /// The synthetic "..." row
    pub fn is_parent_link(&self) -> bool {
        self.info().icon == EntryIcon::Parent
    }

    /// Navigate-up row pointing at `parent_path`, memoizing the listing it sits in.
    pub fn parent_link(parent_path: &str, children: Vec<FileSystemEntry>) -> Self {
        let info = EntryInfo {
            name: PARENT_ENTRY_NAME.to_string(),
            parent_path: parent_path.to_string(),
            path: parent_path.to_string(),
            created: None,
            modified: None,
            size: None,
            icon: EntryIcon::Parent,
        };
        FileSystemEntry::Directory(DirectoryEntry::with_children(info, children, false))
    }
}

/// Owner permission bits of a unix mode as `rwx` / `rw-` / ...
pub fn owner_permissions(mode: u32) -> String {
    let bit = |mask: u32, c: char| if mode & mask != 0 { c } else { '-' };
    [bit(0o400, 'r'), bit(0o200, 'w'), bit(0o100, 'x')]
        .iter()
        .collect()
}

/// Extension without the dot, `None` for dotfiles and extensionless names
pub fn extension_of(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_string())
}

/// Listing order: parent link, then directories, then files, each by name.
pub fn sort_listing(entries: &mut [FileSystemEntry]) {
    entries.sort_by(|a, b| {
        b.is_parent_link()
            .cmp(&a.is_parent_link())
            .then_with(|| b.is_dir().cmp(&a.is_dir()))
            .then_with(|| a.name().to_lowercase().cmp(&b.name().to_lowercase()))
            .then_with(|| a.name().cmp(b.name()))
    });
}
