//! Path helpers
//!
//! Remote SFTP paths always use `/`, even against Windows servers. Local paths
//! go through `PathBuf` so separators match the host platform.

use std::path::{Path, PathBuf};

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join local path components using platform-native separator.
pub fn join_local_path(base: &str, component: &str) -> String {
    let mut path = PathBuf::from(base);
    path.push(component);
    path.to_string_lossy().to_string()
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Parent of a remote path; `None` for the root.
pub fn remote_parent(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(trimmed[..idx].to_string()),
        None => Some(".".to_string()),
    }
}

/// Last component of a remote path
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Parent of a local path as a string; `None` for a filesystem root.
pub fn local_parent(path: &Path) -> Option<String> {
    path.parent().map(|p| p.to_string_lossy().to_string())
}
