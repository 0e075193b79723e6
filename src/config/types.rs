//! User options

use serde::{Deserialize, Serialize};

/// Current options file version
pub const OPTIONS_VERSION: u32 = 1;

/// Options controlling refresh cadence and how much the indexer computes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppOptions {
    pub version: u32,

    /// Interval between per-session refresh ticks
    pub refresh_interval_ms: u64,

    /// Keep processes with zero CPU usage in the process list
    pub show_idle_remote_tasks: bool,

    pub index_local_file_size: bool,
    pub index_remote_file_size: bool,

    /// Aggregate directory sizes when a local directory is expanded
    pub index_local_directories: bool,
    /// Aggregate directory sizes when a remote directory is expanded
    pub index_remote_directories: bool,

    /// Stop the per-session refresh tick entirely
    pub disable_automatic_refresh: bool,
    /// Keep polling processes but stop re-listing both trees
    pub disable_automatic_file_refresh: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            version: OPTIONS_VERSION,
            refresh_interval_ms: 2000,
            show_idle_remote_tasks: false,
            index_local_file_size: false,
            index_remote_file_size: false,
            index_local_directories: false,
            index_remote_directories: false,
            disable_automatic_refresh: false,
            disable_automatic_file_refresh: false,
        }
    }
}

/// Which side of a session a listing belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Remote,
}

impl AppOptions {
    /// Whether file sizes are shown for `scope`.
    pub fn shows_size(&self, scope: Scope) -> bool {
        match scope {
            Scope::Local => self.index_local_file_size || self.index_local_directories,
            Scope::Remote => self.index_remote_file_size || self.index_remote_directories,
        }
    }

    /// Whether expanded directories get an aggregated size for `scope`.
    pub fn aggregates_directories(&self, scope: Scope) -> bool {
        match scope {
            Scope::Local => self.index_local_directories,
            Scope::Remote => self.index_remote_directories,
        }
    }
}
