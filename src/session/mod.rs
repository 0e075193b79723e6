//! Connection sessions
//!
//! A [`ConnectionSession`] owns one endpoint's command channel and
//! file-transfer channel, the two directory views, the process snapshot and
//! any interactive shells. Observers get plain state through accessors, a
//! broadcast of [`SessionEvent`]s and `watch` receivers per collection.

mod connection;
pub mod os_probe;
pub mod process_monitor;
mod state;

pub use connection::{ConnectionSession, SessionServices, ShellHandle};
pub use os_probe::{classify_uname, detect_remote_os, RemoteOs};
pub use process_monitor::{
    parse_process_line, parse_process_table, parse_runtime, process_command, ProcessMonitor,
    ProcessParseError, ProcessSnapshot,
};
pub use state::SessionState;

use thiserror::Error;

use crate::index::IndexError;
use crate::sftp::SftpError;
use crate::ssh::SshError;
use crate::transfer::TransferError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Sftp(#[from] SftpError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SessionError::Index(IndexError::PermissionDenied(_)))
    }
}

/// Notifications raised by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// The server key needs a trust decision; carries its digest
    HostKeyPending { hash: String },
    /// A remote listing was refused; the previous listing is kept
    PermissionDenied { path: String },
    ShellOpened { title: String },
}
