//! SSH module - handles SSH connections using the russh library.
//!
//! # Features
//! - Password, key file and in-memory key authentication
//! - Host key trust by SHA-256 digest against saved endpoints
//! - One-shot commands and interactive PTY shells
//! - A [`Connector`] seam so sessions can run against fakes

mod client;
mod config;
mod connector;
mod error;
mod handle_owner;
mod host_key;
mod shell;

pub use client::{ClientHandler, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use connector::{Connector, RusshConnector};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use host_key::{decide, host_key_hash, HostKeyResolution, HostKeyVerifier, TrustDecision};
pub use shell::{CommandOutput, PtyRequest, RemoteShell, RusshShell, ShellChannel, ShellInput};
