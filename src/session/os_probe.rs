//! Remote OS detection
//!
//! One-shot classification of the remote host after connect. The result is
//! cached on the session and picks the process-listing dialect.
//!
//! - `uname` output containing darwin / linux / bsd decides directly
//! - if `uname` is not a command, `ver` is tried; a clean answer means Windows
//! - anything else, or a timeout, is `Unknown` (logged, never fatal)

use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::ssh::RemoteShell;

const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Remote operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RemoteOs {
    Linux,
    MacOs,
    Bsd,
    Windows,
    Unknown,
}

impl RemoteOs {
    /// Icon class stored on the endpoint record
    pub fn icon(&self) -> &'static str {
        match self {
            RemoteOs::MacOs => "fa-brands fa-apple",
            RemoteOs::Linux => "fa-brands fa-linux",
            RemoteOs::Bsd => "fa-brands fa-freebsd",
            RemoteOs::Windows => "fa-brands fa-windows",
            RemoteOs::Unknown => "fa-regular fa-circle-question",
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, RemoteOs::Windows)
    }
}

/// Classify `uname` output; `None` when it does not name a known Unix.
pub fn classify_uname(output: &str) -> Option<RemoteOs> {
    let s = output.trim().to_lowercase();

    // Git Bash / MSYS / Cygwin answer uname on Windows hosts
    if s.starts_with("mingw") || s.starts_with("msys") || s.starts_with("cygwin") {
        return Some(RemoteOs::Windows);
    }
    if s.contains("darwin") {
        Some(RemoteOs::MacOs)
    } else if s.contains("linux") {
        Some(RemoteOs::Linux)
    } else if s.contains("bsd") {
        Some(RemoteOs::Bsd)
    } else {
        None
    }
}

fn looks_like_missing_command(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("command not found")
        || lower.contains("is not recognized")
        || lower.contains("not found")
}

/// Run the probe over `shell`.
pub async fn detect_remote_os(shell: &dyn RemoteShell) -> RemoteOs {
    match timeout(PROBE_TIMEOUT, probe(shell)).await {
        Ok(os) => {
            info!("[OsProbe] Remote OS detected: {:?}", os);
            os
        }
        Err(_) => {
            warn!("[OsProbe] Detection timed out after {:?}", PROBE_TIMEOUT);
            RemoteOs::Unknown
        }
    }
}

async fn probe(shell: &dyn RemoteShell) -> RemoteOs {
    let uname = match shell.exec("uname").await {
        Ok(output) => output.combined(),
        Err(e) => {
            warn!("[OsProbe] uname failed: {}", e);
            return RemoteOs::Unknown;
        }
    };

    if let Some(os) = classify_uname(&uname) {
        return os;
    }

    if looks_like_missing_command(&uname) || uname.trim().is_empty() {
        match shell.exec("ver").await {
            Ok(output) => {
                let text = output.combined();
                let clean_exit = matches!(output.exit_status, Some(0) | None);
                if clean_exit
                    && !text.trim().is_empty()
                    && !looks_like_missing_command(&text)
                    && !text.to_lowercase().contains("error")
                {
                    return RemoteOs::Windows;
                }
            }
            Err(e) => warn!("[OsProbe] ver failed: {}", e),
        }
    }

    RemoteOs::Unknown
}
