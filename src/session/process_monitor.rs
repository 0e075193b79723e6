//! Remote process table
//!
//! Runs a one-shot `top` for the detected OS family and turns its text into
//! [`ProcessSnapshot`] rows ranked by CPU usage. A line that does not parse is
//! logged and dropped; it never fails the whole refresh.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::os_probe::RemoteOs;
use crate::ssh::{RemoteShell, SshError};

const LINUX_COMMAND: &str = "top -b -n 1 | head -n 30";
const MACOS_COMMAND: &str = "top -l 1 -o cpu -n 20";

/// One row of the remote process table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub name: String,
    pub owner: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub runtime: Duration,
}

#[derive(Error, Debug, PartialEq)]
pub enum ProcessParseError {
    #[error("expected at least {expected} columns, got {found}")]
    TooFewColumns { expected: usize, found: usize },

    #[error("not a number: {0}")]
    BadNumber(String),

    #[error("unrecognized run time: {0}")]
    BadRuntime(String),
}

/// Listing command for `os`; `None` where process listing is unsupported.
pub fn process_command(os: RemoteOs) -> Option<&'static str> {
    match os {
        RemoteOs::Linux => Some(LINUX_COMMAND),
        RemoteOs::MacOs => Some(MACOS_COMMAND),
        RemoteOs::Bsd | RemoteOs::Windows | RemoteOs::Unknown => None,
    }
}

/// Column positions of one output dialect
struct ColumnLayout {
    min_columns: usize,
    owner: Option<usize>,
    cpu: usize,
    mem: Option<usize>,
    time: usize,
    /// `None` means the last column
    name: Option<usize>,
}

/// `top -b`: PID USER PR NI VIRT RES SHR S %CPU %MEM TIME+ COMMAND
const LINUX_TOP: ColumnLayout = ColumnLayout {
    min_columns: 12,
    owner: Some(1),
    cpu: 8,
    mem: Some(9),
    time: 10,
    name: None,
};

/// `top -l`: PID COMMAND %CPU TIME #TH #WQ #PORTS MEM PURG CMPRS PGRP PPID STATE ...
/// No user column in the default set.
const MACOS_TOP: ColumnLayout = ColumnLayout {
    min_columns: 12,
    owner: None,
    cpu: 2,
    mem: None,
    time: 3,
    name: Some(1),
};

/// `ps -o pid,user,%cpu,%mem,time,comm` style: PID USER %CPU %MEM TIME COMMAND
const SHORT: ColumnLayout = ColumnLayout {
    min_columns: 6,
    owner: Some(1),
    cpu: 2,
    mem: Some(3),
    time: 4,
    name: None,
};

fn layout_for(os: RemoteOs, columns: usize) -> &'static ColumnLayout {
    let full = match os {
        RemoteOs::MacOs => &MACOS_TOP,
        _ => &LINUX_TOP,
    };
    if columns >= full.min_columns {
        full
    } else {
        &SHORT
    }
}

fn parse_percent(token: &str) -> Result<f64, ProcessParseError> {
    token
        .trim_end_matches('%')
        .replace(',', ".")
        .parse::<f64>()
        .map_err(|_| ProcessParseError::BadNumber(token.to_string()))
}

/// Parse `M:SS.hh`, `MM:SS` or `H:MM:SS`.
pub fn parse_runtime(token: &str) -> Result<Duration, ProcessParseError> {
    let bad = || ProcessParseError::BadRuntime(token.to_string());
    let whole = |s: &str| s.parse::<u64>().map_err(|_| bad());

    // "SS" or "SS.hh" into milliseconds
    let seconds_ms = |s: &str| -> Result<u64, ProcessParseError> {
        let (secs, fraction) = s.split_once('.').unwrap_or((s, ""));
        if fraction.len() > 3 || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad());
        }
        let millis = if fraction.is_empty() {
            0
        } else {
            format!("{:0<3}", fraction).parse::<u64>().map_err(|_| bad())?
        };
        Ok(whole(secs)? * 1000 + millis)
    };

    let parts: Vec<&str> = token.split(':').collect();
    let millis = match parts.as_slice() {
        [minutes, seconds] => whole(*minutes)? * 60_000 + seconds_ms(*seconds)?,
        [hours, minutes, seconds] if !seconds.contains('.') => {
            whole(*hours)? * 3_600_000 + whole(*minutes)? * 60_000 + whole(*seconds)? * 1000
        }
        _ => return Err(bad()),
    };
    Ok(Duration::from_millis(millis))
}

/// Parse one line. `Ok(None)` for header, blank and non-process lines.
pub fn parse_process_line(
    line: &str,
    os: RemoteOs,
) -> Result<Option<ProcessSnapshot>, ProcessParseError> {
    let line = line.trim();
    if line.is_empty() || line.to_ascii_uppercase().starts_with("PID") {
        return Ok(None);
    }
    if !line.starts_with(|c: char| c.is_ascii_digit()) {
        return Ok(None);
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    let layout = layout_for(os, parts.len());
    if parts.len() < layout.min_columns {
        return Err(ProcessParseError::TooFewColumns {
            expected: layout.min_columns,
            found: parts.len(),
        });
    }

    let pid = parts[0]
        .parse::<u32>()
        .map_err(|_| ProcessParseError::BadNumber(parts[0].to_string()))?;
    let name = match layout.name {
        Some(idx) => parts[idx],
        None => parts[parts.len() - 1],
    };
    let owner = layout
        .owner
        .and_then(|idx| parts.get(idx))
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let memory_percent = match layout.mem {
        Some(idx) => parse_percent(parts[idx])?,
        None => 0.0,
    };

    Ok(Some(ProcessSnapshot {
        pid,
        name: name.to_string(),
        owner,
        cpu_percent: parse_percent(parts[layout.cpu])?,
        memory_percent,
        runtime: parse_runtime(parts[layout.time])?,
    }))
}

/// Parse, filter and rank a whole `top` output.
pub fn parse_process_table(output: &str, os: RemoteOs, show_idle: bool) -> Vec<ProcessSnapshot> {
    let mut processes: Vec<ProcessSnapshot> = output
        .lines()
        .filter_map(|line| match parse_process_line(line, os) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("[ProcessMonitor] Skipping line {:?}: {}", line, e);
                None
            }
        })
        .filter(|p| show_idle || p.cpu_percent != 0.0)
        .collect();

    processes.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
    processes
}

/// Polls the remote process table through the command channel.
pub struct ProcessMonitor;

impl ProcessMonitor {
    pub async fn refresh(
        shell: &dyn RemoteShell,
        os: RemoteOs,
        show_idle: bool,
    ) -> Result<Vec<ProcessSnapshot>, SshError> {
        let Some(command) = process_command(os) else {
            return Ok(Vec::new());
        };

        let output = shell.exec(command).await?;
        let processes = parse_process_table(&output.stdout, os, show_idle);
        debug!("[ProcessMonitor] {} processes", processes.len());
        Ok(processes)
    }
}
