//! Transfer records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A Running record untouched for this long is considered abandoned
pub const STALE_AFTER: Duration = Duration::seconds(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Running,
    Faulted,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Local disk to server
    HostToRemote,
    /// Server to local disk
    RemoteToHost,
}

/// Durable state of one file transfer, keyed by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: u64,
    pub file_name: String,
    pub source: String,
    pub destination: String,
    /// Best effort; empty when unknown
    pub remote_ip: String,
    /// Bytes moved so far
    pub file_size: u64,
    /// 0-100 with two decimals
    pub progress: f64,
    pub status: TransferStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

impl TransferRecord {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == TransferStatus::Running && now - self.last_update >= STALE_AFTER
    }
}

/// `round(done / total * 100, 2)`; an empty file is complete.
pub fn progress_percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let percent = (done as f64 / total as f64 * 100.0).min(100.0);
    (percent * 100.0).round() / 100.0
}

/// Faulted copies of every stale Running record. Progress and timestamps are kept.
pub fn sweep_stale(records: &[TransferRecord], now: DateTime<Utc>) -> Vec<TransferRecord> {
    records
        .iter()
        .filter(|r| r.is_stale(now))
        .map(|r| TransferRecord {
            status: TransferStatus::Faulted,
            ..r.clone()
        })
        .collect()
}

/// Records split by status, newest activity first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferViews {
    pub running: Vec<TransferRecord>,
    pub faulted: Vec<TransferRecord>,
    pub success: Vec<TransferRecord>,
}

impl TransferViews {
    pub fn partition(mut records: Vec<TransferRecord>) -> Self {
        records.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        let mut views = TransferViews::default();
        for record in records {
            match record.status {
                TransferStatus::Running => views.running.push(record),
                TransferStatus::Faulted => views.faulted.push(record),
                TransferStatus::Success => views.success.push(record),
            }
        }
        views
    }
}

#[cfg(test)]
pub(crate) fn sample_record(id: u64, status: TransferStatus, last_update: DateTime<Utc>) -> TransferRecord {
    TransferRecord {
        id,
        file_name: format!("file-{}.bin", id),
        source: format!("/local/file-{}.bin", id),
        destination: format!("/remote/file-{}.bin", id),
        remote_ip: String::new(),
        file_size: 512,
        progress: 50.0,
        status,
        started_at: last_update,
        ended_at: None,
        last_update,
    }
}
