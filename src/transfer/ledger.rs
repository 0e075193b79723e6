//! Transfer ledger
//!
//! Durable table of [`TransferRecord`]s. Writers are the transfer engine
//! (progress and completion) and the stale sweep; readers are the transfer
//! views. Every write bumps a `data_version` counter in the same transaction,
//! so observers can cheaply tell whether anything changed since their last
//! look.
//!
//! Progress writes are rate limited per transfer by a busy gate: while one
//! upsert for an id is in flight, further progress ticks for that id are
//! dropped. Completion waits for the gate and always lands last.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use redb::{ReadableTable, TableDefinition};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::record::{progress_percent, sweep_stale, TransferRecord, TransferStatus};
use crate::config::data_dir;

const TRANSFERS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("transfers");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("transfer_meta");
const DATA_VERSION_KEY: &str = "data_version";

/// How often completion re-checks the busy gate
const COMPLETION_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Cannot determine transfer ledger location")]
    NoStorePath,

    #[error("Transfer ledger error: {0}")]
    Storage(String),
}

fn storage_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> LedgerError {
    move |e| LedgerError::Storage(format!("{}: {}", context, e))
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert or replace the record with `record.id`. Last write wins.
    async fn upsert(&self, record: &TransferRecord) -> Result<(), LedgerError>;

    async fn get(&self, id: u64) -> Result<Option<TransferRecord>, LedgerError>;

    async fn list_all(&self) -> Result<Vec<TransferRecord>, LedgerError>;

    /// Monotonic counter bumped by every committed write
    async fn data_version(&self) -> Result<u64, LedgerError>;

    /// Mark `id` Faulted if, as stored right now, it is a stale Running row.
    /// Returns the faulted record, or `None` when the row was left alone.
    async fn fault_if_stale(
        &self,
        id: u64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<TransferRecord>, LedgerError>;
}

fn bump_version(write_txn: &redb::WriteTransaction) -> Result<(), LedgerError> {
    let mut meta = write_txn
        .open_table(META_TABLE)
        .map_err(storage_err("Failed to open ledger meta table"))?;
    let version = meta
        .get(DATA_VERSION_KEY)
        .map_err(storage_err("Failed to read data version"))?
        .map(|v| v.value())
        .unwrap_or(0);
    meta.insert(DATA_VERSION_KEY, version + 1)
        .map_err(storage_err("Failed to bump data version"))?;
    Ok(())
}

/// redb-backed ledger (`~/.dawnftp/transfers.redb`)
pub struct RedbLedgerStore {
    db: redb::Database,
}

impl RedbLedgerStore {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        info!("Opening transfer ledger at {:?}", path);

        let db = redb::Database::create(path)
            .map_err(storage_err("Failed to create ledger database"))?;

        let write_txn = db
            .begin_write()
            .map_err(storage_err("Failed to begin write transaction"))?;
        {
            let _transfers = write_txn
                .open_table(TRANSFERS_TABLE)
                .map_err(storage_err("Failed to open transfers table"))?;
            let _meta = write_txn
                .open_table(META_TABLE)
                .map_err(storage_err("Failed to open ledger meta table"))?;
        }
        write_txn
            .commit()
            .map_err(storage_err("Failed to commit transaction"))?;

        Ok(Self { db })
    }

    pub fn default_path() -> Result<PathBuf, LedgerError> {
        let dir = data_dir().map_err(|_| LedgerError::NoStorePath)?;
        std::fs::create_dir_all(&dir).map_err(storage_err("Failed to create data directory"))?;
        Ok(dir.join("transfers.redb"))
    }
}

#[async_trait]
impl LedgerStore for RedbLedgerStore {
    async fn upsert(&self, record: &TransferRecord) -> Result<(), LedgerError> {
        let serialized =
            rmp_serde::to_vec_named(record).map_err(storage_err("Failed to serialize record"))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(storage_err("Failed to begin write transaction"))?;
        {
            let mut table = write_txn
                .open_table(TRANSFERS_TABLE)
                .map_err(storage_err("Failed to open transfers table"))?;
            table
                .insert(record.id, serialized.as_slice())
                .map_err(storage_err("Failed to write record"))?;
        }
        bump_version(&write_txn)?;
        write_txn
            .commit()
            .map_err(storage_err("Failed to commit transaction"))?;

        debug!(
            "Ledger upsert {} {:?} {:.2}%",
            record.id, record.status, record.progress
        );
        Ok(())
    }

    async fn get(&self, id: u64) -> Result<Option<TransferRecord>, LedgerError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(storage_err("Failed to begin read transaction"))?;
        let table = read_txn
            .open_table(TRANSFERS_TABLE)
            .map_err(storage_err("Failed to open transfers table"))?;

        match table.get(id).map_err(storage_err("Failed to read record"))? {
            Some(value) => Ok(Some(
                rmp_serde::from_slice(value.value())
                    .map_err(storage_err("Failed to deserialize record"))?,
            )),
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> Result<Vec<TransferRecord>, LedgerError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(storage_err("Failed to begin read transaction"))?;
        let table = read_txn
            .open_table(TRANSFERS_TABLE)
            .map_err(storage_err("Failed to open transfers table"))?;

        let mut records = Vec::new();
        for item in table.iter().map_err(storage_err("Failed to iterate ledger"))? {
            let (key, value) = item.map_err(storage_err("Failed to read ledger entry"))?;
            match rmp_serde::from_slice::<TransferRecord>(value.value()) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable ledger entry {}: {}", key.value(), e),
            }
        }
        Ok(records)
    }

    async fn data_version(&self) -> Result<u64, LedgerError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(storage_err("Failed to begin read transaction"))?;
        let meta = read_txn
            .open_table(META_TABLE)
            .map_err(storage_err("Failed to open ledger meta table"))?;
        Ok(meta
            .get(DATA_VERSION_KEY)
            .map_err(storage_err("Failed to read data version"))?
            .map(|v| v.value())
            .unwrap_or(0))
    }

    async fn fault_if_stale(
        &self,
        id: u64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<TransferRecord>, LedgerError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(storage_err("Failed to begin write transaction"))?;
        let faulted = {
            let mut table = write_txn
                .open_table(TRANSFERS_TABLE)
                .map_err(storage_err("Failed to open transfers table"))?;
            let current = table
                .get(id)
                .map_err(storage_err("Failed to read record"))?
                .map(|v| v.value().to_vec());
            let Some(bytes) = current else {
                return Ok(None);
            };
            let mut record: TransferRecord = rmp_serde::from_slice(&bytes)
                .map_err(storage_err("Failed to deserialize record"))?;
            if !record.is_stale(now) {
                return Ok(None);
            }

            record.status = TransferStatus::Faulted;
            let serialized = rmp_serde::to_vec_named(&record)
                .map_err(storage_err("Failed to serialize record"))?;
            table
                .insert(id, serialized.as_slice())
                .map_err(storage_err("Failed to write record"))?;
            record
        };
        bump_version(&write_txn)?;
        write_txn
            .commit()
            .map_err(storage_err("Failed to commit transaction"))?;
        Ok(Some(faulted))
    }
}

/// Holds an id in the busy gate until dropped
pub struct UpsertPermit {
    id: u64,
    busy: Arc<DashSet<u64>>,
}

impl Drop for UpsertPermit {
    fn drop(&mut self) {
        self.busy.remove(&self.id);
    }
}

/// Ledger front used by the engine and the reconciliation loop
pub struct TransferLedger {
    store: Arc<dyn LedgerStore>,
    busy: Arc<DashSet<u64>>,
}

impl TransferLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            busy: Arc::new(DashSet::new()),
        }
    }

    pub fn open_default() -> Result<Self, LedgerError> {
        let store = RedbLedgerStore::open(&RedbLedgerStore::default_path()?)?;
        Ok(Self::new(Arc::new(store)))
    }

    /// Claim `id` if no upsert for it is in flight.
    pub fn try_acquire(&self, id: u64) -> Option<UpsertPermit> {
        self.busy.insert(id).then(|| UpsertPermit {
            id,
            busy: self.busy.clone(),
        })
    }

    pub fn is_busy(&self, id: u64) -> bool {
        self.busy.contains(&id)
    }

    /// Direct write, bypassing the gate
    pub async fn upsert(&self, record: &TransferRecord) -> Result<(), LedgerError> {
        self.store.upsert(record).await
    }

    /// Fire-and-forget progress write. Returns false when the tick was dropped
    /// because a previous write for the same id is still in flight.
    pub fn report_progress(&self, record: TransferRecord) -> bool {
        let Some(permit) = self.try_acquire(record.id) else {
            return false;
        };

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.upsert(&record).await {
                warn!("Progress write for transfer {} failed: {}", record.id, e);
            }
            drop(permit);
        });
        true
    }

    /// Wait out any in-flight progress write, then store `record` as a
    /// finished Success row.
    pub async fn complete(&self, mut record: TransferRecord) -> Result<(), LedgerError> {
        let permit = loop {
            if let Some(permit) = self.try_acquire(record.id) {
                break permit;
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        };

        let now = chrono::Utc::now();
        record.status = TransferStatus::Success;
        record.progress = progress_percent(record.file_size, record.file_size);
        record.ended_at = Some(now);
        record.last_update = now;

        let result = self.store.upsert(&record).await;
        drop(permit);
        result
    }

    pub async fn get(&self, id: u64) -> Result<Option<TransferRecord>, LedgerError> {
        self.store.get(id).await
    }

    pub async fn list_all(&self) -> Result<Vec<TransferRecord>, LedgerError> {
        self.store.list_all().await
    }

    pub async fn data_version(&self) -> Result<u64, LedgerError> {
        self.store.data_version().await
    }

    /// Fault every stale Running record. Returns how many were faulted.
    ///
    /// Candidates come from a snapshot; each is re-checked inside its own
    /// write so a completion that lands in between is never overwritten.
    pub async fn sweep(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize, LedgerError> {
        let records = self.store.list_all().await?;
        let mut count = 0;
        for candidate in sweep_stale(&records, now) {
            match self.store.fault_if_stale(candidate.id, now).await? {
                Some(record) => {
                    warn!(
                        "[Ledger] Transfer {} ({}) stalled at {:.2}%, marking faulted",
                        record.id, record.file_name, record.progress
                    );
                    count += 1;
                }
                None => debug!("[Ledger] Transfer {} moved on before the sweep", candidate.id),
            }
        }
        Ok(count)
    }
}
