//! File transfer
//!
//! The engine copies entries in either direction and writes each file's
//! status through the ledger; the registry sweeps and republishes it.

pub mod engine;
pub mod ids;
pub mod ledger;
pub mod record;
pub mod scratch;

pub use engine::{TransferEngine, TransferError, CHUNK_SIZE};
pub use ids::{next_transfer_id, TransferIdGenerator};
pub use ledger::{LedgerError, LedgerStore, RedbLedgerStore, TransferLedger, UpsertPermit};
pub use record::{
    progress_percent, sweep_stale, TransferDirection, TransferRecord, TransferStatus,
    TransferViews, STALE_AFTER,
};
pub use scratch::provision_scratch_path;
