//! Transfer id generation
//!
//! Ids are minted before any ledger row exists, so they must be unique on
//! their own: the millisecond clock fills the high bits and a sequence the low
//! bits. Ids never repeat or go backwards within a process, even if the
//! wall clock does.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

const SEQUENCE_BITS: u32 = 12;

pub struct TransferIdGenerator {
    last: AtomicU64,
}

static GLOBAL: TransferIdGenerator = TransferIdGenerator::new();

impl TransferIdGenerator {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        let now = (Utc::now().timestamp_millis().max(0) as u64) << SEQUENCE_BITS;
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }
}

impl Default for TransferIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Next id from the process-wide generator
pub fn next_transfer_id() -> u64 {
    GLOBAL.next_id()
}
