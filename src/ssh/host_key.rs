//! Host key trust
//!
//! The server key is reduced to an uppercase hex SHA-256 digest and trusted
//! automatically when:
//! - the session already trusted this digest during this run, or
//! - the saved endpoint `(name, host_icon)` stores the same digest, or
//! - no saved endpoint exists yet and the user asked to remember it.
//!
//! Anything else leaves the connection pending an explicit decision.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::config::{EndpointRecord, EndpointStore};

/// Uppercase hex SHA-256 of the raw key bytes
pub fn host_key_hash(key_bytes: &[u8]) -> String {
    let digest = Sha256::digest(key_bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(hex, "{:02X}", byte);
    }
    hex
}

/// Why a key was accepted, or that it was not
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    SessionTrusted,
    StoredMatch,
    FirstTrustOnRemember,
    Pending,
}

impl TrustDecision {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, TrustDecision::Pending)
    }
}

/// User answer to a pending host key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyResolution {
    /// Trust for the lifetime of this session only
    TrustOnce,
    /// Trust and persist the digest on the endpoint record
    TrustAlways,
    Reject,
}

fn hashes_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Pure trust rule.
pub fn decide(
    observed: &str,
    session_trusted: Option<&str>,
    stored: Option<&EndpointRecord>,
    remember: bool,
) -> TrustDecision {
    if session_trusted.is_some_and(|trusted| hashes_equal(trusted, observed)) {
        return TrustDecision::SessionTrusted;
    }

    // A record without a digest still counts as existing
    match stored {
        Some(record) if !record.key_hash.is_empty() && hashes_equal(&record.key_hash, observed) => {
            TrustDecision::StoredMatch
        }
        Some(_) => TrustDecision::Pending,
        None if remember => TrustDecision::FirstTrustOnRemember,
        None => TrustDecision::Pending,
    }
}

/// Shared between the russh handlers of both channels of one session.
pub struct HostKeyVerifier {
    endpoint: EndpointRecord,
    remember: bool,
    session_trusted: Arc<RwLock<Option<String>>>,
    store: Option<Arc<EndpointStore>>,
    pending: Mutex<Option<String>>,
    // Both channels report the same key concurrently
    check_lock: Mutex<()>,
}

impl HostKeyVerifier {
    pub fn new(
        endpoint: EndpointRecord,
        remember: bool,
        session_trusted: Arc<RwLock<Option<String>>>,
        store: Option<Arc<EndpointStore>>,
    ) -> Self {
        Self {
            endpoint,
            remember,
            session_trusted,
            store,
            pending: Mutex::new(None),
            check_lock: Mutex::new(()),
        }
    }

    /// Called from the host-key-received hook with the server's public key bytes.
    pub fn verify(&self, key_bytes: &[u8]) -> bool {
        self.verify_hash(&host_key_hash(key_bytes))
    }

    pub fn verify_hash(&self, hash: &str) -> bool {
        let _guard = self.check_lock.lock();
        let stored = self.stored_record();
        let session_trusted = self.session_trusted.read().clone();
        let decision = decide(hash, session_trusted.as_deref(), stored.as_ref(), self.remember);

        match decision {
            TrustDecision::Pending => {
                warn!(
                    "Host key for {} needs confirmation (hash {})",
                    self.endpoint.name, hash
                );
                *self.pending.lock() = Some(hash.to_string());
                false
            }
            TrustDecision::FirstTrustOnRemember => {
                info!("Trusting first host key for remembered endpoint {}", self.endpoint.name);
                self.persist(hash);
                *self.session_trusted.write() = Some(hash.to_string());
                true
            }
            _ => {
                *self.session_trusted.write() = Some(hash.to_string());
                true
            }
        }
    }

    /// Digest that was refused, if the last check left the connection pending
    pub fn take_pending(&self) -> Option<String> {
        self.pending.lock().take()
    }

    /// Save `hash` on the endpoint record, creating the record when absent.
    pub fn persist(&self, hash: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let icon = self.endpoint.host_icon.as_deref();
        let result = store
            .update_key_hash(&self.endpoint.name, icon, hash)
            .and_then(|updated| {
                if updated {
                    Ok(())
                } else {
                    let mut record = self.endpoint.clone();
                    record.key_hash = hash.to_string();
                    store.insert(&record).map(|_| ())
                }
            });
        if let Err(e) = result {
            warn!("Failed to persist host key for {}: {}", self.endpoint.name, e);
        }
    }

    fn stored_record(&self) -> Option<EndpointRecord> {
        let store = self.store.as_ref()?;
        match store.find_by_name_and_icon(&self.endpoint.name, self.endpoint.host_icon.as_deref()) {
            Ok(record) => record,
            Err(e) => {
                warn!("Endpoint lookup failed during host key check: {}", e);
                None
            }
        }
    }
}
