//! Credential store
//!
//! Saved passwords live in the system keychain through the `keyring` crate.
//! Callers depend on the [`CredentialStore`] capability so the core can run on
//! platforms without a keychain (and in tests) with another backing.

use std::collections::HashMap;
use std::sync::OnceLock;

use keyring::Entry;
use parking_lot::Mutex;
use uuid::Uuid;

/// Package name every DawnFTP secret is filed under
pub const PACKAGE_NAME: &str = "dawn.ftp";

/// Credential errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No usable credential backend on this platform/session
    #[error("Credential store not available: {0}")]
    NotAvailable(String),

    #[error("Secret not found for {0}")]
    NotFound(String),

    #[error("Keychain error: {0}")]
    Keyring(String),
}

/// `(package, service, account)` triple addressing one secret
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub package: String,
    pub service: String,
    pub account: String,
}

impl CredentialKey {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            package: PACKAGE_NAME.to_string(),
            service: service.into(),
            account: account.into(),
        }
    }

    fn keyring_service(&self) -> String {
        format!("{}.{}", self.package, self.service)
    }
}

impl std::fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.package, self.service, self.account)
    }
}

/// Get/set/delete secrets by [`CredentialKey`].
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &CredentialKey) -> Result<String, CredentialError>;

    fn set(&self, key: &CredentialKey, secret: &str) -> Result<(), CredentialError>;

    /// Deleting a missing secret is not an error
    fn delete(&self, key: &CredentialKey) -> Result<(), CredentialError>;

    /// Whether the backend works at all on this machine
    fn is_available(&self) -> bool;
}

/// System keychain backend
#[derive(Debug, Default)]
pub struct KeyringCredentialStore {
    available: OnceLock<bool>,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(key: &CredentialKey) -> Result<Entry, CredentialError> {
        Entry::new(&key.keyring_service(), &key.account).map_err(map_keyring_error)
    }

    /// Write, read back and delete a throwaway entry.
    fn probe() -> bool {
        let key = CredentialKey::new("probe", format!("probe-{}", Uuid::new_v4()));
        let result = (|| -> Result<bool, CredentialError> {
            let entry = Self::entry(&key)?;
            entry.set_password("probe").map_err(map_keyring_error)?;
            let read_back = entry.get_password().map_err(map_keyring_error)?;
            entry.delete_credential().map_err(map_keyring_error)?;
            Ok(read_back == "probe")
        })();

        match result {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!("Keychain probe failed: {}", e);
                false
            }
        }
    }
}

fn map_keyring_error(err: keyring::Error) -> CredentialError {
    match err {
        keyring::Error::NoEntry => CredentialError::NotFound("keychain entry".to_string()),
        keyring::Error::PlatformFailure(e) => CredentialError::NotAvailable(e.to_string()),
        keyring::Error::NoStorageAccess(e) => CredentialError::NotAvailable(e.to_string()),
        other => CredentialError::Keyring(other.to_string()),
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, key: &CredentialKey) -> Result<String, CredentialError> {
        tracing::debug!("Keychain get: {}", key);
        match Self::entry(key)?.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => Err(CredentialError::NotFound(key.to_string())),
            Err(e) => Err(map_keyring_error(e)),
        }
    }

    fn set(&self, key: &CredentialKey, secret: &str) -> Result<(), CredentialError> {
        tracing::debug!("Keychain set: {}", key);
        Self::entry(key)?
            .set_password(secret)
            .map_err(map_keyring_error)
    }

    fn delete(&self, key: &CredentialKey) -> Result<(), CredentialError> {
        match Self::entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(map_keyring_error(e)),
        }
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(Self::probe)
    }
}

/// Process-local store, used where no keychain exists. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    secrets: Mutex<HashMap<CredentialKey, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &CredentialKey) -> Result<String, CredentialError> {
        self.secrets
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(key.to_string()))
    }

    fn set(&self, key: &CredentialKey, secret: &str) -> Result<(), CredentialError> {
        self.secrets.lock().insert(key.clone(), secret.to_string());
        Ok(())
    }

    fn delete(&self, key: &CredentialKey) -> Result<(), CredentialError> {
        self.secrets.lock().remove(key);
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}
