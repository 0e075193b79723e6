//! DawnFTP - SFTP/SSH client core
//!
//! Connection sessions with paired command and file-transfer channels, local
//! and remote directory indexing, tracked transfers persisted to a ledger, and
//! the registry that owns the open tabs.

pub mod config;
pub mod index;
pub mod registry;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod transfer;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{
    AppOptions, ConfigStorage, CredentialStore, EndpointStore, EndpointStoreError,
    KeyringCredentialStore, MemoryCredentialStore, StorageError,
};
use registry::SessionRegistry;
use session::SessionServices;
use ssh::RusshConnector;
use transfer::{LedgerError, RedbLedgerStore, TransferLedger};

/// Result handed to the GUI for user-triggered operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub message: String,
}

impl OperationOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
/// Later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("Options: {0}")]
    Options(#[from] StorageError),

    #[error("Transfer ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Endpoint store: {0}")]
    Endpoints(#[from] EndpointStoreError),
}

/// Process-wide stores and the session registry, wired once at startup.
pub struct CoreServices {
    pub options: ConfigStorage,
    pub endpoints: Arc<EndpointStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub registry: Arc<SessionRegistry>,
}

impl CoreServices {
    /// Open every store under `~/.dawnftp` and start the registry.
    ///
    /// Any store that cannot be opened aborts startup.
    pub async fn initialize() -> Result<Self, InitError> {
        let options = ConfigStorage::new()?;
        let ledger = TransferLedger::open_default()?;
        let endpoints = EndpointStore::open(&EndpointStore::default_path()?)?;
        Self::assemble(options, ledger, endpoints, keychain_or_memory()).await
    }

    /// Same wiring with every store under `dir`
    pub async fn initialize_in(
        dir: &Path,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, InitError> {
        std::fs::create_dir_all(dir).map_err(StorageError::from)?;
        let options = ConfigStorage::with_path(dir.join("options.json"));
        let ledger = TransferLedger::new(Arc::new(RedbLedgerStore::open(
            &dir.join("transfers.redb"),
        )?));
        let endpoints = EndpointStore::open(&dir.join("endpoints.redb"))?;
        Self::assemble(options, ledger, endpoints, credentials).await
    }

    async fn assemble(
        options: ConfigStorage,
        ledger: TransferLedger,
        endpoints: EndpointStore,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, InitError> {
        let loaded: AppOptions = options.load().await?;
        let endpoints = Arc::new(endpoints);

        let services = SessionServices {
            connector: Arc::new(RusshConnector),
            endpoints: Some(endpoints.clone()),
            ledger: Arc::new(ledger),
            options: Arc::new(RwLock::new(loaded)),
            shutdown: CancellationToken::new(),
        };
        let registry = Arc::new(SessionRegistry::new(services).with_credentials(credentials.clone()));
        registry.start();

        info!("DawnFTP core ready, options at {:?}", options.path());
        Ok(Self {
            options,
            endpoints,
            credentials,
            registry,
        })
    }

    /// Persist the registry's current options
    pub async fn save_options(&self) -> Result<(), StorageError> {
        self.options.save(&self.registry.options()).await
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

fn keychain_or_memory() -> Arc<dyn CredentialStore> {
    let keychain = KeyringCredentialStore::new();
    if keychain.is_available() {
        Arc::new(keychain)
    } else {
        warn!("System keychain unavailable, saved passwords last for this run only");
        Arc::new(MemoryCredentialStore::new())
    }
}
