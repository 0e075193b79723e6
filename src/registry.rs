//! Session Registry
//!
//! Owns the open sessions in tab order, the selected tab, and the
//! reconciliation loop that keeps the transfer views in step with the ledger.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{
    AppOptions, CredentialError, CredentialKey, CredentialStore, EndpointRecord,
    EndpointStoreError,
};
use crate::session::{ConnectionSession, SessionServices};
use crate::ssh::AuthMethod;
use crate::transfer::{LedgerError, TransferStatus, TransferViews, STALE_AFTER};

/// Reconciliation tick
pub const RECONCILE_INTERVAL: Duration = Duration::from_millis(200);

const CLONE_SUFFIX: &str = "_copy";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("No session at tab {0}")]
    InvalidIndex(usize),

    #[error("No session selected")]
    NothingSelected,

    #[error("No credential available for {0}")]
    MissingCredential(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Endpoint(#[from] EndpointStoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

struct RegistryEntry {
    session: Arc<ConnectionSession>,
    order: usize,
}

pub struct SessionRegistry {
    services: SessionServices,
    credentials: Option<Arc<dyn CredentialStore>>,
    sessions: DashMap<String, RegistryEntry>,
    /// Source of tab positions; never reused
    order_counter: AtomicUsize,
    selected: RwLock<Option<String>>,
    views: watch::Sender<TransferViews>,
    /// Ledger data version seen by the last reconcile that did work
    seen_version: Mutex<Option<u64>>,
    /// When the oldest Running row goes stale; forces a pass even if
    /// nothing was written since
    stale_deadline: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl SessionRegistry {
    pub fn new(services: SessionServices) -> Self {
        Self {
            services,
            credentials: None,
            sessions: DashMap::new(),
            order_counter: AtomicUsize::new(0),
            selected: RwLock::new(None),
            views: watch::channel(TransferViews::default()).0,
            seen_version: Mutex::new(None),
            stale_deadline: Mutex::new(None),
        }
    }

    pub fn with_credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    pub fn options(&self) -> AppOptions {
        self.services.options.read().clone()
    }

    /// Replace the options every session reads on its next tick
    pub fn set_options(&self, options: AppOptions) {
        *self.services.options.write() = options;
    }

    /// Register `session` as the last tab and select it.
    pub fn add(&self, session: Arc<ConnectionSession>) -> String {
        let id = session.id().to_string();
        let order = self.order_counter.fetch_add(1, Ordering::SeqCst);
        info!("[Registry] Adding session {} ({}) at {}", id, session.name(), order);

        self.sessions.insert(id.clone(), RegistryEntry { session, order });
        *self.selected.write() = Some(id.clone());
        id
    }

    /// Build a session for `endpoint` and add it.
    pub fn create(
        &self,
        endpoint: EndpointRecord,
        auth: AuthMethod,
        remember: bool,
    ) -> Arc<ConnectionSession> {
        let session = Arc::new(ConnectionSession::new(
            endpoint,
            auth,
            remember,
            self.services.clone(),
        ));
        self.add(session.clone());
        session
    }

    /// Open a saved endpoint. A missing password is read from the credential store.
    pub fn open_saved(
        &self,
        endpoint: EndpointRecord,
        auth: Option<AuthMethod>,
    ) -> Result<Arc<ConnectionSession>, RegistryError> {
        let needs_password = !endpoint.use_key_auth
            && match &auth {
                Some(AuthMethod::Password { password }) => password.is_empty(),
                Some(_) => false,
                None => true,
            };

        let auth = if needs_password {
            let store = self
                .credentials
                .as_ref()
                .ok_or_else(|| RegistryError::MissingCredential(endpoint.name.clone()))?;
            let key = CredentialKey::new(&endpoint.host, &endpoint.username);
            debug!("[Registry] Reading saved password for {}", key);
            AuthMethod::password(store.get(&key)?)
        } else {
            auth.ok_or_else(|| RegistryError::MissingCredential(endpoint.name.clone()))?
        };

        Ok(self.create(endpoint, auth, true))
    }

    fn ordered_entries(&self) -> Vec<(usize, Arc<ConnectionSession>)> {
        let mut entries: Vec<_> = self
            .sessions
            .iter()
            .map(|e| (e.order, e.session.clone()))
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries
    }

    /// Sessions in tab order
    pub fn sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.ordered_entries().into_iter().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnectionSession>> {
        self.sessions.get(id).map(|e| e.session.clone())
    }

    pub fn selected(&self) -> Option<Arc<ConnectionSession>> {
        let id = self.selected.read().clone()?;
        self.get(&id)
    }

    /// Select the tab at `index`
    pub fn select(&self, index: usize) -> Result<Arc<ConnectionSession>, RegistryError> {
        let session = self
            .sessions()
            .into_iter()
            .nth(index)
            .ok_or(RegistryError::InvalidIndex(index))?;
        *self.selected.write() = Some(session.id().to_string());
        Ok(session)
    }

    pub fn select_id(&self, id: &str) -> Result<Arc<ConnectionSession>, RegistryError> {
        let session = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        *self.selected.write() = Some(id.to_string());
        Ok(session)
    }

    /// Disconnect and drop a session. A removed selection moves to the
    /// previous tab, else the next one.
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let ordered: Vec<String> = self
            .sessions()
            .iter()
            .map(|s| s.id().to_string())
            .collect();

        let Some((_, entry)) = self.sessions.remove(id) else {
            return Err(RegistryError::NotFound(id.to_string()));
        };

        {
            let mut selected = self.selected.write();
            if selected.as_deref() == Some(id) {
                let neighbour = ordered.iter().position(|s| s == id).and_then(|pos| {
                    if pos > 0 {
                        ordered.get(pos - 1)
                    } else {
                        ordered.get(pos + 1)
                    }
                });
                *selected = neighbour.cloned();
            }
        }

        info!("[Registry] Removing session {}", id);
        entry.session.disconnect().await;
        Ok(())
    }

    pub async fn close_selected(&self) -> Result<(), RegistryError> {
        let id = self
            .selected
            .read()
            .clone()
            .ok_or(RegistryError::NothingSelected)?;
        self.remove(&id).await
    }

    /// Open a new tab on the same endpoint and select it.
    pub fn clone_session(&self, id: &str) -> Result<Arc<ConnectionSession>, RegistryError> {
        let source = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let mut endpoint = source.endpoint();
        let names: Vec<String> = self.sessions().iter().map(|s| s.name()).collect();
        while names.contains(&endpoint.name) {
            endpoint.name.push_str(CLONE_SUFFIX);
        }

        let session = Arc::new(
            ConnectionSession::new(
                endpoint,
                source.auth(),
                source.remember(),
                self.services.clone(),
            )
            .with_local_path(source.local_path()),
        );
        self.add(session.clone());
        Ok(session)
    }

    /// Status-partitioned transfer records, republished when the ledger changes
    pub fn transfer_views(&self) -> watch::Receiver<TransferViews> {
        self.views.subscribe()
    }

    /// One reconciliation pass. Returns false when the ledger was unchanged
    /// and no Running row has gone stale since the last pass.
    pub async fn reconcile(&self) -> Result<bool, RegistryError> {
        self.reconcile_at(chrono::Utc::now()).await
    }

    pub(crate) async fn reconcile_at(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, RegistryError> {
        let ledger = &self.services.ledger;
        let version = ledger.data_version().await?;
        let stale_due = self.stale_deadline.lock().is_some_and(|deadline| now >= deadline);
        if *self.seen_version.lock() == Some(version) && !stale_due {
            return Ok(false);
        }

        let faulted = ledger.sweep(now).await?;
        if faulted > 0 {
            info!("[Registry] Faulted {} stalled transfer(s)", faulted);
        }

        let records = ledger.list_all().await?;
        *self.stale_deadline.lock() = records
            .iter()
            .filter(|r| r.status == TransferStatus::Running)
            .map(|r| r.last_update + STALE_AFTER)
            .min();
        self.views.send_replace(TransferViews::partition(records));

        // Own sweep writes are already reflected in the published views
        let version = ledger.data_version().await?;
        *self.seen_version.lock() = Some(version);
        Ok(true)
    }

    /// Spawn the reconciliation loop; it ends with the shutdown token.
    pub fn start(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let token = self.services.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = registry.reconcile().await {
                    warn!("[Registry] Reconcile failed: {}", e);
                }
            }
            debug!("[Registry] Reconcile loop stopped");
        });
    }

    /// Stop every loop and disconnect every session.
    pub async fn shutdown(&self) {
        info!("[Registry] Shutting down {} session(s)", self.len());
        self.services.shutdown.cancel();
        for session in self.sessions() {
            session.disconnect().await;
        }
    }
}
