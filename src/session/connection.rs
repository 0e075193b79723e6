//! One live endpoint connection
//!
//! Connecting opens the command channel and the file-transfer channel
//! concurrently. Either both come up or the session ends in `Failed` (or
//! `HostKeyPending`) with nothing left open. After connect the OS is probed
//! once, the login directory resolved, "Shell 1" opened and both trees listed.
//! A per-connection refresh task keeps the views current until the
//! connection token is cancelled.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::os_probe::{detect_remote_os, RemoteOs};
use super::process_monitor::{ProcessMonitor, ProcessSnapshot};
use super::state::SessionState;
use super::{SessionError, SessionEvent};
use crate::config::{AppOptions, EndpointRecord, EndpointStore};
use crate::index::{FileSystemEntry, FilesystemIndexer, IndexError};
use crate::sftp::path_utils::{remote_file_name, remote_parent};
use crate::sftp::RemoteFs;
use crate::ssh::{
    AuthMethod, Connector, HostKeyResolution, HostKeyVerifier, PtyRequest, RemoteShell,
    ShellInput, SshConfig, SshError,
};
use crate::transfer::scratch::shell_quote;
use crate::transfer::{provision_scratch_path, TransferDirection, TransferEngine, TransferLedger};
use crate::OperationOutcome;

const FIRST_SHELL_TITLE: &str = "Shell 1";
const EXEC_SHELL_SUFFIX: &str = "-exec";
const ERROR_SEPARATOR: &str = "\n\r";
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Collaborators shared by every session of a registry
#[derive(Clone)]
pub struct SessionServices {
    pub connector: Arc<dyn Connector>,
    pub endpoints: Option<Arc<EndpointStore>>,
    pub ledger: Arc<TransferLedger>,
    pub options: Arc<RwLock<AppOptions>>,
    /// Parent of every connection token
    pub shutdown: CancellationToken,
}

/// An open interactive shell
#[derive(Clone)]
pub struct ShellHandle {
    pub title: String,
    pub input: mpsc::Sender<ShellInput>,
    output: broadcast::Sender<Vec<u8>>,
    pub cancel: CancellationToken,
}

impl ShellHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output.subscribe()
    }

    pub async fn send_line(&self, line: &str) -> Result<(), SshError> {
        self.input
            .send(ShellInput::Data(format!("{}\n", line).into_bytes()))
            .await
            .map_err(|_| SshError::ChannelError(format!("Shell {} is closed", self.title)))
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.input.is_closed()
    }
}

/// Deduplicate connection errors, keeping first-seen order.
pub(crate) fn aggregate_errors<I: IntoIterator<Item = String>>(errors: I) -> String {
    let mut unique: Vec<String> = Vec::new();
    for error in errors {
        if !unique.contains(&error) {
            unique.push(error);
        }
    }
    unique.join(ERROR_SEPARATOR)
}

/// Replace the watched value only when it differs.
fn publish<T: PartialEq>(tx: &watch::Sender<Vec<T>>, next: Vec<T>) -> bool {
    tx.send_if_modified(move |current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

pub struct ConnectionSession {
    id: String,
    services: SessionServices,
    engine: TransferEngine,
    endpoint: RwLock<EndpointRecord>,
    auth: RwLock<AuthMethod>,
    remember: bool,
    state: RwLock<SessionState>,
    last_error: RwLock<Option<String>>,
    session_trusted: Arc<RwLock<Option<String>>>,
    pending_hash: Mutex<Option<String>>,
    shell: RwLock<Option<Arc<dyn RemoteShell>>>,
    fs: RwLock<Option<Arc<dyn RemoteFs>>>,
    os: RwLock<Option<RemoteOs>>,
    local_path: RwLock<String>,
    remote_path: RwLock<String>,
    selected_local: RwLock<Option<FileSystemEntry>>,
    selected_remote: RwLock<Option<FileSystemEntry>>,
    local_files: watch::Sender<Vec<FileSystemEntry>>,
    remote_files: watch::Sender<Vec<FileSystemEntry>>,
    processes: watch::Sender<Vec<ProcessSnapshot>>,
    shells: Mutex<Vec<ShellHandle>>,
    events: broadcast::Sender<SessionEvent>,
    cancel: RwLock<CancellationToken>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionSession {
    pub fn new(
        endpoint: EndpointRecord,
        auth: AuthMethod,
        remember: bool,
        services: SessionServices,
    ) -> Self {
        let engine =
            TransferEngine::new(services.ledger.clone()).with_remote_ip(endpoint.host.clone());
        let (events, _) = broadcast::channel(64);
        let cancel = services.shutdown.child_token();

        Self {
            id: Uuid::new_v4().to_string(),
            services,
            engine,
            endpoint: RwLock::new(endpoint),
            auth: RwLock::new(auth),
            remember,
            state: RwLock::new(SessionState::Disconnected),
            last_error: RwLock::new(None),
            session_trusted: Arc::new(RwLock::new(None)),
            pending_hash: Mutex::new(None),
            shell: RwLock::new(None),
            fs: RwLock::new(None),
            os: RwLock::new(None),
            local_path: RwLock::new(String::new()),
            remote_path: RwLock::new(String::new()),
            selected_local: RwLock::new(None),
            selected_remote: RwLock::new(None),
            local_files: watch::channel(Vec::new()).0,
            remote_files: watch::channel(Vec::new()).0,
            processes: watch::channel(Vec::new()).0,
            shells: Mutex::new(Vec::new()),
            events,
            cancel: RwLock::new(cancel),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Start the local view somewhere other than the home directory
    pub fn with_local_path(self, path: impl Into<String>) -> Self {
        *self.local_path.write() = path.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.endpoint.read().name.clone()
    }

    pub fn endpoint(&self) -> EndpointRecord {
        self.endpoint.read().clone()
    }

    pub fn auth(&self) -> AuthMethod {
        self.auth.read().clone()
    }

    pub fn remember(&self) -> bool {
        self.remember
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Cached OS classification; `None` before the first connect
    pub fn remote_os(&self) -> Option<RemoteOs> {
        *self.os.read()
    }

    pub fn local_path(&self) -> String {
        self.local_path.read().clone()
    }

    pub fn remote_path(&self) -> String {
        self.remote_path.read().clone()
    }

    pub fn local_files(&self) -> watch::Receiver<Vec<FileSystemEntry>> {
        self.local_files.subscribe()
    }

    pub fn remote_files(&self) -> watch::Receiver<Vec<FileSystemEntry>> {
        self.remote_files.subscribe()
    }

    pub fn processes(&self) -> watch::Receiver<Vec<ProcessSnapshot>> {
        self.processes.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn select_local(&self, entry: Option<FileSystemEntry>) {
        *self.selected_local.write() = entry;
    }

    pub fn selected_local(&self) -> Option<FileSystemEntry> {
        self.selected_local.read().clone()
    }

    pub fn select_remote(&self, entry: Option<FileSystemEntry>) {
        *self.selected_remote.write() = entry;
    }

    pub fn selected_remote(&self) -> Option<FileSystemEntry> {
        self.selected_remote.read().clone()
    }

    fn shell_channel(&self) -> Option<Arc<dyn RemoteShell>> {
        self.shell.read().clone()
    }

    fn fs_channel(&self) -> Option<Arc<dyn RemoteFs>> {
        self.fs.read().clone()
    }

    fn set_state(&self, next: SessionState) -> bool {
        {
            let mut state = self.state.write();
            if *state == next {
                return true;
            }
            if !state.can_transition_to(next) {
                warn!(
                    "[Session {}] Ignoring transition {:?} -> {:?}",
                    self.id, *state, next
                );
                return false;
            }
            debug!("[Session {}] {:?} -> {:?}", self.id, *state, next);
            *state = next;
        }
        let _ = self.events.send(SessionEvent::StateChanged(next));
        true
    }

    fn ssh_config(&self) -> SshConfig {
        let endpoint = self.endpoint.read();
        SshConfig {
            host: endpoint.host.clone(),
            port: endpoint.port,
            username: endpoint.username.clone(),
            auth: self.auth.read().clone(),
            ..Default::default()
        }
    }

    fn verifier(&self) -> Arc<HostKeyVerifier> {
        Arc::new(HostKeyVerifier::new(
            self.endpoint.read().clone(),
            self.remember,
            self.session_trusted.clone(),
            self.services.endpoints.clone(),
        ))
    }

    /// Open both channels. A failure on either side fails the whole connect.
    pub async fn connect(self: &Arc<Self>) -> OperationOutcome {
        let Ok(_guard) = self.connect_lock.try_lock() else {
            return OperationOutcome::failed("Connection already in progress");
        };
        if self.state().is_connected() {
            return OperationOutcome::ok("Already connected");
        }
        if !self.set_state(SessionState::Connecting) {
            return OperationOutcome::failed(format!("Cannot connect from {:?}", self.state()));
        }
        *self.last_error.write() = None;

        let token = {
            let mut cancel = self.cancel.write();
            cancel.cancel();
            *cancel = self.services.shutdown.child_token();
            cancel.clone()
        };

        let config = self.ssh_config();
        let verifier = self.verifier();
        info!(
            "[Session {}] Connecting to {}:{}",
            self.id, config.host, config.port
        );

        let connector = &self.services.connector;
        let (shell, fs) = tokio::join!(
            connector.connect_shell(&config, verifier.clone()),
            connector.connect_fs(&config, verifier),
        );

        match (shell, fs) {
            (Ok(shell), Ok(fs)) => {
                *self.shell.write() = Some(shell);
                *self.fs.write() = Some(fs);
                self.set_state(SessionState::Connected);
                self.after_connect().await;
                self.spawn_refresh(token);
                info!("[Session {}] Connected to {}", self.id, self.name());
                OperationOutcome::ok(format!("Connected to {}", self.name()))
            }
            (shell, fs) => {
                if let Ok(shell) = &shell {
                    shell.disconnect().await;
                }
                if let Ok(fs) = &fs {
                    fs.disconnect().await;
                }
                token.cancel();
                let errors: Vec<SshError> = [shell.err(), fs.err()].into_iter().flatten().collect();
                self.connect_failed(errors)
            }
        }
    }

    fn connect_failed(&self, errors: Vec<SshError>) -> OperationOutcome {
        let pending = errors.iter().find_map(|e| match e {
            SshError::HostKeyPending { hash } => Some(hash.clone()),
            _ => None,
        });

        if let Some(hash) = pending {
            info!("[Session {}] Host key {} awaits a decision", self.id, hash);
            *self.pending_hash.lock() = Some(hash.clone());
            self.set_state(SessionState::HostKeyPending);
            let _ = self.events.send(SessionEvent::HostKeyPending { hash: hash.clone() });
            return OperationOutcome::failed(format!("Host key requires confirmation: {}", hash));
        }

        let message = aggregate_errors(errors.iter().map(|e| e.to_string()));
        warn!("[Session {}] Connect failed: {}", self.id, message);
        *self.last_error.write() = Some(message.clone());
        self.set_state(SessionState::Failed);
        OperationOutcome::failed(message)
    }

    async fn after_connect(&self) {
        let (Some(shell), Some(fs)) = (self.shell_channel(), self.fs_channel()) else {
            return;
        };

        if self.remote_os().is_none() {
            let os = detect_remote_os(shell.as_ref()).await;
            *self.os.write() = Some(os);
            self.apply_host_icon(os);
        }

        if self.remote_path().is_empty() {
            match fs.canonicalize(".").await {
                Ok(path) => *self.remote_path.write() = path,
                Err(e) => warn!("[Session {}] Cannot resolve login directory: {}", self.id, e),
            }
        }

        if self.local_path().is_empty() {
            if let Some(home) = dirs::home_dir() {
                *self.local_path.write() = home.to_string_lossy().to_string();
            }
        }

        if let Err(e) = self.open_shell(FIRST_SHELL_TITLE).await {
            warn!("[Session {}] Could not open {}: {}", self.id, FIRST_SHELL_TITLE, e);
        }

        self.refresh().await;
    }

    /// Show the detected OS on the endpoint, carrying a saved profile along.
    fn apply_host_icon(&self, os: RemoteOs) {
        let new_icon = Some(os.icon().to_string());
        let (name, old_icon) = {
            let mut endpoint = self.endpoint.write();
            if endpoint.host_icon == new_icon {
                return;
            }
            let old = std::mem::replace(&mut endpoint.host_icon, new_icon.clone());
            (endpoint.name.clone(), old)
        };

        let Some(store) = &self.services.endpoints else {
            return;
        };
        match store.update_host_icon(&name, old_icon.as_deref(), new_icon.as_deref()) {
            Ok(true) => debug!("[Session {}] Saved profile now shows {}", self.id, os.icon()),
            Ok(false) => {}
            Err(e) => warn!("[Session {}] Could not save host icon: {}", self.id, e),
        }
    }

    /// Answer a pending host key.
    pub async fn resolve_host_key(self: &Arc<Self>, resolution: HostKeyResolution) -> OperationOutcome {
        let Some(hash) = self.pending_hash.lock().take() else {
            return OperationOutcome::failed("No host key decision is pending");
        };

        match resolution {
            HostKeyResolution::TrustOnce => {
                info!("[Session {}] Host key trusted for this session", self.id);
                *self.session_trusted.write() = Some(hash);
                self.connect().await
            }
            HostKeyResolution::TrustAlways => {
                info!("[Session {}] Host key trusted and saved", self.id);
                self.verifier().persist(&hash);
                self.endpoint.write().key_hash = hash.clone();
                *self.session_trusted.write() = Some(hash);
                self.connect().await
            }
            HostKeyResolution::Reject => {
                info!("[Session {}] Host key rejected", self.id);
                self.disconnect().await;
                OperationOutcome::ok("Host key rejected, connection abandoned")
            }
        }
    }

    /// Cancel refresh and shells, close both channels.
    pub async fn disconnect(&self) {
        self.cancel.read().cancel();

        let shells = std::mem::take(&mut *self.shells.lock());
        for shell in shells {
            shell.cancel.cancel();
        }

        let shell = self.shell.write().take();
        let fs = self.fs.write().take();
        if let Some(shell) = shell {
            shell.disconnect().await;
        }
        if let Some(fs) = fs {
            fs.disconnect().await;
        }

        self.pending_hash.lock().take();
        self.set_state(SessionState::Disconnected);
        info!("[Session {}] Disconnected", self.id);
    }

    fn indexer(&self) -> FilesystemIndexer {
        FilesystemIndexer::new(self.services.options.read().clone())
    }

    fn report_denied(&self, err: &SessionError) {
        if let SessionError::Index(IndexError::PermissionDenied(path)) = err {
            warn!("[Session {}] Access denied: {}", self.id, path);
            let _ = self.events.send(SessionEvent::PermissionDenied { path: path.clone() });
        }
    }

    /// List `path` on the local disk and make it the current local directory.
    pub async fn navigate_local(&self, path: &str) -> Result<(), SessionError> {
        let path = if path.trim().is_empty() {
            dirs::home_dir()
                .ok_or(IndexError::NoHomeDir)?
                .to_string_lossy()
                .to_string()
        } else {
            path.to_string()
        };

        match self.indexer().list_local(&path).await {
            Ok(entries) => {
                *self.local_path.write() = path;
                publish(&self.local_files, entries);
                Ok(())
            }
            Err(e) => {
                let err = SessionError::from(e);
                self.report_denied(&err);
                Err(err)
            }
        }
    }

    /// List `path` on the server and make it the current remote directory.
    ///
    /// A denied listing keeps the previous one.
    pub async fn navigate_remote(&self, path: &str) -> Result<(), SessionError> {
        let fs = self.fs_channel().ok_or(SessionError::NotConnected)?;
        let path = if path.trim().is_empty() {
            fs.canonicalize(".").await?
        } else {
            path.to_string()
        };

        match self.indexer().list_remote(fs.as_ref(), &path).await {
            Ok(entries) => {
                *self.remote_path.write() = path;
                publish(&self.remote_files, entries);
                Ok(())
            }
            Err(e) => {
                let err = SessionError::from(e);
                self.report_denied(&err);
                Err(err)
            }
        }
    }

    /// Re-list both current directories
    pub async fn refresh_files(&self) {
        let local = self.local_path();
        if !local.is_empty() {
            if let Err(e) = self.navigate_local(&local).await {
                debug!("[Session {}] Local refresh failed: {}", self.id, e);
            }
        }

        let remote = self.remote_path();
        if !remote.is_empty() && self.fs_channel().is_some() {
            if let Err(e) = self.navigate_remote(&remote).await {
                debug!("[Session {}] Remote refresh failed: {}", self.id, e);
            }
        }
    }

    pub async fn refresh_processes(&self) {
        let Some(shell) = self.shell_channel() else {
            return;
        };
        let os = self.remote_os().unwrap_or(RemoteOs::Unknown);
        let show_idle = self.services.options.read().show_idle_remote_tasks;

        match ProcessMonitor::refresh(shell.as_ref(), os, show_idle).await {
            Ok(processes) => {
                publish(&self.processes, processes);
            }
            Err(e) => warn!("[Session {}] Process refresh failed: {}", self.id, e),
        }
    }

    pub async fn refresh(&self) {
        self.refresh_files().await;
        self.refresh_processes().await;
    }

    /// One periodic refresh, gated by the automatic refresh options.
    pub async fn tick(&self) {
        if !self.state().is_connected() {
            return;
        }

        let lost = self.shell_channel().is_some_and(|s| !s.is_connected())
            || self.fs_channel().is_some_and(|f| !f.is_connected());
        if lost {
            warn!("[Session {}] Transport lost", self.id);
            self.disconnect().await;
            return;
        }

        let options = self.services.options.read().clone();
        if options.disable_automatic_refresh {
            return;
        }
        if !options.disable_automatic_file_refresh {
            self.refresh_files().await;
        }
        self.refresh_processes().await;
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.services.options.read().refresh_interval_ms)
            .max(MIN_REFRESH_INTERVAL)
    }

    fn spawn_refresh(self: &Arc<Self>, token: CancellationToken) {
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(interval) = session.upgrade().map(|s| s.refresh_interval()) else {
                    break;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match session.upgrade() {
                    Some(session) => session.tick().await,
                    None => break,
                }
            }
            debug!("Session refresh loop stopped");
        });
    }

    /// Open an interactive shell, or return the open one with the same title.
    pub async fn open_shell(&self, title: &str) -> Result<ShellHandle, SessionError> {
        if let Some(existing) = self.find_shell(title) {
            return Ok(existing);
        }

        let shell = self.shell_channel().ok_or(SessionError::NotConnected)?;
        let channel = shell.open_pty(PtyRequest::default()).await?;

        // Closing the connection closes its shells
        let connection = self.cancel.read().clone();
        let own = channel.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = connection.cancelled() => own.cancel(),
                _ = own.cancelled() => {}
            }
        });

        let handle = ShellHandle {
            title: title.to_string(),
            input: channel.input,
            output: channel.output,
            cancel: channel.cancel,
        };
        self.shells.lock().push(handle.clone());
        info!("[Session {}] Opened shell {}", self.id, title);
        let _ = self.events.send(SessionEvent::ShellOpened {
            title: title.to_string(),
        });
        Ok(handle)
    }

    fn find_shell(&self, title: &str) -> Option<ShellHandle> {
        let mut shells = self.shells.lock();
        shells.retain(ShellHandle::is_open);
        shells.iter().find(|s| s.title == title).cloned()
    }

    pub fn close_shell(&self, title: &str) -> bool {
        let mut shells = self.shells.lock();
        match shells.iter().position(|s| s.title == title) {
            Some(idx) => {
                shells.remove(idx).cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn shell_titles(&self) -> Vec<String> {
        let mut shells = self.shells.lock();
        shells.retain(ShellHandle::is_open);
        shells.iter().map(|s| s.title.clone()).collect()
    }

    /// Copy `entry` into `destination` over this session's file channel.
    pub async fn transfer(
        &self,
        entry: &FileSystemEntry,
        destination: &str,
        direction: TransferDirection,
    ) -> OperationOutcome {
        let fs = self.fs_channel();
        let token = self.cancel.read().clone();
        let outcome = self
            .engine
            .transfer(Some(entry), destination, direction, &token, fs.as_deref())
            .await;
        if outcome.success {
            self.refresh_files().await;
        }
        outcome
    }

    /// Upload the selected local entry into the current remote directory
    pub async fn upload_selected(&self) -> OperationOutcome {
        let Some(entry) = self.selected_local() else {
            return OperationOutcome::failed("No local item selected");
        };
        let destination = self.remote_path();
        self.transfer(&entry, &destination, TransferDirection::HostToRemote)
            .await
    }

    /// Download the selected remote entry into the current local directory
    pub async fn download_selected(&self) -> OperationOutcome {
        let Some(entry) = self.selected_remote() else {
            return OperationOutcome::failed("No remote item selected");
        };
        let destination = self.local_path();
        self.transfer(&entry, &destination, TransferDirection::RemoteToHost)
            .await
    }

    /// Upload `local_file` to a scratch path and run it in its own shell.
    pub async fn run_script(&self, local_file: &Path) -> OperationOutcome {
        match self.try_run_script(local_file).await {
            Ok(remote) => OperationOutcome::ok(format!("Running {}", remote)),
            Err(e) => {
                warn!("[Session {}] Script run failed: {}", self.id, e);
                OperationOutcome::failed(e.to_string())
            }
        }
    }

    async fn try_run_script(&self, local_file: &Path) -> Result<String, SessionError> {
        let shell = self.shell_channel().ok_or(SessionError::NotConnected)?;
        let fs = self.fs_channel().ok_or(SessionError::NotConnected)?;
        let os = self.remote_os().unwrap_or(RemoteOs::Unknown);

        let file_name = local_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "script path has no file name")
            })?;
        let extension = local_file
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        let remote_path = provision_scratch_path(shell.as_ref(), os, &extension).await?;

        let mut reader = tokio::fs::File::open(local_file).await?;
        let mut writer = fs.create(&remote_path).await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await?;

        let dir = remote_parent(&remote_path).unwrap_or_else(|| "/".to_string());
        let name = remote_file_name(&remote_path);
        let command = if extension.eq_ignore_ascii_case("py") {
            format!("python3 {}", shell_quote(name))
        } else {
            format!("./{}", shell_quote(name))
        };

        let handle = self
            .open_shell(&format!("{}{}", file_name, EXEC_SHELL_SUFFIX))
            .await?;
        handle.send_line(&format!("cd {}", shell_quote(&dir))).await?;
        handle.send_line(&command).await?;

        info!("[Session {}] Running {} as {}", self.id, file_name, remote_path);
        Ok(remote_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::process_monitor::process_command;
    use crate::testing::{DirBackedRemoteFs, FakeConnector, ScriptedShell};
    use crate::transfer::{RedbLedgerStore, TransferStatus};
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        connector: Arc<FakeConnector>,
        services: SessionServices,
        local: PathBuf,
        server: PathBuf,
        _dirs: Vec<TempDir>,
    }

    fn linux_shell() -> ScriptedShell {
        ScriptedShell::new()
            .respond("uname", "Linux\n")
            .respond(process_command(RemoteOs::Linux).unwrap(), "")
    }

    fn fixture_with(
        shell: ScriptedShell,
        configure_fs: impl FnOnce(DirBackedRemoteFs) -> DirBackedRemoteFs,
        with_store: bool,
    ) -> Fixture {
        let work = tempdir().unwrap();
        let local = tempdir().unwrap();
        let server = tempdir().unwrap();

        let fs = configure_fs(DirBackedRemoteFs::new(server.path()));
        let connector = Arc::new(FakeConnector::new(shell, fs));
        let ledger_store = RedbLedgerStore::open(&work.path().join("transfers.redb")).unwrap();
        let endpoints = with_store
            .then(|| Arc::new(EndpointStore::open(&work.path().join("endpoints.redb")).unwrap()));

        let services = SessionServices {
            connector: connector.clone(),
            endpoints,
            ledger: Arc::new(TransferLedger::new(Arc::new(ledger_store))),
            options: Arc::new(RwLock::new(AppOptions {
                disable_automatic_refresh: true,
                ..Default::default()
            })),
            shutdown: CancellationToken::new(),
        };

        Fixture {
            connector,
            services,
            local: local.path().to_path_buf(),
            server: server.path().to_path_buf(),
            _dirs: vec![work, local, server],
        }
    }

    fn fixture(with_store: bool) -> Fixture {
        fixture_with(linux_shell(), |fs| fs, with_store)
    }

    fn session(fx: &Fixture, remember: bool) -> Arc<ConnectionSession> {
        Arc::new(
            ConnectionSession::new(
                EndpointRecord::new("example.com", 22, "ops"),
                AuthMethod::password("pw"),
                remember,
                fx.services.clone(),
            )
            .with_local_path(fx.local.to_string_lossy()),
        )
    }

    fn names(rx: &watch::Receiver<Vec<FileSystemEntry>>) -> Vec<String> {
        rx.borrow().iter().map(|e| e.name().to_string()).collect()
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_connect_detects_os_lists_and_opens_first_shell() {
        let fx = fixture_with(linux_shell(), |fs| fs.with_home("/home/ops"), true);
        std::fs::create_dir_all(fx.server.join("home/ops")).unwrap();
        std::fs::write(fx.server.join("home/ops/notes.txt"), b"n").unwrap();
        std::fs::write(fx.local.join("local.txt"), b"l").unwrap();
        let session = session(&fx, true);

        let outcome = session.connect().await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.remote_os(), Some(RemoteOs::Linux));
        assert_eq!(session.remote_path(), "/home/ops");
        assert!(names(&session.remote_files()).contains(&"notes.txt".to_string()));
        assert!(names(&session.local_files()).contains(&"local.txt".to_string()));
        assert_eq!(session.shell_titles(), vec![FIRST_SHELL_TITLE]);
        assert_eq!(fx.connector.shell.ptys_opened(), 1);
        assert_eq!(fx.connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_first_trust_on_remember_persists_hash() {
        let fx = fixture(true);
        let session = session(&fx, true);

        assert!(session.connect().await.success);
        let store = fx.services.endpoints.clone().unwrap();
        let linux = Some(RemoteOs::Linux.icon());
        let saved = store.find_by_name_and_icon("ops @ example.com", linux).unwrap().unwrap();
        assert_eq!(saved.key_hash, fx.connector.host_key_hash());
        assert_eq!(session.endpoint().host_icon.as_deref(), linux);
        assert!(store.find_by_name_and_icon("ops @ example.com", None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_saved_profile_reconnects_with_detected_icon() {
        let fx = fixture(true);
        let first = session(&fx, true);
        assert!(first.connect().await.success);
        first.disconnect().await;

        let store = fx.services.endpoints.clone().unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        let saved = store.list().unwrap().remove(0);
        assert_eq!(saved.host_icon.as_deref(), Some(RemoteOs::Linux.icon()));

        // The saved record, icon included, still matches its stored hash
        let again = Arc::new(ConnectionSession::new(
            saved,
            AuthMethod::password("pw"),
            false,
            fx.services.clone(),
        ));
        assert!(again.connect().await.success);
        assert_eq!(again.state(), SessionState::Connected);
        assert_eq!(store.list().unwrap().len(), 1);

        // Reconnecting the first tab uses its updated icon too
        assert!(first.connect().await.success);
    }

    #[tokio::test]
    async fn test_unknown_key_without_remember_is_pending() {
        let fx = fixture(false);
        let session = session(&fx, false);
        let mut events = session.subscribe();

        let outcome = session.connect().await;
        assert!(!outcome.success);
        assert_eq!(session.state(), SessionState::HostKeyPending);
        let hash = fx.connector.host_key_hash();
        assert!(drain(&mut events).contains(&SessionEvent::HostKeyPending { hash: hash.clone() }));
        assert!(session.shell_titles().is_empty());

        let outcome = session.resolve_host_key(HostKeyResolution::TrustOnce).await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_stored_hash_connects_regardless_of_remember() {
        let fx = fixture(true);
        let mut record = EndpointRecord::new("example.com", 22, "ops");
        record.key_hash = fx.connector.host_key_hash();
        fx.services.endpoints.as_ref().unwrap().insert(&record).unwrap();

        let session = session(&fx, false);
        assert!(session.connect().await.success);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_changed_key_trust_always_persists() {
        let fx = fixture(true);
        let store = fx.services.endpoints.clone().unwrap();
        let mut record = EndpointRecord::new("example.com", 22, "ops");
        record.key_hash = "00".repeat(32);
        store.insert(&record).unwrap();

        // Remember does not override a stored mismatch
        let session = session(&fx, true);
        assert!(!session.connect().await.success);
        assert_eq!(session.state(), SessionState::HostKeyPending);

        let outcome = session.resolve_host_key(HostKeyResolution::TrustAlways).await;
        assert!(outcome.success, "{}", outcome.message);
        let saved = store
            .find_by_name_and_icon("ops @ example.com", Some(RemoteOs::Linux.icon()))
            .unwrap()
            .unwrap();
        assert_eq!(saved.key_hash, fx.connector.host_key_hash());

        let again = Arc::new(ConnectionSession::new(
            saved,
            AuthMethod::password("pw"),
            false,
            fx.services.clone(),
        ));
        assert!(again.connect().await.success);
    }

    #[tokio::test]
    async fn test_reject_leaves_disconnected() {
        let fx = fixture(false);
        let session = session(&fx, false);
        session.connect().await;

        let outcome = session.resolve_host_key(HostKeyResolution::Reject).await;
        assert!(outcome.success);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.remote_files().borrow().is_empty());

        // Nothing left to resolve
        let outcome = session.resolve_host_key(HostKeyResolution::TrustOnce).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_connect_errors_are_aggregated_and_deduplicated() {
        let fx = fixture(false);
        let session = session(&fx, true);

        fx.connector.fail_shell(Some("denied"));
        fx.connector.fail_fs(Some("denied"));
        let outcome = session.connect().await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Authentication failed: denied");
        assert_eq!(session.state(), SessionState::Failed);

        fx.connector.fail_fs(Some("timeout"));
        let outcome = session.connect().await;
        assert_eq!(
            outcome.message,
            "Authentication failed: denied\n\rAuthentication failed: timeout"
        );
        assert_eq!(session.last_error().as_deref(), Some(outcome.message.as_str()));

        // One side failing is still a failure
        fx.connector.fail_shell(None);
        let outcome = session.connect().await;
        assert_eq!(outcome.message, "Authentication failed: timeout");
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.shell_titles().is_empty());
    }

    #[tokio::test]
    async fn test_denied_remote_listing_keeps_previous_view() {
        let fx = fixture_with(linux_shell(), |fs| fs.deny("/secret"), false);
        std::fs::create_dir(fx.server.join("pub")).unwrap();
        std::fs::write(fx.server.join("pub/readme"), b"r").unwrap();
        std::fs::create_dir(fx.server.join("secret")).unwrap();
        let session = session(&fx, true);
        session.connect().await;
        let mut events = session.subscribe();

        session.navigate_remote("/pub").await.unwrap();
        let before = names(&session.remote_files());

        let err = session.navigate_remote("/secret").await.unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(session.remote_path(), "/pub");
        assert_eq!(names(&session.remote_files()), before);
        assert!(drain(&mut events).contains(&SessionEvent::PermissionDenied {
            path: "/secret".to_string()
        }));
    }

    #[tokio::test]
    async fn test_listing_watch_fires_only_on_change() {
        let fx = fixture(false);
        std::fs::write(fx.server.join("a.txt"), b"a").unwrap();
        let session = session(&fx, true);
        session.connect().await;

        let mut rx = session.remote_files();
        rx.borrow_and_update();
        session.refresh_files().await;
        assert!(!rx.has_changed().unwrap());

        std::fs::write(fx.server.join("b.txt"), b"b").unwrap();
        session.refresh_files().await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(names(&rx), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_tick_honours_file_refresh_flag() {
        let fx = fixture(false);
        let session = session(&fx, true);
        session.connect().await;
        let top = process_command(RemoteOs::Linux).unwrap();
        let top_runs = || fx.connector.shell.executed().iter().filter(|c| *c == top).count();
        assert_eq!(top_runs(), 1);

        {
            let mut options = fx.services.options.write();
            options.disable_automatic_refresh = false;
            options.disable_automatic_file_refresh = true;
        }
        std::fs::write(fx.server.join("new.txt"), b"n").unwrap();
        session.tick().await;
        assert_eq!(top_runs(), 2);
        assert!(!names(&session.remote_files()).contains(&"new.txt".to_string()));

        fx.services.options.write().disable_automatic_file_refresh = false;
        session.tick().await;
        assert!(names(&session.remote_files()).contains(&"new.txt".to_string()));

        fx.services.options.write().disable_automatic_refresh = true;
        session.tick().await;
        assert_eq!(top_runs(), 3);
    }

    #[tokio::test]
    async fn test_tick_notices_dead_transport() {
        let fx = fixture(false);
        let session = session(&fx, true);
        assert!(session.connect().await.success);
        let mut events = session.subscribe();

        // Nothing is polling; the transport just goes away
        fx.connector.drop_transport();
        assert_eq!(session.state(), SessionState::Connected);

        session.tick().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.shell_titles().is_empty());
        assert!(drain(&mut events).contains(&SessionEvent::StateChanged(SessionState::Disconnected)));
    }

    #[tokio::test]
    async fn test_selection_fields_are_independent() {
        let fx = fixture(false);
        std::fs::write(fx.local.join("l.txt"), b"l").unwrap();
        let session = session(&fx, true);
        session.connect().await;

        let local = session
            .local_files()
            .borrow()
            .iter()
            .find(|e| e.name() == "l.txt")
            .cloned()
            .unwrap();
        session.select_local(Some(local.clone()));
        assert_eq!(session.selected_local(), Some(local));
        assert_eq!(session.selected_remote(), None);
    }

    #[tokio::test]
    async fn test_upload_selected_into_remote_directory() {
        let fx = fixture(false);
        std::fs::write(fx.local.join("report.pdf"), b"%PDF-1.4").unwrap();
        let session = session(&fx, true);
        session.connect().await;

        let entry = session
            .local_files()
            .borrow()
            .iter()
            .find(|e| e.name() == "report.pdf")
            .cloned();
        session.select_local(entry);
        let outcome = session.upload_selected().await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(std::fs::read(fx.server.join("report.pdf")).unwrap(), b"%PDF-1.4");
        assert!(names(&session.remote_files()).contains(&"report.pdf".to_string()));

        let records = fx.services.ledger.list_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TransferStatus::Success);
        assert_eq!(records[0].remote_ip, "example.com");
    }

    #[tokio::test]
    async fn test_run_script_uploads_and_runs_in_exec_shell() {
        let shell = linux_shell()
            .respond("mktemp", "/tmp/tmp.Ab12\n")
            .respond("rm '/tmp/tmp.Ab12'", "")
            .respond("touch '/tmp/tmp.Ab12.py'", "")
            .respond("chmod +x '/tmp/tmp.Ab12.py'", "");
        let fx = fixture_with(shell, |fs| fs, false);
        std::fs::create_dir(fx.server.join("tmp")).unwrap();
        let script = fx.local.join("deploy.py");
        std::fs::write(&script, b"print('hi')").unwrap();
        let session = session(&fx, true);
        session.connect().await;

        let outcome = session.run_script(&script).await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(std::fs::read(fx.server.join("tmp/tmp.Ab12.py")).unwrap(), b"print('hi')");
        assert!(session.shell_titles().contains(&"deploy.py-exec".to_string()));
        assert!(
            fx.connector
                .shell
                .wait_for_pty_input("cd '/tmp'\npython3 'tmp.Ab12.py'\n")
                .await
        );
    }

    #[tokio::test]
    async fn test_run_script_refused_on_windows() {
        let shell = ScriptedShell::new()
            .respond_err("uname", "'uname' is not recognized as an internal or external command")
            .respond("ver", "Microsoft Windows [Version 10.0.19045]\r\n");
        let fx = fixture_with(shell, |fs| fs, false);
        let script = fx.local.join("job.sh");
        std::fs::write(&script, b"echo hi").unwrap();
        let session = session(&fx, true);
        session.connect().await;
        assert_eq!(session.remote_os(), Some(RemoteOs::Windows));

        let outcome = session.run_script(&script).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Windows"));
    }

    #[tokio::test]
    async fn test_shells_reuse_titles_and_close_on_disconnect() {
        let fx = fixture(false);
        let session = session(&fx, true);
        session.connect().await;

        let first = session.open_shell(FIRST_SHELL_TITLE).await.unwrap();
        assert_eq!(fx.connector.shell.ptys_opened(), 1);
        let second = session.open_shell("Shell 2").await.unwrap();
        assert_eq!(session.shell_titles(), vec!["Shell 1", "Shell 2"]);

        assert!(session.close_shell("Shell 2"));
        assert!(second.cancel.is_cancelled());
        assert!(!session.close_shell("Shell 2"));

        session.disconnect().await;
        assert!(first.cancel.is_cancelled());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.shell_titles().is_empty());
        assert!(matches!(
            session.navigate_remote("/").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn test_aggregate_errors() {
        let errors = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(aggregate_errors(errors), "a\n\rb");
        assert_eq!(aggregate_errors(Vec::new()), "");
    }
}
