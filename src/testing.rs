//! Test doubles for the remote capabilities

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::sftp::{RemoteDirEntry, RemoteFs, RemoteMetadata, RemoteReader, RemoteWriter, SftpError};
use crate::ssh::{
    host_key_hash, CommandOutput, Connector, HostKeyVerifier, PtyRequest, RemoteShell,
    ShellChannel, ShellInput, SshConfig, SshError,
};

/// [`RemoteFs`] whose "/" is a local directory
pub(crate) struct DirBackedRemoteFs {
    root: PathBuf,
    dot_entries: bool,
    denied: Vec<String>,
    home: String,
    connected: AtomicBool,
}

impl DirBackedRemoteFs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            dot_entries: false,
            denied: Vec::new(),
            home: "/".to_string(),
            connected: AtomicBool::new(true),
        }
    }

    /// Listings include "." and ".." like most servers send them
    pub fn with_dot_entries(mut self) -> Self {
        self.dot_entries = true;
        self
    }

    /// Listing `path` fails with permission denied
    pub fn deny(mut self, path: &str) -> Self {
        self.denied.push(path.trim_end_matches('/').to_string());
        self
    }

    /// Login directory returned for `canonicalize(".")`
    pub fn with_home(mut self, home: &str) -> Self {
        self.home = home.to_string();
        self
    }

    fn local(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

fn map_io(err: std::io::Error, path: &str) -> SftpError {
    match err.kind() {
        std::io::ErrorKind::NotFound => SftpError::FileNotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
        _ => SftpError::IoError(err),
    }
}

fn unix_secs(time: std::io::Result<std::time::SystemTime>) -> Option<i64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

fn to_metadata(metadata: &std::fs::Metadata) -> RemoteMetadata {
    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        Some(metadata.permissions().mode())
    };
    #[cfg(not(unix))]
    let permissions = None;

    RemoteMetadata {
        is_dir: metadata.is_dir(),
        size: Some(metadata.len()),
        modified: unix_secs(metadata.modified()),
        accessed: unix_secs(metadata.accessed()),
        permissions,
    }
}

#[async_trait]
impl RemoteFs for DirBackedRemoteFs {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError> {
        let normalized = path.trim_end_matches('/');
        if self.denied.iter().any(|d| d == normalized) {
            return Err(SftpError::PermissionDenied(path.to_string()));
        }

        let dir = self.local(path);
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(|e| map_io(e, path))?;
        let mut entries = Vec::new();

        if self.dot_entries {
            let own = tokio::fs::metadata(&dir).await.map_err(|e| map_io(e, path))?;
            for name in [".", ".."] {
                entries.push(RemoteDirEntry {
                    name: name.to_string(),
                    metadata: to_metadata(&own),
                });
            }
        }

        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = tokio::fs::metadata(entry.path()).await?;
            entries.push(RemoteDirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                metadata: to_metadata(&metadata),
            });
        }
        Ok(entries)
    }

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SftpError> {
        let metadata = tokio::fs::metadata(self.local(path))
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(to_metadata(&metadata))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        tokio::fs::create_dir(self.local(path))
            .await
            .map_err(|e| map_io(e, path))
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let file = tokio::fs::File::open(self.local(path))
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let file = tokio::fs::File::create(self.local(path))
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        if path == "." {
            Ok(self.home.clone())
        } else {
            Ok(path.to_string())
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// [`RemoteShell`] answering from a table of canned outputs.
///
/// Unknown commands fail the way `sh` does.
pub(crate) struct ScriptedShell {
    responses: Mutex<HashMap<String, CommandOutput>>,
    executed: Mutex<Vec<String>>,
    pty_input: Arc<Mutex<Vec<u8>>>,
    ptys: AtomicUsize,
    connected: AtomicBool,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            pty_input: Arc::new(Mutex::new(Vec::new())),
            ptys: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
        }
    }

    pub fn respond(self, command: &str, stdout: &str) -> Self {
        self.responses.lock().insert(
            command.to_string(),
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_status: Some(0),
            },
        );
        self
    }

    pub fn respond_err(self, command: &str, stderr: &str) -> Self {
        self.responses.lock().insert(
            command.to_string(),
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_status: Some(1),
            },
        );
        self
    }

    /// Commands run through `exec`, in order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Number of interactive shells opened
    pub fn ptys_opened(&self) -> usize {
        self.ptys.load(Ordering::SeqCst)
    }

    /// Everything written to any interactive shell so far
    pub fn pty_input(&self) -> String {
        String::from_utf8_lossy(&self.pty_input.lock()).into_owned()
    }

    /// Poll until the interactive input contains `needle`
    pub async fn wait_for_pty_input(&self, needle: &str) -> bool {
        for _ in 0..200 {
            if self.pty_input().contains(needle) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }
        self.executed.lock().push(command.to_string());
        let canned = self.responses.lock().get(command).cloned();
        Ok(canned.unwrap_or_else(|| CommandOutput {
            stdout: String::new(),
            stderr: format!("sh: {}: command not found", command),
            exit_status: Some(127),
        }))
    }

    async fn open_pty(&self, _pty: PtyRequest) -> Result<ShellChannel, SshError> {
        self.ptys.fetch_add(1, Ordering::SeqCst);
        let (input_tx, mut input_rx) = mpsc::channel::<ShellInput>(64);
        let (output_tx, _) = broadcast::channel::<Vec<u8>>(64);
        let cancel = CancellationToken::new();

        let sink = self.pty_input.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    input = input_rx.recv() => match input {
                        Some(ShellInput::Data(data)) => sink.lock().extend_from_slice(&data),
                        Some(ShellInput::Resize(..)) => {}
                        Some(ShellInput::Close) | None => break,
                    },
                }
            }
        });

        Ok(ShellChannel {
            input: input_tx,
            output: output_tx,
            cancel,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// [`Connector`] handing out shared fakes after a host key check
pub(crate) struct FakeConnector {
    pub shell: Arc<ScriptedShell>,
    pub fs: Arc<DirBackedRemoteFs>,
    host_key: Mutex<Vec<u8>>,
    shell_error: Mutex<Option<String>>,
    fs_error: Mutex<Option<String>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(shell: ScriptedShell, fs: DirBackedRemoteFs) -> Self {
        Self {
            shell: Arc::new(shell),
            fs: Arc::new(fs),
            host_key: Mutex::new(b"fake-host-key".to_vec()),
            shell_error: Mutex::new(None),
            fs_error: Mutex::new(None),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn host_key_hash(&self) -> String {
        host_key_hash(&self.host_key.lock())
    }

    pub fn set_host_key(&self, key: &[u8]) {
        *self.host_key.lock() = key.to_vec();
    }

    pub fn fail_shell(&self, message: Option<&str>) {
        *self.shell_error.lock() = message.map(str::to_string);
    }

    pub fn fail_fs(&self, message: Option<&str>) {
        *self.fs_error.lock() = message.map(str::to_string);
    }

    /// Kill the transport under both channels without a client disconnect
    pub fn drop_transport(&self) {
        self.shell.connected.store(false, Ordering::SeqCst);
        self.fs.connected.store(false, Ordering::SeqCst);
    }

    /// Channel connections attempted so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn handshake(&self, verifier: &HostKeyVerifier, error: &Mutex<Option<String>>) -> Result<(), SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let key = self.host_key.lock().clone();
        if !verifier.verify(&key) {
            return Err(SshError::HostKeyPending {
                hash: host_key_hash(&key),
            });
        }
        match error.lock().clone() {
            Some(message) => Err(SshError::AuthenticationFailed(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect_shell(
        &self,
        _config: &SshConfig,
        verifier: Arc<HostKeyVerifier>,
    ) -> Result<Arc<dyn RemoteShell>, SshError> {
        self.handshake(&verifier, &self.shell_error)?;
        self.shell.connected.store(true, Ordering::SeqCst);
        Ok(self.shell.clone())
    }

    async fn connect_fs(
        &self,
        _config: &SshConfig,
        verifier: Arc<HostKeyVerifier>,
    ) -> Result<Arc<dyn RemoteFs>, SshError> {
        self.handshake(&verifier, &self.fs_error)?;
        self.fs.connected.store(true, Ordering::SeqCst);
        Ok(self.fs.clone())
    }
}
