//! Transfer engine
//!
//! Copies one entry (file or directory tree) between the local disk and the
//! server. Each file gets its own ledger row: a Running row before the first
//! byte, gated progress ticks while streaming, and a Success row once the
//! stream is flushed. A failed stream leaves its row as last reported; the
//! registry's stale sweep turns it into Faulted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ids::next_transfer_id;
use super::ledger::{LedgerError, TransferLedger};
use super::record::{progress_percent, TransferDirection, TransferRecord, TransferStatus};
use crate::index::FileSystemEntry;
use crate::sftp::path_utils::{join_local_path, join_remote_path};
use crate::sftp::{RemoteFs, SftpError};
use crate::OperationOutcome;

pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("No file transfer connection is available")]
    MissingClient,

    #[error("No source entry was given")]
    MissingSource,

    #[error("Source path is empty")]
    EmptySourcePath,

    #[error("Destination path is empty")]
    EmptyDestinationPath,

    #[error("Source path {path} does not contain {name}")]
    SourcePathMismatch { path: String, name: String },

    #[error("File / Folder could not be found on local machine: {0}")]
    LocalSourceMissing(String),

    #[error("The file that was trying to be downloaded did not exist on the destination file system: {0}")]
    RemoteSourceMissing(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] SftpError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Identity of one file copy; builds its ledger rows
struct FileJob {
    id: u64,
    file_name: String,
    source: String,
    destination: String,
    remote_ip: String,
    total: u64,
    started_at: DateTime<Utc>,
}

impl FileJob {
    fn record(&self, done: u64) -> TransferRecord {
        TransferRecord {
            id: self.id,
            file_name: self.file_name.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            remote_ip: self.remote_ip.clone(),
            file_size: done,
            progress: progress_percent(done, self.total),
            status: TransferStatus::Running,
            started_at: self.started_at,
            ended_at: None,
            last_update: Utc::now(),
        }
    }
}

pub struct TransferEngine {
    ledger: Arc<TransferLedger>,
    remote_ip: String,
    parallelism: usize,
}

impl TransferEngine {
    pub fn new(ledger: Arc<TransferLedger>) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            ledger,
            remote_ip: String::new(),
            parallelism,
        }
    }

    /// Address recorded on every ledger row
    pub fn with_remote_ip(mut self, remote_ip: impl Into<String>) -> Self {
        self.remote_ip = remote_ip.into();
        self
    }

    pub fn ledger(&self) -> &Arc<TransferLedger> {
        &self.ledger
    }

    /// Copy `source` into the directory `destination`.
    pub async fn transfer(
        &self,
        source: Option<&FileSystemEntry>,
        destination: &str,
        direction: TransferDirection,
        cancel: &CancellationToken,
        client: Option<&dyn RemoteFs>,
    ) -> OperationOutcome {
        match self.try_transfer(source, destination, direction, cancel, client).await {
            Ok(files) => {
                info!("[Transfer] {:?} finished, {} file(s)", direction, files);
                OperationOutcome::ok(format!("Transferred {} file(s)", files))
            }
            Err(e) => {
                warn!("[Transfer] {:?} failed: {}", direction, e);
                OperationOutcome::failed(e.to_string())
            }
        }
    }

    /// [`transfer`](Self::transfer) with the typed error. Returns the number of files copied.
    pub async fn try_transfer(
        &self,
        source: Option<&FileSystemEntry>,
        destination: &str,
        direction: TransferDirection,
        cancel: &CancellationToken,
        client: Option<&dyn RemoteFs>,
    ) -> Result<usize, TransferError> {
        let client = client.ok_or(TransferError::MissingClient)?;
        let source = source.ok_or(TransferError::MissingSource)?;
        let info = source.info();

        if info.path.trim().is_empty() {
            return Err(TransferError::EmptySourcePath);
        }
        if destination.trim().is_empty() {
            return Err(TransferError::EmptyDestinationPath);
        }
        if info.name.is_empty() || source.is_parent_link() || !info.path.contains(&info.name) {
            return Err(TransferError::SourcePathMismatch {
                path: info.path.clone(),
                name: info.name.clone(),
            });
        }
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        match direction {
            TransferDirection::HostToRemote => {
                let local = PathBuf::from(&info.path);
                let metadata = tokio::fs::metadata(&local)
                    .await
                    .map_err(|_| TransferError::LocalSourceMissing(info.path.clone()))?;
                let target = join_remote_path(destination, &info.name);

                if metadata.is_dir() {
                    self.upload_directory(client, local, target, cancel).await
                } else {
                    self.upload_file(client, &local, &target, cancel).await.map(|_| 1)
                }
            }
            TransferDirection::RemoteToHost => {
                if !client.exists(&info.path).await? {
                    return Err(TransferError::RemoteSourceMissing(info.path.clone()));
                }
                let metadata = client.metadata(&info.path).await?;
                let target = PathBuf::from(join_local_path(destination, &info.name));

                if metadata.is_dir {
                    self.download_directory(client, info.path.clone(), target, cancel)
                        .await
                } else {
                    self.download_file(client, &info.path, &target, cancel)
                        .await
                        .map(|_| 1)
                }
            }
        }
    }

    /// Children go one at a time: a directory must exist before its contents.
    fn upload_directory<'a>(
        &'a self,
        client: &'a dyn RemoteFs,
        local_dir: PathBuf,
        remote_dir: String,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<usize, TransferError>> {
        async move {
            if !client.exists(&remote_dir).await? {
                client.create_dir(&remote_dir).await?;
            }

            let mut read_dir = tokio::fs::read_dir(&local_dir).await?;
            let mut children = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                children.push(entry.path());
            }
            children.sort();

            let mut files = 0;
            for child in children {
                if cancel.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }
                let Some(name) = child.file_name().map(|n| n.to_string_lossy().to_string()) else {
                    continue;
                };
                let remote = join_remote_path(&remote_dir, &name);

                if tokio::fs::metadata(&child).await?.is_dir() {
                    files += self.upload_directory(client, child, remote, cancel).await?;
                } else {
                    self.upload_file(client, &child, &remote, cancel).await?;
                    files += 1;
                }
            }
            Ok(files)
        }
        .boxed()
    }

    /// Children fan out up to the available parallelism.
    fn download_directory<'a>(
        &'a self,
        client: &'a dyn RemoteFs,
        remote_dir: String,
        local_dir: PathBuf,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<usize, TransferError>> {
        async move {
            tokio::fs::create_dir_all(&local_dir).await?;

            let children: Vec<_> = client
                .list_dir(&remote_dir)
                .await?
                .into_iter()
                .filter(|entry| entry.name != "." && entry.name != "..")
                .collect();

            let results: Vec<Result<usize, TransferError>> = stream::iter(children)
                .map(|child| {
                    let remote = join_remote_path(&remote_dir, &child.name);
                    let local = local_dir.join(&child.name);
                    async move {
                        if child.metadata.is_dir {
                            self.download_directory(client, remote, local, cancel).await
                        } else {
                            self.download_file(client, &remote, &local, cancel)
                                .await
                                .map(|_| 1)
                        }
                    }
                })
                .buffer_unordered(self.parallelism)
                .collect()
                .await;

            results.into_iter().sum()
        }
        .boxed()
    }

    async fn upload_file(
        &self,
        client: &dyn RemoteFs,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut reader = tokio::fs::File::open(local).await?;
        let total = reader.metadata().await?.len();
        let job = self.job(local.to_string_lossy().to_string(), remote.to_string(), total);
        self.ledger.upsert(&job.record(0)).await?;

        let mut writer = client.create(remote).await?;
        self.stream(&job, &mut reader, &mut writer).await?;
        Ok(total)
    }

    async fn download_file(
        &self,
        client: &dyn RemoteFs,
        remote: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let total = client.metadata(remote).await?.size.unwrap_or(0);
        let job = self.job(remote.to_string(), local.to_string_lossy().to_string(), total);
        self.ledger.upsert(&job.record(0)).await?;

        let mut reader = client.open_read(remote).await?;
        let mut writer = tokio::fs::File::create(local).await?;
        self.stream(&job, &mut reader, &mut writer).await?;
        Ok(total)
    }

    fn job(&self, source: String, destination: String, total: u64) -> FileJob {
        let file_name = Path::new(&source)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| source.clone());
        FileJob {
            id: next_transfer_id(),
            file_name,
            source,
            destination,
            remote_ip: self.remote_ip.clone(),
            total,
            started_at: Utc::now(),
        }
    }

    async fn stream<R, W>(&self, job: &FileJob, reader: &mut R, writer: &mut W) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        debug!("[Transfer] {} -> {} ({} bytes)", job.source, job.destination, job.total);

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut done: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            done += n as u64;
            if !self.ledger.report_progress(job.record(done)) {
                debug!("[Transfer] {} busy, progress tick dropped", job.id);
            }
        }
        writer.flush().await?;
        writer.shutdown().await?;

        let mut finished = job.record(done);
        finished.file_size = done.max(job.total);
        self.ledger.complete(finished).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FilesystemIndexer;
    use crate::testing::DirBackedRemoteFs;
    use crate::transfer::ledger::RedbLedgerStore;
    use tempfile::tempdir;

    fn engine(dir: &Path) -> TransferEngine {
        let store = RedbLedgerStore::open(&dir.join("transfers.redb")).unwrap();
        TransferEngine::new(Arc::new(TransferLedger::new(Arc::new(store))))
    }

    async fn local_entry(path: &Path) -> FileSystemEntry {
        let parent = path.parent().unwrap().to_str().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        FilesystemIndexer::default()
            .list_local(parent)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.name() == name)
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let work = tempdir().unwrap();
        let server = tempdir().unwrap();
        std::fs::create_dir(server.path().join("upload")).unwrap();
        let fs = DirBackedRemoteFs::new(server.path());
        let engine = engine(work.path());
        let cancel = CancellationToken::new();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let source = work.path().join("data.bin");
        std::fs::write(&source, &payload).unwrap();

        let entry = local_entry(&source).await;
        let outcome = engine
            .transfer(Some(&entry), "/upload", TransferDirection::HostToRemote, &cancel, Some(&fs))
            .await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(std::fs::read(server.path().join("upload/data.bin")).unwrap(), payload);

        let back = work.path().join("back");
        std::fs::create_dir(&back).unwrap();
        let remote_entry = FilesystemIndexer::default()
            .list_remote(&fs, "/upload")
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.name() == "data.bin")
            .unwrap();
        let outcome = engine
            .transfer(
                Some(&remote_entry),
                back.to_str().unwrap(),
                TransferDirection::RemoteToHost,
                &cancel,
                Some(&fs),
            )
            .await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(std::fs::read(back.join("data.bin")).unwrap(), payload);

        let records = engine.ledger().list_all().await.unwrap();
        assert_eq!(records.len(), 2);
        for record in records {
            assert_eq!(record.status, TransferStatus::Success);
            assert_eq!(record.file_size, payload.len() as u64);
            assert_eq!(record.progress, 100.0);
            assert!(record.ended_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_directory_upload_creates_remote_tree() {
        let work = tempdir().unwrap();
        let server = tempdir().unwrap();
        let project = work.path().join("project");
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(project.join("README"), b"hi").unwrap();
        std::fs::write(project.join("src/main.py"), b"print(1)").unwrap();
        let fs = DirBackedRemoteFs::new(server.path());
        let engine = engine(work.path());

        let entry = local_entry(&project).await;
        let files = engine
            .try_transfer(
                Some(&entry),
                "/",
                TransferDirection::HostToRemote,
                &CancellationToken::new(),
                Some(&fs),
            )
            .await
            .unwrap();

        assert_eq!(files, 2);
        assert_eq!(std::fs::read(server.path().join("project/src/main.py")).unwrap(), b"print(1)");
        assert_eq!(engine.ledger().list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_directory_download_fans_out() {
        let work = tempdir().unwrap();
        let server = tempdir().unwrap();
        std::fs::create_dir_all(server.path().join("logs/old")).unwrap();
        for i in 0..6 {
            std::fs::write(server.path().join(format!("logs/{}.log", i)), vec![i as u8; 100]).unwrap();
        }
        std::fs::write(server.path().join("logs/old/archive.log"), b"x").unwrap();
        let fs = DirBackedRemoteFs::new(server.path()).with_dot_entries();
        let engine = engine(work.path());

        let entry = FilesystemIndexer::default()
            .list_remote(&fs, "/")
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.name() == "logs")
            .unwrap();
        let files = engine
            .try_transfer(
                Some(&entry),
                work.path().to_str().unwrap(),
                TransferDirection::RemoteToHost,
                &CancellationToken::new(),
                Some(&fs),
            )
            .await
            .unwrap();

        assert_eq!(files, 7);
        assert_eq!(std::fs::read(work.path().join("logs/old/archive.log")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_empty_file_completes_at_100() {
        let work = tempdir().unwrap();
        let server = tempdir().unwrap();
        let source = work.path().join("empty.txt");
        std::fs::write(&source, b"").unwrap();
        let fs = DirBackedRemoteFs::new(server.path());
        let engine = engine(work.path());

        let entry = local_entry(&source).await;
        engine
            .try_transfer(Some(&entry), "/", TransferDirection::HostToRemote, &CancellationToken::new(), Some(&fs))
            .await
            .unwrap();

        let records = engine.ledger().list_all().await.unwrap();
        assert_eq!(records[0].progress, 100.0);
        assert_eq!(records[0].file_size, 0);
        assert_eq!(records[0].status, TransferStatus::Success);
    }

    #[tokio::test]
    async fn test_named_preconditions() {
        let work = tempdir().unwrap();
        let server = tempdir().unwrap();
        let fs = DirBackedRemoteFs::new(server.path());
        let engine = engine(work.path());
        let cancel = CancellationToken::new();
        let source = work.path().join("a.txt");
        std::fs::write(&source, b"a").unwrap();
        let entry = local_entry(&source).await;
        let up = TransferDirection::HostToRemote;

        let result = engine.try_transfer(Some(&entry), "/", up, &cancel, None).await;
        assert!(matches!(result, Err(TransferError::MissingClient)));

        let result = engine.try_transfer(None, "/", up, &cancel, Some(&fs)).await;
        assert!(matches!(result, Err(TransferError::MissingSource)));

        let result = engine.try_transfer(Some(&entry), "  ", up, &cancel, Some(&fs)).await;
        assert!(matches!(result, Err(TransferError::EmptyDestinationPath)));

        let FileSystemEntry::File(mut file) = entry.clone() else {
            panic!("expected a file");
        };
        file.info.name = "other.txt".to_string();
        let mismatched = FileSystemEntry::File(file.clone());
        let result = engine.try_transfer(Some(&mismatched), "/", up, &cancel, Some(&fs)).await;
        assert!(matches!(result, Err(TransferError::SourcePathMismatch { .. })));

        file.info.path = String::new();
        let empty = FileSystemEntry::File(file);
        let result = engine.try_transfer(Some(&empty), "/", up, &cancel, Some(&fs)).await;
        assert!(matches!(result, Err(TransferError::EmptySourcePath)));

        std::fs::remove_file(&source).unwrap();
        let outcome = engine.transfer(Some(&entry), "/", up, &cancel, Some(&fs)).await;
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("File / Folder could not be found on local machine"));

        // Nothing started, nothing recorded
        assert!(engine.ledger().list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_remote_source() {
        let work = tempdir().unwrap();
        let server = tempdir().unwrap();
        std::fs::write(server.path().join("gone.txt"), b"x").unwrap();
        let fs = DirBackedRemoteFs::new(server.path());
        let engine = engine(work.path());

        let entry = FilesystemIndexer::default()
            .list_remote(&fs, "/")
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.name() == "gone.txt")
            .unwrap();
        std::fs::remove_file(server.path().join("gone.txt")).unwrap();

        let result = engine
            .try_transfer(
                Some(&entry),
                work.path().to_str().unwrap(),
                TransferDirection::RemoteToHost,
                &CancellationToken::new(),
                Some(&fs),
            )
            .await;
        assert!(matches!(result, Err(TransferError::RemoteSourceMissing(p)) if p == "/gone.txt"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let work = tempdir().unwrap();
        let server = tempdir().unwrap();
        let source = work.path().join("a.txt");
        std::fs::write(&source, b"a").unwrap();
        let fs = DirBackedRemoteFs::new(server.path());
        let engine = engine(work.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let entry = local_entry(&source).await;
        let result = engine
            .try_transfer(Some(&entry), "/", TransferDirection::HostToRemote, &cancel, Some(&fs))
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!server.path().join("a.txt").exists());
    }
}
