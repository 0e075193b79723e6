//! File-transfer channel
//!
//! [`RemoteFs`] is the SFTP surface the indexer and transfer engine work
//! against; [`RusshSftp`] implements it over a russh-sftp subsystem channel.

use async_trait::async_trait;
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::error::SftpError;
use crate::ssh::HandleController;

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Attributes of a remote file as reported by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub is_dir: bool,
    pub size: Option<u64>,
    /// Unix seconds
    pub modified: Option<i64>,
    /// Unix seconds
    pub accessed: Option<i64>,
    /// Mode bits
    pub permissions: Option<u32>,
}

/// One directory listing row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub name: String,
    pub metadata: RemoteMetadata,
}

#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Raw listing, including "." and ".." if the server sends them
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError>;

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SftpError>;

    async fn exists(&self, path: &str) -> Result<bool, SftpError> {
        match self.metadata(path).await {
            Ok(_) => Ok(true),
            Err(SftpError::FileNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError>;

    /// Create or truncate `path` for writing
    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError>;

    /// Absolute form of `path`; `"."` gives the login directory
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}

/// [`RemoteFs`] over russh-sftp
pub struct RusshSftp {
    sftp: RusshSftpSession,
    controller: HandleController,
}

impl RusshSftp {
    /// Open the SFTP subsystem on a fresh channel of `controller`
    pub async fn open(controller: HandleController) -> Result<Self, SftpError> {
        let channel = controller
            .open_session_channel()
            .await
            .map_err(|e| SftpError::ChannelError(e.to_string()))?;

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotAvailable(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;

        info!("SFTP subsystem opened");

        Ok(Self { sftp, controller })
    }
}

fn convert_metadata(attrs: &russh_sftp::protocol::FileAttributes) -> RemoteMetadata {
    RemoteMetadata {
        is_dir: attrs.is_dir(),
        size: attrs.size,
        modified: attrs.mtime.map(i64::from),
        accessed: attrs.atime.map(i64::from),
        permissions: attrs.permissions,
    }
}

#[async_trait]
impl RemoteFs for RusshSftp {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError> {
        debug!("Listing remote directory: {}", path);
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SftpError::from_protocol(e, path))?;

        Ok(read_dir
            .map(|entry| RemoteDirEntry {
                name: entry.file_name(),
                metadata: convert_metadata(&entry.metadata()),
            })
            .collect())
    }

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SftpError> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| SftpError::from_protocol(e, path))?;
        Ok(convert_metadata(&attrs))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        info!("Creating remote directory: {}", path);
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| SftpError::from_protocol(e, path))
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| SftpError::from_protocol(e, path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let file = self
            .sftp
            .create(path)
            .await
            .map_err(|e| SftpError::from_protocol(e, path))?;
        Ok(Box::new(file))
    }

    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        self.sftp
            .canonicalize(path)
            .await
            .map_err(|e| SftpError::from_protocol(e, path))
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    async fn disconnect(&self) {
        let _ = self.sftp.close().await;
        self.controller.disconnect().await;
    }
}
