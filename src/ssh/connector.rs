//! Channel connector
//!
//! A session opens its command channel and its file-transfer channel as two
//! independent SSH transports that share one host key verifier.

use std::sync::Arc;

use async_trait::async_trait;

use super::client::SshClient;
use super::config::SshConfig;
use super::error::SshError;
use super::host_key::HostKeyVerifier;
use super::shell::{RemoteShell, RusshShell};
use crate::sftp::{RemoteFs, RusshSftp};

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_shell(
        &self,
        config: &SshConfig,
        verifier: Arc<HostKeyVerifier>,
    ) -> Result<Arc<dyn RemoteShell>, SshError>;

    async fn connect_fs(
        &self,
        config: &SshConfig,
        verifier: Arc<HostKeyVerifier>,
    ) -> Result<Arc<dyn RemoteFs>, SshError>;
}

/// Connects over the network with russh
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

#[async_trait]
impl Connector for RusshConnector {
    async fn connect_shell(
        &self,
        config: &SshConfig,
        verifier: Arc<HostKeyVerifier>,
    ) -> Result<Arc<dyn RemoteShell>, SshError> {
        let controller = SshClient::new(config.clone(), verifier).connect("command").await?;
        Ok(Arc::new(RusshShell::new(controller)))
    }

    async fn connect_fs(
        &self,
        config: &SshConfig,
        verifier: Arc<HostKeyVerifier>,
    ) -> Result<Arc<dyn RemoteFs>, SshError> {
        let controller = SshClient::new(config.clone(), verifier).connect("sftp").await?;
        let sftp = RusshSftp::open(controller)
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        Ok(Arc::new(sftp))
    }
}
