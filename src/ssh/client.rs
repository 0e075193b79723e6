//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use tracing::{debug, info};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::host_key::HostKeyVerifier;

/// Connects and authenticates one SSH transport
pub struct SshClient {
    config: SshConfig,
    verifier: Arc<HostKeyVerifier>,
}

impl SshClient {
    pub fn new(config: SshConfig, verifier: Arc<HostKeyVerifier>) -> Self {
        Self { config, verifier }
    }

    /// Connect, authenticate and hand the handle to its owner task.
    ///
    /// A host key that needs a decision surfaces as [`SshError::HostKeyPending`].
    pub async fn connect(self, label: &str) -> Result<HandleController, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("Connecting {} to {}", label, addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler {
            verifier: self.verifier.clone(),
        };

        let connected = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?;

        let mut handle = match connected {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(hash) = self.verifier.take_pending() {
                    return Err(SshError::HostKeyPending { hash });
                }
                return Err(SshError::ConnectionFailed(e.to_string()));
            }
        };

        debug!("SSH handshake completed for {}", label);

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
            AuthMethod::KeyData { pem, passphrase } => {
                let key = russh::keys::decode_secret_key(pem, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", label);

        Ok(spawn_handle_owner_task(handle, label.to_string()))
    }
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    verifier: Arc<HostKeyVerifier>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.verifier.verify(&server_public_key.public_key_bytes()))
    }
}
