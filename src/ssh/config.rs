//! SSH Configuration

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// SSH connection configuration, built from an endpoint plus its transient credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Authentication methods supported
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication from a key file
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH key authentication from in-memory OpenSSH/PEM material
    KeyData {
        pem: String,
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        AuthMethod::Password {
            password: password.into(),
        }
    }

    pub fn is_key(&self) -> bool {
        !matches!(self, AuthMethod::Password { .. })
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password(***)"),
            AuthMethod::Key { key_path, .. } => write!(f, "Key({})", key_path),
            AuthMethod::KeyData { .. } => f.write_str("KeyData(***)"),
        }
    }
}

// Credentials never outlive the connection attempt in memory.
impl Drop for AuthMethod {
    fn drop(&mut self) {
        match self {
            AuthMethod::Password { password } => password.zeroize(),
            AuthMethod::Key { passphrase, .. } => passphrase.zeroize(),
            AuthMethod::KeyData { pem, passphrase } => {
                pem.zeroize();
                passphrase.zeroize();
            }
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            auth: AuthMethod::password(String::new()),
            timeout_secs: default_timeout(),
        }
    }
}
