//! Configuration Management Module
//!
//! User options on disk, the saved endpoint table, and secure credential
//! storage via the system keychain.

pub mod endpoints;
pub mod keychain;
pub mod storage;
pub mod types;

pub use endpoints::{EndpointRecord, EndpointStore, EndpointStoreError};
pub use keychain::{
    CredentialError, CredentialKey, CredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, PACKAGE_NAME,
};
pub use storage::{data_dir, options_file, ConfigStorage, StorageError};
pub use types::{AppOptions, Scope, OPTIONS_VERSION};
