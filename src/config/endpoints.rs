//! Persisted connection endpoints
//!
//! Endpoints are saved to a redb database (`~/.dawnftp/endpoints.redb`) as
//! MessagePack records keyed by an autoincrement id. Key-hash reconciliation
//! looks records up by the `(name, host_icon)` pair, not by id: a profile is
//! identified by how the user sees it in the connection list.

use std::path::{Path, PathBuf};

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::storage::data_dir;

const ENDPOINTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("endpoints");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("endpoint_meta");
const NEXT_ID_KEY: &str = "next_id";

#[derive(Error, Debug)]
pub enum EndpointStoreError {
    #[error("Cannot determine endpoint database location")]
    NoStorePath,

    #[error("Endpoint storage error: {0}")]
    Storage(String),
}

fn storage_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> EndpointStoreError {
    move |e| EndpointStoreError::Storage(format!("{}: {}", context, e))
}

/// A saved remote-host connection profile.
///
/// Credentials and key material are never part of this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Assigned by the store on insert; 0 until then
    #[serde(default)]
    pub id: u64,
    /// Display name shown on the tab
    pub name: String,
    pub host: String,
    pub username: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Icon of the detected host operating system
    #[serde(default)]
    pub host_icon: Option<String>,
    /// Uppercase hex SHA-256 of the trusted host key, empty when none is stored
    #[serde(default)]
    pub key_hash: String,
    #[serde(default)]
    pub use_key_auth: bool,
}

fn default_port() -> u16 {
    22
}

impl EndpointRecord {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        let host = host.into();
        let username = username.into();
        Self {
            id: 0,
            name: format!("{} @ {}", username, host),
            host,
            username,
            port,
            host_icon: None,
            key_hash: String::new(),
            use_key_auth: false,
        }
    }

    fn same_profile(&self, name: &str, host_icon: Option<&str>) -> bool {
        self.name == name && self.host_icon.as_deref() == host_icon
    }
}

/// redb-backed endpoint table
pub struct EndpointStore {
    db: redb::Database,
}

impl EndpointStore {
    /// Open (or create) the endpoint database at `path`.
    ///
    /// A database redb refuses to open is moved aside to `<path>.corrupt` and a
    /// fresh one is created in its place.
    pub fn open(path: &Path) -> Result<Self, EndpointStoreError> {
        info!("Opening endpoint store at {:?}", path);

        let db = match redb::Database::create(path) {
            Ok(db) => db,
            Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                return Err(EndpointStoreError::Storage(
                    "Endpoint database is already open".to_string(),
                ))
            }
            Err(e) => {
                let backup = path.with_extension("redb.corrupt");
                warn!(
                    "Endpoint database unreadable ({}), moving it to {:?}",
                    e, backup
                );
                std::fs::rename(path, &backup)
                    .map_err(storage_err("Failed to move corrupted database"))?;
                redb::Database::create(path)
                    .map_err(storage_err("Failed to recreate endpoint database"))?
            }
        };

        let write_txn = db
            .begin_write()
            .map_err(storage_err("Failed to begin write transaction"))?;
        {
            let _endpoints = write_txn
                .open_table(ENDPOINTS_TABLE)
                .map_err(storage_err("Failed to open endpoints table"))?;
            let _meta = write_txn
                .open_table(META_TABLE)
                .map_err(storage_err("Failed to open endpoint meta table"))?;
        }
        write_txn
            .commit()
            .map_err(storage_err("Failed to commit transaction"))?;

        Ok(Self { db })
    }

    /// Default database path (`~/.dawnftp/endpoints.redb`)
    pub fn default_path() -> Result<PathBuf, EndpointStoreError> {
        let dir = data_dir().map_err(|_| EndpointStoreError::NoStorePath)?;
        std::fs::create_dir_all(&dir).map_err(storage_err("Failed to create data directory"))?;
        Ok(dir.join("endpoints.redb"))
    }

    /// Insert a new record, assigning the next id. Returns the id.
    pub fn insert(&self, record: &EndpointRecord) -> Result<u64, EndpointStoreError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(storage_err("Failed to begin write transaction"))?;

        let id = {
            let mut meta = write_txn
                .open_table(META_TABLE)
                .map_err(storage_err("Failed to open endpoint meta table"))?;
            let id = meta
                .get(NEXT_ID_KEY)
                .map_err(storage_err("Failed to read id counter"))?
                .map(|v| v.value())
                .unwrap_or(1);
            meta.insert(NEXT_ID_KEY, id + 1)
                .map_err(storage_err("Failed to bump id counter"))?;
            id
        };

        let mut stored = record.clone();
        stored.id = id;
        self.put(&write_txn, &stored)?;

        write_txn
            .commit()
            .map_err(storage_err("Failed to commit transaction"))?;

        debug!("Saved endpoint {} as id {}", stored.name, id);
        Ok(id)
    }

    /// Insert `record` unless a profile with the same `(name, host_icon)` exists.
    /// Returns the id of the stored profile either way.
    pub fn remember(&self, record: &EndpointRecord) -> Result<u64, EndpointStoreError> {
        match self.find_by_name_and_icon(&record.name, record.host_icon.as_deref())? {
            Some(existing) => Ok(existing.id),
            None => self.insert(record),
        }
    }

    pub fn find_by_name_and_icon(
        &self,
        name: &str,
        host_icon: Option<&str>,
    ) -> Result<Option<EndpointRecord>, EndpointStoreError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|r| r.same_profile(name, host_icon)))
    }

    /// Store a new trusted key hash on the profile identified by `(name, host_icon)`.
    /// Returns false when no such profile exists.
    pub fn update_key_hash(
        &self,
        name: &str,
        host_icon: Option<&str>,
        key_hash: &str,
    ) -> Result<bool, EndpointStoreError> {
        let Some(mut record) = self.find_by_name_and_icon(name, host_icon)? else {
            return Ok(false);
        };
        record.key_hash = key_hash.to_string();

        let write_txn = self
            .db
            .begin_write()
            .map_err(storage_err("Failed to begin write transaction"))?;
        self.put(&write_txn, &record)?;
        write_txn
            .commit()
            .map_err(storage_err("Failed to commit transaction"))?;

        info!("Updated host key hash for endpoint {}", name);
        Ok(true)
    }

    /// Move the profile `(name, old_icon)` to `new_icon`, keeping its id and hash.
    /// Returns false when no such profile exists.
    pub fn update_host_icon(
        &self,
        name: &str,
        old_icon: Option<&str>,
        new_icon: Option<&str>,
    ) -> Result<bool, EndpointStoreError> {
        let Some(mut record) = self.find_by_name_and_icon(name, old_icon)? else {
            return Ok(false);
        };
        record.host_icon = new_icon.map(str::to_string);

        let write_txn = self
            .db
            .begin_write()
            .map_err(storage_err("Failed to begin write transaction"))?;
        self.put(&write_txn, &record)?;
        write_txn
            .commit()
            .map_err(storage_err("Failed to commit transaction"))?;

        debug!("Endpoint {} now shows {:?}", name, new_icon);
        Ok(true)
    }

    /// All saved profiles, in id order
    pub fn list(&self) -> Result<Vec<EndpointRecord>, EndpointStoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(storage_err("Failed to begin read transaction"))?;
        let table = read_txn
            .open_table(ENDPOINTS_TABLE)
            .map_err(storage_err("Failed to open endpoints table"))?;

        let mut records = Vec::new();
        for item in table
            .iter()
            .map_err(storage_err("Failed to iterate endpoints"))?
        {
            let (_id, value) = item.map_err(storage_err("Failed to read endpoint"))?;
            let record: EndpointRecord = rmp_serde::from_slice(value.value())
                .map_err(storage_err("Failed to deserialize endpoint"))?;
            records.push(record);
        }
        Ok(records)
    }

    fn put(
        &self,
        write_txn: &redb::WriteTransaction,
        record: &EndpointRecord,
    ) -> Result<(), EndpointStoreError> {
        let serialized = rmp_serde::to_vec_named(record)
            .map_err(storage_err("Failed to serialize endpoint"))?;
        let mut table = write_txn
            .open_table(ENDPOINTS_TABLE)
            .map_err(storage_err("Failed to open endpoints table"))?;
        table
            .insert(record.id, serialized.as_slice())
            .map_err(storage_err("Failed to insert endpoint"))?;
        Ok(())
    }
}
