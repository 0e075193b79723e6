//! Configuration Storage
//!
//! Handles reading/writing the options file to disk.
//! Data location: ~/.dawnftp on every platform

use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{AppOptions, OPTIONS_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Options version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the DawnFTP data directory, `.dawnftp` under the user's home
pub fn data_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".dawnftp"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the options file path
pub fn options_file() -> Result<PathBuf, StorageError> {
    Ok(data_dir()?.join("options.json"))
}

/// Options storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: options_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load options from disk.
    /// Missing file yields defaults; a corrupted file is backed up and defaults are returned.
    pub async fn load(&self) -> Result<AppOptions, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<AppOptions>(&contents) {
                Ok(options) => {
                    if options.version > OPTIONS_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: options.version,
                            supported: OPTIONS_VERSION,
                        });
                    }
                    Ok(options)
                }
                Err(e) => {
                    tracing::warn!("Options file corrupted: {}", e);
                    match self.backup().await {
                        Ok(backup_path) => tracing::warn!(
                            "Corrupted options backed up to {:?}, using defaults",
                            backup_path
                        ),
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted options: {}", backup_err)
                        }
                    }
                    Ok(AppOptions::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppOptions::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save options to disk (temp file + rename)
    pub async fn save(&self, options: &AppOptions) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(options)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current options file aside with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if fs::metadata(&self.path).await.is_ok() {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("options.json"));

        let options = storage.load().await.unwrap();
        assert_eq!(options.version, OPTIONS_VERSION);
        assert_eq!(options.refresh_interval_ms, 2000);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("options.json"));

        let options = AppOptions {
            show_idle_remote_tasks: true,
            index_remote_directories: true,
            ..Default::default()
        };
        storage.save(&options).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert!(loaded.show_idle_remote_tasks);
        assert!(loaded.index_remote_directories);
        assert!(!loaded.index_local_directories);
    }

    #[tokio::test]
    async fn test_corrupted_file_falls_back_to_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("options.json");
        std::fs::write(&path, "{ not json").unwrap();
        let storage = ConfigStorage::with_path(path);

        let options = storage.load().await.unwrap();
        assert!(!options.disable_automatic_refresh);

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_newer_version_is_refused() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("options.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();
        let storage = ConfigStorage::with_path(path);

        assert!(matches!(
            storage.load().await,
            Err(StorageError::VersionTooNew { found: 99, .. })
        ));
    }

    #[test]
    fn test_data_dir_is_dot_dawnftp_under_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(data_dir().unwrap(), home.join(".dawnftp"));
        assert_eq!(options_file().unwrap(), home.join(".dawnftp").join("options.json"));
    }
}
