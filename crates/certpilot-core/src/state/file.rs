// # File Store
//
// File-based implementation of ConfigStore and RunHistoryStore with crash
// recovery.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good state
// - Recovery: Falls back to backup if corruption detected
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "config": { "email": "ops@example.com", "domains": "example.com", ... },
//   "runs": [
//     { "command": "renew", "success": true, "output": "...", "created_at": "2025-01-09T12:00:00Z" }
//   ]
// }
// ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::DesiredConfig;
use crate::traits::stores::{ConfigStore, RunHistoryStore, RunRecord};

/// State file format version
const STATE_FILE_VERSION: &str = "1.0";

/// File-based store with crash recovery
///
/// Every mutation is written through to disk before returning.
///
/// # Example
///
/// ```rust,no_run
/// use certpilot_core::state::FileStore;
/// use certpilot_core::traits::ConfigStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileStore::new("/var/lib/certpilot/state.json").await?;
///     let config = store.load_or_default().await?;
///     store.save(&config).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Arc<RwLock<StateFileFormat>>,
}

/// Serializable state file format
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct StateFileFormat {
    version: String,
    #[serde(default)]
    config: Option<DesiredConfig>,
    #[serde(default)]
    runs: Vec<RunRecord>,
}

impl FileStore {
    /// Create or load a file store
    ///
    /// This will:
    /// 1. Try to load existing state file
    /// 2. If corruption detected, try to load from backup
    /// 3. If both fail, start with empty state
    /// 4. Create parent directories if needed
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to create state directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let state = Self::load_state_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Load state from file with automatic recovery
    async fn load_state_with_recovery(path: &Path) -> Result<StateFileFormat, Error> {
        match Self::load_state(path).await {
            Ok(state) => {
                tracing::debug!(runs = state.runs.len(), "Loaded state from file");
                Ok(state)
            }
            Err(Error::Parse(e)) => {
                tracing::warn!(
                    "State file appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with empty state.");
                    return Ok(StateFileFormat::default());
                }

                match Self::load_state(&backup_path).await {
                    Ok(state) => {
                        tracing::info!(runs = state.runs.len(), "Recovered state from backup");
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!(
                                "Failed to restore state file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(state)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also corrupted: {}. Starting with empty state.",
                            backup_err
                        );
                        Ok(StateFileFormat::default())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Load state from file
    async fn load_state(path: &Path) -> Result<StateFileFormat, Error> {
        if !path.exists() {
            tracing::debug!("State file does not exist: {}", path.display());
            return Ok(StateFileFormat::default());
        }

        let content = fs::read_to_string(path).await?;

        let state: StateFileFormat = serde_json::from_str(&content).map_err(|e| {
            Error::parse(format!(
                "Failed to parse state file {}: {}",
                path.display(),
                e
            ))
        })?;

        if state.version != STATE_FILE_VERSION {
            tracing::warn!(
                "State file version mismatch: expected {}, got {}. Attempting to load anyway.",
                STATE_FILE_VERSION,
                state.version
            );
        }

        Ok(state)
    }

    /// Write state to file atomically
    async fn write_state(&self, state: &StateFileFormat) -> Result<(), Error> {
        let mut snapshot = state.clone();
        snapshot.version = STATE_FILE_VERSION.to_string();
        let json = serde_json::to_string_pretty(&snapshot)?;

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(json.as_bytes()).await?;
            file.flush().await?;
        }

        if self.path.exists() {
            let backup_path = Self::backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await?;

        tracing::trace!("State written to file: {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn load(&self) -> Result<Option<DesiredConfig>, Error> {
        Ok(self.state.read().await.config.clone())
    }

    async fn save(&self, config: &DesiredConfig) -> Result<(), Error> {
        // Held across the write so concurrent saves land in call order
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        next.config = Some(config.clone());
        self.write_state(&next).await?;
        *guard = next;
        Ok(())
    }
}

#[async_trait]
impl RunHistoryStore for FileStore {
    async fn append(&self, record: RunRecord) -> Result<(), Error> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        next.runs.push(record);
        self.write_state(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn last(&self) -> Result<Option<RunRecord>, Error> {
        Ok(self.state.read().await.runs.last().cloned())
    }

    async fn list(&self) -> Result<Vec<RunRecord>, Error> {
        Ok(self.state.read().await.runs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(email: &str) -> DesiredConfig {
        DesiredConfig {
            email: email.to_string(),
            domains: "example.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_file_store_basic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::new(&path).await.unwrap();
        assert!(store.load().await.unwrap().is_none());

        store.save(&config("a@example.com")).await.unwrap();
        store
            .append(RunRecord::new("obtain", true, "done"))
            .await
            .unwrap();
        assert!(path.exists());

        // Load new instance and verify persistence
        let store2 = FileStore::new(&path).await.unwrap();
        assert_eq!(store2.load().await.unwrap(), Some(config("a@example.com")));
        assert_eq!(store2.last().await.unwrap().unwrap().command, "obtain");
    }

    #[tokio::test]
    async fn test_file_store_corruption_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::new(&path).await.unwrap();
        store.save(&config("first@example.com")).await.unwrap();
        // Second write creates the backup of the first
        store.save(&config("second@example.com")).await.unwrap();

        let backup_path = FileStore::backup_path(&path);
        assert!(backup_path.exists(), "Backup file should exist after write");

        fs::write(&path, b"corrupted json data").await.unwrap();

        let store2 = FileStore::new(&path)
            .await
            .expect("corrupted state should be recovered from backup");
        assert_eq!(
            store2.load().await.unwrap(),
            Some(config("first@example.com")),
            "Backup should contain previous state, not latest"
        );
    }

    #[tokio::test]
    async fn test_file_store_corruption_without_backup_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{").await.unwrap();

        let store = FileStore::new(&path).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_failed_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::new(&path).await.unwrap();
        store.save(&config("first@example.com")).await.unwrap();
        store
            .append(RunRecord::new("obtain", true, "done"))
            .await
            .unwrap();

        // A directory in place of the temp file makes every write fail
        fs::create_dir(store.temp_path()).await.unwrap();
        assert!(store.save(&config("second@example.com")).await.is_err());
        assert!(
            store
                .append(RunRecord::new("renew", false, ""))
                .await
                .is_err()
        );

        assert_eq!(store.load().await.unwrap(), Some(config("first@example.com")));
        assert_eq!(store.list().await.unwrap().len(), 1);

        fs::remove_dir(store.temp_path()).await.unwrap();
        let store2 = FileStore::new(&path).await.unwrap();
        assert_eq!(store2.load().await.unwrap(), store.load().await.unwrap());
        assert_eq!(store2.list().await.unwrap(), store.list().await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_history_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileStore::new(&path).await.unwrap();
        for i in 0..5 {
            store
                .append(RunRecord::new(format!("run-{i}"), i % 2 == 0, ""))
                .await
                .unwrap();
        }

        let store2 = FileStore::new(&path).await.unwrap();
        let commands: Vec<_> = store2
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.command)
            .collect();
        assert_eq!(commands, vec!["run-0", "run-1", "run-2", "run-3", "run-4"]);
    }
}
