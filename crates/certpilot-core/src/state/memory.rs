// # Memory Store
//
// In-memory implementation of ConfigStore and RunHistoryStore.
//
// ## Purpose
//
// Provides a simple, fast store that doesn't persist across restarts.
// Useful for tests and for deployments where the configuration is
// re-seeded on every start.
//
// ## Crash Behavior
//
// - Configuration and run history are lost on restart/crash
// - The next start sees an empty, defaulted configuration

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::DesiredConfig;
use crate::traits::stores::{ConfigStore, RunHistoryStore, RunRecord};

/// In-memory store implementation
///
/// Clones share the same underlying state.
///
/// # Example
///
/// ```rust,no_run
/// use certpilot_core::state::MemoryStore;
/// use certpilot_core::traits::{ConfigStore, RunHistoryStore, RunRecord};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStore::new();
///
///     let config = store.load_or_default().await?;
///     store.save(&config).await?;
///
///     store.append(RunRecord::new("obtain", true, "ok")).await?;
///     assert_eq!(store.last().await?.map(|r| r.command), Some("obtain".to_string()));
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    config: Arc<RwLock<Option<DesiredConfig>>>,
    runs: Arc<RwLock<Vec<RunRecord>>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with a configuration
    pub fn with_config(config: DesiredConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(Some(config))),
            runs: Arc::default(),
        }
    }

    /// Number of run records
    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load(&self) -> Result<Option<DesiredConfig>, Error> {
        Ok(self.config.read().await.clone())
    }

    async fn save(&self, config: &DesiredConfig) -> Result<(), Error> {
        *self.config.write().await = Some(config.clone());
        Ok(())
    }
}

#[async_trait]
impl RunHistoryStore for MemoryStore {
    async fn append(&self, record: RunRecord) -> Result<(), Error> {
        self.runs.write().await.push(record);
        Ok(())
    }

    async fn last(&self) -> Result<Option<RunRecord>, Error> {
        Ok(self.runs.read().await.last().cloned())
    }

    async fn list(&self) -> Result<Vec<RunRecord>, Error> {
        Ok(self.runs.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_config_upsert() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_none());

        let defaulted = store.load_or_default().await.unwrap();
        assert_eq!(defaulted.auto_days, crate::config::DEFAULT_AUTO_DAYS);

        let config = DesiredConfig {
            email: "ops@example.com".to_string(),
            ..Default::default()
        };
        store.save(&config).await.unwrap();
        store.save(&config).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(config));
    }

    #[tokio::test]
    async fn test_memory_store_history_is_append_only() {
        let store = MemoryStore::new();
        store.append(RunRecord::new("obtain", false, "a")).await.unwrap();
        store.append(RunRecord::new("renew", true, "b")).await.unwrap();

        assert_eq!(store.run_count().await, 2);
        let last = store.last().await.unwrap().unwrap();
        assert_eq!(last.command, "renew");
        assert!(last.success);

        let all = store.list().await.unwrap();
        assert_eq!(all[0].command, "obtain");
    }
}
