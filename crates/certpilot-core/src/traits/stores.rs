// # Store Traits
//
// Interfaces to the persistence collaborators.
//
// ## Purpose
//
// The engine never owns its persistent records. It reads and upserts the
// single desired configuration through a `ConfigStore` and appends one
// `RunRecord` per completed run through a `RunHistoryStore`.
//
// ## Implementations
//
// - `MemoryStore`: in-memory, for tests and ephemeral deployments
// - `FileStore`: JSON file with atomic writes and backup recovery
//
// ## Usage
//
// ```rust,ignore
// use certpilot_core::traits::{ConfigStore, RunHistoryStore, RunRecord};
//
// let config = store.load_or_default().await?;
// history.append(RunRecord::new("renew", true, output)).await?;
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DesiredConfig;
use crate::error::Result;

/// One completed agent run or installation
///
/// Records are append-only: the engine creates one per attempt and never
/// mutates or deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Command name (`obtain`, `renew`, `install`, `auto-renew`, `auto-install`)
    pub command: String,
    /// Whether the run succeeded
    pub success: bool,
    /// Captured output or error text
    pub output: String,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl RunRecord {
    /// Create a record stamped with the current time
    pub fn new(command: impl Into<String>, success: bool, output: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            success,
            output: output.into(),
            created_at: chrono::Utc::now(),
        }
    }
}

/// Access to the single desired-configuration record
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load the stored configuration, if any, without defaults applied
    async fn load(&self) -> Result<Option<DesiredConfig>>;

    /// Insert or replace the single configuration record
    async fn save(&self, config: &DesiredConfig) -> Result<()>;

    /// Load the stored configuration with defaults applied
    ///
    /// Returns a defaulted empty configuration when nothing is stored yet.
    async fn load_or_default(&self) -> Result<DesiredConfig> {
        Ok(self.load().await?.unwrap_or_default().with_defaults())
    }
}

/// Append-only history of agent runs and installations
#[async_trait]
pub trait RunHistoryStore: Send + Sync {
    /// Append a record
    async fn append(&self, record: RunRecord) -> Result<()>;

    /// Most recently appended record
    async fn last(&self) -> Result<Option<RunRecord>>;

    /// All records, oldest first
    async fn list(&self) -> Result<Vec<RunRecord>>;
}
