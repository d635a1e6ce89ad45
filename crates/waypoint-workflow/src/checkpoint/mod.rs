//! Checkpoint store: immutable execution snapshots, keyed by checkpoint id,
//! execution id and creation time.

mod memory;
mod sqlite;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use waypoint_core::config::{AppConfig, CheckpointBackend};
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::CheckpointPersistence;
use waypoint_core::types::{CheckpointData, ExecutionState, ExecutionStatus};

pub use memory::InMemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// Front end over a pluggable persistence backend.
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointPersistence>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointPersistence>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCheckpointStore::new()))
    }

    /// Open the backend selected by `[checkpoint]`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        match config.checkpoint.backend {
            CheckpointBackend::Memory => Ok(Self::in_memory()),
            CheckpointBackend::Sqlite => {
                let store = SqliteCheckpointStore::open(&config.checkpoint_path())?;
                Ok(Self::new(Arc::new(store)))
            }
        }
    }

    /// Snapshot `state` and persist it.
    ///
    /// The snapshot is resumable unless the state is terminal. Ids are
    /// UUIDv7, so they sort by creation time.
    pub fn create_checkpoint(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        step_id: &str,
        step_name: &str,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CheckpointData> {
        let checkpoint = CheckpointData {
            checkpoint_id: Uuid::now_v7().to_string(),
            execution_id: execution_id.to_string(),
            created_at: Utc::now(),
            state: state.clone(),
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            can_resume: !state.status.is_terminal(),
            metadata: metadata.unwrap_or_default(),
        };
        self.backend.save(&checkpoint)?;
        info!(
            execution_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            step_id,
            status = %state.status,
            can_resume = checkpoint.can_resume,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    pub fn load_checkpoint(&self, checkpoint_id: &str) -> Result<CheckpointData> {
        self.backend
            .load(checkpoint_id)?
            .ok_or_else(|| WaypointError::CheckpointNotFound(checkpoint_id.to_string()))
    }

    /// Checkpoints of an execution, oldest first.
    pub fn list_checkpoints(
        &self,
        execution_id: &str,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<CheckpointData>> {
        self.backend.list(execution_id, status)
    }

    pub fn get_latest_checkpoint(&self, execution_id: &str) -> Result<Option<CheckpointData>> {
        Ok(self.backend.list(execution_id, None)?.pop())
    }

    /// Newest checkpoint of an execution that can still be resumed.
    pub fn get_latest_resumable(&self, execution_id: &str) -> Result<Option<CheckpointData>> {
        Ok(self
            .backend
            .list(execution_id, None)?
            .into_iter()
            .rev()
            .find(|c| c.can_resume))
    }

    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool> {
        let deleted = self.backend.delete(checkpoint_id)?;
        debug!(checkpoint_id, deleted, "Checkpoint delete");
        Ok(deleted)
    }

    pub fn delete_execution(&self, execution_id: &str) -> Result<usize> {
        let deleted = self.backend.delete_execution(execution_id)?;
        debug!(execution_id, deleted, "Deleted execution checkpoints");
        Ok(deleted)
    }

    /// Remove checkpoints older than `retention`.
    pub fn cleanup_old(&self, retention: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - retention;
        let deleted = self.backend.delete_older_than(cutoff)?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Cleaned up old checkpoints");
        }
        Ok(deleted)
    }
}
