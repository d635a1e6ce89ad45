use std::sync::Mutex;

use chrono::{DateTime, Utc};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::CheckpointPersistence;
use waypoint_core::types::{CheckpointData, ExecutionStatus};

/// Process-local checkpoint store. Lost on exit; used by tests and by
/// `backend = "memory"`.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<Vec<CheckpointData>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<CheckpointData>>> {
        self.checkpoints
            .lock()
            .map_err(|e| WaypointError::Database(e.to_string()))
    }
}

impl CheckpointPersistence for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &CheckpointData) -> Result<()> {
        let mut checkpoints = self.lock()?;
        if checkpoints
            .iter()
            .any(|c| c.checkpoint_id == checkpoint.checkpoint_id)
        {
            return Err(WaypointError::Database(format!(
                "Checkpoint {} already exists",
                checkpoint.checkpoint_id
            )));
        }
        checkpoints.push(checkpoint.clone());
        Ok(())
    }

    fn load(&self, checkpoint_id: &str) -> Result<Option<CheckpointData>> {
        Ok(self
            .lock()?
            .iter()
            .find(|c| c.checkpoint_id == checkpoint_id)
            .cloned())
    }

    fn list(
        &self,
        execution_id: &str,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<CheckpointData>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|c| c.execution_id == execution_id)
            .filter(|c| status.map_or(true, |s| c.state.status == s))
            .cloned()
            .collect())
    }

    fn delete(&self, checkpoint_id: &str) -> Result<bool> {
        let mut checkpoints = self.lock()?;
        let before = checkpoints.len();
        checkpoints.retain(|c| c.checkpoint_id != checkpoint_id);
        Ok(checkpoints.len() < before)
    }

    fn delete_execution(&self, execution_id: &str) -> Result<usize> {
        let mut checkpoints = self.lock()?;
        let before = checkpoints.len();
        checkpoints.retain(|c| c.execution_id != execution_id);
        Ok(before - checkpoints.len())
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut checkpoints = self.lock()?;
        let before = checkpoints.len();
        checkpoints.retain(|c| c.created_at >= cutoff);
        Ok(before - checkpoints.len())
    }
}
