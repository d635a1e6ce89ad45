use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::{ExecutionState, ExecutionStatus};

/// Cooperative control signals for one live execution.
///
/// Both are only observed by the driver between stages.
#[derive(Debug, Clone, Default)]
pub struct ExecutionControl {
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
}

impl ExecutionControl {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Token that fires when the execution is cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct Entry {
    state: ExecutionState,
    control: ExecutionControl,
    finished_at: Option<DateTime<Utc>>,
}

/// Live-state registry of executions known to this process.
///
/// Holds a copy of each execution's state, republished by the driver after
/// every transition. Terminal entries stay until `purge_terminal` evicts them.
#[derive(Default)]
pub struct ExecutionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panicked writer leaves a copy that is at worst one transition stale.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register (or re-register, on resume) an execution and hand back fresh
    /// control signals. Fails if the execution is currently running here.
    pub fn register(&self, state: &ExecutionState) -> Result<ExecutionControl> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&state.execution_id) {
            if existing.state.status == ExecutionStatus::Running {
                return Err(WaypointError::ExecutionActive(state.execution_id.clone()));
            }
        }
        let control = ExecutionControl::default();
        entries.insert(
            state.execution_id.clone(),
            Entry {
                state: state.clone(),
                control: control.clone(),
                finished_at: None,
            },
        );
        debug!(execution_id = %state.execution_id, status = %state.status, "Execution registered");
        Ok(control)
    }

    /// Replace the stored copy with the driver's latest state.
    pub fn publish(&self, state: &ExecutionState) {
        let mut entries = self.lock();
        let finished_at = state.status.is_terminal().then(Utc::now);
        match entries.get_mut(&state.execution_id) {
            Some(entry) => {
                entry.state = state.clone();
                entry.finished_at = finished_at;
            }
            None => {
                entries.insert(
                    state.execution_id.clone(),
                    Entry {
                        state: state.clone(),
                        control: ExecutionControl::default(),
                        finished_at,
                    },
                );
            }
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionState> {
        self.lock().get(execution_id).map(|e| e.state.clone())
    }

    pub fn control(&self, execution_id: &str) -> Option<ExecutionControl> {
        self.lock().get(execution_id).map(|e| e.control.clone())
    }

    pub fn execution_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn remove(&self, execution_id: &str) -> Option<ExecutionState> {
        self.lock().remove(execution_id).map(|e| e.state)
    }

    /// Evict executions that reached a terminal status more than `retention`
    /// ago. Returns how many were evicted.
    pub fn purge_terminal(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| !matches!(e.finished_at, Some(at) if at <= cutoff));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "Purged terminal executions from registry");
        }
        purged
    }
}
