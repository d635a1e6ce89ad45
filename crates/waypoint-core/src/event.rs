use crate::task::{HandoffStatus, TaskStatus};

/// Event broadcast to all subscribers while workflows and handoffs run.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// An execution moved from PENDING to RUNNING.
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
        total_steps: usize,
    },
    /// An execution was restored from a checkpoint.
    ExecutionResumed {
        execution_id: String,
        workflow_id: String,
        checkpoint_id: String,
        step_id: String,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        execution_id: String,
        step_id: String,
        tokens_used: u64,
        cost: f64,
        duration_ms: i64,
    },
    StepFailed {
        execution_id: String,
        step_id: String,
        error: String,
        will_retry: bool,
    },
    CheckpointCreated {
        execution_id: String,
        checkpoint_id: String,
        step_id: String,
        can_resume: bool,
    },
    ExecutionPaused {
        execution_id: String,
    },
    ExecutionCompleted {
        execution_id: String,
        completed_steps: usize,
        total_tokens_used: u64,
        total_cost: f64,
    },
    ExecutionFailed {
        execution_id: String,
        error: String,
    },
    ExecutionCancelled {
        execution_id: String,
    },
    HandoffStarted {
        session_id: String,
        workflow_id: String,
    },
    TaskStarted {
        session_id: String,
        workflow_id: String,
        task_id: String,
    },
    TaskFinished {
        session_id: String,
        workflow_id: String,
        task_id: String,
        status: TaskStatus,
    },
    HandoffFinished {
        session_id: String,
        workflow_id: String,
        status: HandoffStatus,
        completed_tasks: usize,
        total_tasks: usize,
    },
}

impl WorkflowEvent {
    /// The execution or workflow id this event belongs to.
    pub fn scope_id(&self) -> &str {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::ExecutionResumed { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::CheckpointCreated { execution_id, .. }
            | Self::ExecutionPaused { execution_id }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. }
            | Self::ExecutionCancelled { execution_id } => execution_id,
            Self::HandoffStarted { workflow_id, .. }
            | Self::TaskStarted { workflow_id, .. }
            | Self::TaskFinished { workflow_id, .. }
            | Self::HandoffFinished { workflow_id, .. } => workflow_id,
        }
    }

    /// Whether this event ends an execution's lifecycle.
    pub fn is_execution_end(&self) -> bool {
        matches!(
            self,
            Self::ExecutionPaused { .. }
                | Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionCancelled { .. }
        )
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
