use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaypointError {
    // Lookup errors
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Handoff session not found: {0}")]
    SessionNotFound(String),

    #[error("Budget allocation not found: {0}")]
    AllocationNotFound(String),

    // Resume / state errors
    #[error("Checkpoint is not resumable: {0}")]
    NotResumable(String),

    #[error("No workflow steps available to resume checkpoint {0}")]
    NoWorkflowSteps(String),

    #[error("Step '{step_id}' of checkpoint {checkpoint_id} is not part of the workflow")]
    StepNotFound {
        checkpoint_id: String,
        step_id: String,
    },

    #[error("Step '{step_id}' does not exist in execution {execution_id}")]
    UnknownStep {
        execution_id: String,
        step_id: String,
    },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Execution is already being driven: {0}")]
    ExecutionActive(String),

    // Agent errors
    #[error("Macro agent failed: {0}")]
    MacroAgent(String),

    #[error("Micro agent failed: {0}")]
    MicroAgent(String),

    #[error("Agent call timed out after {timeout_secs}s: {target}")]
    AgentTimeout { target: String, timeout_secs: u64 },

    #[error("Step execution failed: {step_id}: {message}")]
    StepExecution { step_id: String, message: String },

    // Budget errors
    #[error("Budget error: {0}")]
    Budget(String),

    // Teardown errors
    #[error("Resource cleanup failed: {0}")]
    Cleanup(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of an error, used by callers to decide whether to
/// retry, correct their input, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown checkpoint, execution, session or allocation id. Never retried.
    NotFound,
    /// The request is well-formed but the current state forbids it.
    InvalidState,
    /// A single micro task failed; the session carries on.
    TaskFailure,
    /// The planning agent failed; nothing was handed off.
    MacroFailure,
    /// An adapter failed to release its resources.
    ResourceCleanup,
    /// Storage, serialization, configuration or accounting failure.
    Infrastructure,
}

impl WaypointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CheckpointNotFound(_)
            | Self::ExecutionNotFound(_)
            | Self::SessionNotFound(_)
            | Self::AllocationNotFound(_) => ErrorKind::NotFound,
            Self::NotResumable(_)
            | Self::NoWorkflowSteps(_)
            | Self::StepNotFound { .. }
            | Self::UnknownStep { .. }
            | Self::InvalidTransition { .. }
            | Self::ExecutionActive(_) => ErrorKind::InvalidState,
            Self::MicroAgent(_) | Self::AgentTimeout { .. } | Self::StepExecution { .. } => {
                ErrorKind::TaskFailure
            }
            Self::MacroAgent(_) => ErrorKind::MacroFailure,
            Self::Cleanup(_) => ErrorKind::ResourceCleanup,
            Self::Budget(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Infrastructure,
        }
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;
