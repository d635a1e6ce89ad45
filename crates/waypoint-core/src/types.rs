use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WaypointError};

/// Metadata key under which a checkpoint embeds the full step list.
pub const METADATA_STEPS_KEY: &str = "workflow_steps";
/// Metadata key under which a checkpoint embeds the parallel step ids.
pub const METADATA_PARALLEL_KEY: &str = "parallel_steps";

/// Opaque JSON object produced by a step.
pub type OutputMap = serde_json::Map<String, serde_json::Value>;

/// Generate a random identifier (UUIDv4).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Status of a single workflow step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// What kind of work a step performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A single agent invocation handled by the configured step runner.
    #[default]
    Agent,
    /// A macro-to-micro handoff session.
    Handoff,
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: OutputMap,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            kind: StepKind::Agent,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: OutputMap::new(),
            provider: None,
            model: None,
            cost: 0.0,
            tokens_used: 0,
            error: None,
        }
    }

    /// Set the description (used as the step's prompt).
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the step kind.
    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    /// Wall time between start and completion, zero unless both are set.
    pub fn duration(&self) -> chrono::Duration {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => end - start,
            _ => chrono::Duration::zero(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// A copy of this step with all run data cleared.
    pub fn definition(&self) -> Self {
        Self::new(self.id.clone(), self.name.clone())
            .with_description(self.description.clone())
            .with_kind(self.kind)
    }
}

/// Lifecycle of a workflow execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = WaypointError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(WaypointError::Config(format!(
                "Unknown execution status: {}",
                other
            ))),
        }
    }
}

/// Full state of one workflow execution.
///
/// Owned by the state machine driving it. `completed_steps` is recomputed
/// from the step statuses after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub user_prompt: String,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub current_step_id: Option<String>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub aggregate_output: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub total_tokens_used: u64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionState {
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        user_prompt: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        let now = Utc::now();
        let mut state = Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            created_at: now,
            updated_at: now,
            user_prompt: user_prompt.into(),
            goal: None,
            current_step_id: None,
            completed_steps: 0,
            total_steps: steps.len(),
            steps,
            aggregate_output: HashMap::new(),
            total_tokens_used: 0,
            total_cost: 0.0,
            retry_count: 0,
            max_retries: 0,
            error: None,
        };
        state.recount();
        state
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Move to a new lifecycle status, rejecting illegal transitions.
    pub fn set_status(&mut self, next: ExecutionStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(WaypointError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Mark the execution FAILED with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.set_status(ExecutionStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    fn step_mut(&mut self, step_id: &str) -> Result<&mut WorkflowStep> {
        let execution_id = self.execution_id.clone();
        self.steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| WaypointError::UnknownStep {
                execution_id,
                step_id: step_id.to_string(),
            })
    }

    /// Transition a step to RUNNING and make it the current step.
    pub fn start_step(&mut self, step_id: &str) -> Result<()> {
        let step = self.step_mut(step_id)?;
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.completed_at = None;
        step.error = None;
        self.current_step_id = Some(step_id.to_string());
        self.touch();
        Ok(())
    }

    /// Transition a step to COMPLETED, recording its output and usage.
    pub fn complete_step(&mut self, step_id: &str, outcome: StepOutcome) -> Result<()> {
        let step = self.step_mut(step_id)?;
        step.status = StepStatus::Completed;
        step.completed_at = Some(Utc::now());
        step.output = outcome.output.clone();
        step.provider = outcome.provider;
        step.model = outcome.model;
        step.cost = outcome.cost;
        step.tokens_used = outcome.tokens_used;
        step.error = None;

        self.aggregate_output
            .insert(step_id.to_string(), serde_json::Value::Object(outcome.output));
        self.total_tokens_used += outcome.tokens_used;
        self.total_cost += outcome.cost;
        self.recount();
        self.touch();
        Ok(())
    }

    /// Transition a step to FAILED.
    pub fn fail_step(&mut self, step_id: &str, error: impl Into<String>) -> Result<()> {
        let step = self.step_mut(step_id)?;
        step.status = StepStatus::Failed;
        step.completed_at = Some(Utc::now());
        step.error = Some(error.into());
        self.recount();
        self.touch();
        Ok(())
    }

    /// Point the execution at a step without changing its status.
    pub fn set_current_step(&mut self, step_id: &str) -> Result<()> {
        if self.step(step_id).is_none() {
            return Err(WaypointError::UnknownStep {
                execution_id: self.execution_id.clone(),
                step_id: step_id.to_string(),
            });
        }
        self.current_step_id = Some(step_id.to_string());
        self.touch();
        Ok(())
    }

    /// Align `steps` with a workflow definition, keeping the recorded run
    /// data of steps that appear in both and dropping the rest.
    pub fn reconcile_steps(&mut self, definitions: &[WorkflowStep]) {
        let mut previous = std::mem::take(&mut self.steps);
        self.steps = definitions
            .iter()
            .map(|def| match previous.iter().position(|s| s.id == def.id) {
                Some(i) => previous.swap_remove(i),
                None => def.definition(),
            })
            .collect();
        if let Some(current) = self.current_step_id.as_deref() {
            if self.step(current).is_none() {
                self.current_step_id = None;
            }
        }
        self.recount();
        self.touch();
    }

    /// Check the structural invariants. Used by tests and debug assertions.
    pub fn invariants_hold(&self) -> bool {
        let current_ok = self
            .current_step_id
            .as_deref()
            .map_or(true, |id| self.step(id).is_some());
        self.completed_steps <= self.total_steps
            && self.total_steps == self.steps.len()
            && current_ok
    }

    fn recount(&mut self) {
        self.total_steps = self.steps.len();
        self.completed_steps = self.steps.iter().filter(|s| s.is_completed()).count();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// What a step runner hands back for a successful step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub output: OutputMap,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub tokens_used: u64,
    pub cost: f64,
}

impl StepOutcome {
    /// An outcome whose output is a single `text` field.
    pub fn text(text: impl Into<String>) -> Self {
        let mut output = OutputMap::new();
        output.insert("text".into(), serde_json::Value::String(text.into()));
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, tokens_used: u64, cost: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost = cost;
        self
    }
}

/// Read-only context handed to a step runner.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_prompt: String,
    pub goal: Option<String>,
    /// 0 on the first attempt, incremented per retry.
    pub attempt: u32,
    /// Outputs of steps that completed before this one started.
    pub prior_outputs: HashMap<String, serde_json::Value>,
}

/// Immutable snapshot of an execution, enabling resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub checkpoint_id: String,
    pub execution_id: String,
    pub created_at: DateTime<Utc>,
    pub state: ExecutionState,
    pub step_id: String,
    pub step_name: String,
    #[serde(default = "default_can_resume")]
    pub can_resume: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_can_resume() -> bool {
    true
}

impl CheckpointData {
    /// The step list embedded in the metadata, if any.
    pub fn workflow_steps(&self) -> Option<Vec<WorkflowStep>> {
        let value = self.metadata.get(METADATA_STEPS_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// The parallel step ids embedded in the metadata (empty if absent).
    pub fn parallel_steps(&self) -> Vec<String> {
        self.metadata
            .get(METADATA_PARALLEL_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}
