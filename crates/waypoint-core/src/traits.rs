use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::agent::{MacroAgentRequest, MacroAgentResult, MicroAgentRequest, MicroAgentResult};
use crate::budget::{BudgetAllocation, BudgetScope};
use crate::error::Result;
use crate::types::*;

/// Planning agent adapter.
pub trait MacroAgent: Send + Sync + 'static {
    /// Run the planning agent once.
    fn execute(&self, request: MacroAgentRequest) -> BoxFuture<'_, Result<MacroAgentResult>>;

    /// Release any resources held by the adapter.
    fn cleanup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Execution agent adapter.
pub trait MicroAgent: Send + Sync + 'static {
    /// Run a single task.
    fn execute(&self, request: MicroAgentRequest) -> BoxFuture<'_, Result<MicroAgentResult>>;

    /// Release any resources held by the adapter.
    fn cleanup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Token and cost accounting per scope.
pub trait BudgetController: Send + Sync + 'static {
    /// Open a new allocation for a scope.
    fn create_allocation(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> BoxFuture<'_, Result<BudgetAllocation>>;

    /// Add usage to an allocation and return its updated state.
    fn record_usage(
        &self,
        allocation_id: &str,
        tokens: u64,
        cost: f64,
    ) -> BoxFuture<'_, Result<BudgetAllocation>>;

    /// Look up an allocation.
    fn get_allocation(&self, allocation_id: &str) -> BoxFuture<'_, Result<BudgetAllocation>>;

    /// Forget an allocation whose owner is gone.
    fn release_allocation(&self, allocation_id: &str) -> BoxFuture<'_, Result<()>>;
}

/// Checkpoint persistence backend.
///
/// Checkpoints are append-only: `save` never overwrites an existing id.
pub trait CheckpointPersistence: Send + Sync + 'static {
    fn save(&self, checkpoint: &CheckpointData) -> Result<()>;

    fn load(&self, checkpoint_id: &str) -> Result<Option<CheckpointData>>;

    /// Checkpoints of an execution, oldest first, optionally filtered by the
    /// status of the embedded state.
    fn list(
        &self,
        execution_id: &str,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<CheckpointData>>;

    /// Returns whether a checkpoint was deleted.
    fn delete(&self, checkpoint_id: &str) -> Result<bool>;

    /// Delete every checkpoint of an execution, returning how many went.
    fn delete_execution(&self, execution_id: &str) -> Result<usize>;

    /// Delete checkpoints created before `cutoff`, returning how many went.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Executes one workflow step.
pub trait StepRunner: Send + Sync + 'static {
    fn run<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: StepContext,
    ) -> BoxFuture<'a, Result<StepOutcome>>;
}
