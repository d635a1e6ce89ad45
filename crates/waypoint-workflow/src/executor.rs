use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use waypoint_core::config::{AppConfig, EngineConfig};
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{EventBus, WorkflowEvent};
use waypoint_core::traits::StepRunner;
use waypoint_core::types::*;

use crate::checkpoint::CheckpointStore;
use crate::graph::WorkflowGraph;
use crate::registry::{ExecutionControl, ExecutionRegistry};

/// Everything needed to start a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    /// Generated when absent.
    pub execution_id: Option<String>,
    pub workflow_id: String,
    pub user_prompt: String,
    pub goal: Option<String>,
    pub steps: Vec<WorkflowStep>,
    /// Steps that form the fork-join block.
    pub parallel_steps: Vec<String>,
}

impl WorkflowRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        user_prompt: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        Self {
            execution_id: None,
            workflow_id: workflow_id.into(),
            user_prompt: user_prompt.into(),
            goal: None,
            steps,
            parallel_steps: vec![],
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn with_parallel(mut self, step_ids: Vec<String>) -> Self {
        self.parallel_steps = step_ids;
        self
    }
}

/// Outcome of one step after all of its attempts.
struct StepRun {
    step_id: String,
    retries: u32,
    result: std::result::Result<StepOutcome, String>,
}

/// Drives workflow executions through their step graph.
///
/// One call to `start` or `resume_*` drives one execution to a resting
/// status (COMPLETED, FAILED, CANCELLED or PAUSED) on the caller's task.
/// Parallel steps are polled concurrently on that same task.
pub struct WorkflowEngine {
    runner: Arc<dyn StepRunner>,
    checkpoints: CheckpointStore,
    registry: Arc<ExecutionRegistry>,
    event_bus: Option<Arc<EventBus>>,
    config: EngineConfig,
    checkpoints_enabled: bool,
}

impl WorkflowEngine {
    pub fn new(
        runner: Arc<dyn StepRunner>,
        checkpoints: CheckpointStore,
        registry: Arc<ExecutionRegistry>,
    ) -> Self {
        Self {
            runner,
            checkpoints,
            registry,
            event_bus: None,
            config: EngineConfig::default(),
            checkpoints_enabled: true,
        }
    }

    /// Build an engine from the loaded configuration.
    pub fn from_config(
        config: &AppConfig,
        runner: Arc<dyn StepRunner>,
        registry: Arc<ExecutionRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let checkpoints = CheckpointStore::from_config(config)?;
        Ok(Self::new(runner, checkpoints, registry)
            .with_config(config.engine.clone())
            .with_checkpoints_enabled(config.checkpoint.enabled))
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Disable interval checkpoints. Pause still writes one.
    pub fn with_checkpoints_enabled(mut self, enabled: bool) -> Self {
        self.checkpoints_enabled = enabled;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// Start a new execution and drive it until it rests.
    pub async fn start(&self, request: WorkflowRequest) -> Result<ExecutionState> {
        let execution_id = request.execution_id.unwrap_or_else(new_id);
        let definitions: Vec<WorkflowStep> =
            request.steps.iter().map(WorkflowStep::definition).collect();
        let graph = WorkflowGraph::new(definitions.clone(), &request.parallel_steps);

        let mut state = ExecutionState::new(
            execution_id.clone(),
            request.workflow_id.clone(),
            request.user_prompt,
            definitions,
        )
        .with_max_retries(self.config.max_retries);
        if let Some(goal) = request.goal {
            state = state.with_goal(goal);
        }

        let control = self.registry.register(&state)?;
        state.set_status(ExecutionStatus::Running)?;
        self.registry.publish(&state);

        info!(
            execution_id = %execution_id,
            workflow_id = %request.workflow_id,
            steps = state.total_steps,
            stages = graph.stages().len(),
            "Workflow execution started"
        );
        self.emit(WorkflowEvent::ExecutionStarted {
            execution_id,
            workflow_id: request.workflow_id,
            total_steps: state.total_steps,
        });

        self.run_to_rest(state, &graph, &control, 0).await
    }

    /// Resume an execution from a checkpoint.
    ///
    /// The step list embedded in the checkpoint wins over `steps`. Steps that
    /// were already COMPLETED in the snapshot are not run again.
    pub async fn resume_from_checkpoint(
        &self,
        checkpoint_id: &str,
        steps: Option<Vec<WorkflowStep>>,
    ) -> Result<ExecutionState> {
        let checkpoint = self.checkpoints.load_checkpoint(checkpoint_id)?;
        if !checkpoint.can_resume {
            return Err(WaypointError::NotResumable(checkpoint_id.to_string()));
        }
        self.ensure_open(&checkpoint)?;

        let definitions: Vec<WorkflowStep> = checkpoint
            .workflow_steps()
            .or(steps)
            .ok_or_else(|| WaypointError::NoWorkflowSteps(checkpoint_id.to_string()))?
            .iter()
            .map(WorkflowStep::definition)
            .collect();
        if !definitions.iter().any(|s| s.id == checkpoint.step_id) {
            return Err(WaypointError::StepNotFound {
                checkpoint_id: checkpoint_id.to_string(),
                step_id: checkpoint.step_id.clone(),
            });
        }

        let graph = WorkflowGraph::new(definitions.clone(), &checkpoint.parallel_steps());
        let from_stage = graph.stage_of(&checkpoint.step_id).unwrap_or_default();

        let mut state = checkpoint.state.clone();
        state.reconcile_steps(&definitions);
        state.error = None;
        state.set_status(ExecutionStatus::Running)?;
        let control = self.registry.register(&state)?;

        info!(
            execution_id = %state.execution_id,
            checkpoint_id,
            step_id = %checkpoint.step_id,
            completed = state.completed_steps,
            "Resuming workflow execution from checkpoint"
        );
        self.emit(WorkflowEvent::ExecutionResumed {
            execution_id: state.execution_id.clone(),
            workflow_id: state.workflow_id.clone(),
            checkpoint_id: checkpoint_id.to_string(),
            step_id: checkpoint.step_id.clone(),
        });

        self.run_to_rest(state, &graph, &control, from_stage).await
    }

    /// Resume an execution from its newest resumable checkpoint.
    pub async fn resume_latest(&self, execution_id: &str) -> Result<ExecutionState> {
        let checkpoint = self
            .checkpoints
            .get_latest_resumable(execution_id)?
            .ok_or_else(|| {
                WaypointError::CheckpointNotFound(format!(
                    "no resumable checkpoint for execution {}",
                    execution_id
                ))
            })?;
        self.resume_from_checkpoint(&checkpoint.checkpoint_id, None)
            .await
    }

    /// Ask a running execution to pause after its in-flight stage.
    pub fn pause(&self, execution_id: &str) -> Result<()> {
        let state = self.get_state(execution_id)?;
        match state.status {
            ExecutionStatus::Running => {
                if let Some(control) = self.registry.control(execution_id) {
                    control.request_pause();
                }
                info!(execution_id, "Pause requested");
                Ok(())
            }
            ExecutionStatus::Paused => Ok(()),
            other => Err(WaypointError::InvalidTransition {
                from: other.to_string(),
                to: ExecutionStatus::Paused.to_string(),
            }),
        }
    }

    /// Cancel an execution.
    ///
    /// A running execution is cancelled after its in-flight stage; a pending
    /// or paused one is cancelled immediately. Cancelling twice is a no-op.
    pub fn cancel(&self, execution_id: &str) -> Result<()> {
        let mut state = self.get_state(execution_id)?;
        match state.status {
            ExecutionStatus::Running => {
                if let Some(control) = self.registry.control(execution_id) {
                    control.cancel();
                }
                info!(execution_id, "Cancellation requested");
                Ok(())
            }
            ExecutionStatus::Pending | ExecutionStatus::Paused => {
                state.set_status(ExecutionStatus::Cancelled)?;
                self.registry.publish(&state);
                let resume_point = state
                    .current_step_id
                    .clone()
                    .or_else(|| state.steps.last().map(|s| s.id.clone()))
                    .unwrap_or_default();
                if self.checkpoints_enabled {
                    self.write_checkpoint(&state, &resume_point, None)?;
                }
                info!(execution_id, "Workflow execution cancelled");
                self.emit(WorkflowEvent::ExecutionCancelled {
                    execution_id: execution_id.to_string(),
                });
                Ok(())
            }
            ExecutionStatus::Cancelled => Ok(()),
            other => Err(WaypointError::InvalidTransition {
                from: other.to_string(),
                to: ExecutionStatus::Cancelled.to_string(),
            }),
        }
    }

    /// A completed or cancelled execution stays closed even when one of its
    /// earlier checkpoints is still marked resumable. FAILED may be retried.
    fn ensure_open(&self, checkpoint: &CheckpointData) -> Result<()> {
        let live = self
            .registry
            .get(&checkpoint.execution_id)
            .map(|s| s.status);
        let persisted = self
            .checkpoints
            .get_latest_checkpoint(&checkpoint.execution_id)?
            .map(|c| c.state.status);
        if let Some(status) = live.into_iter().chain(persisted).find(|s| closes_execution(*s)) {
            warn!(
                execution_id = %checkpoint.execution_id,
                checkpoint_id = %checkpoint.checkpoint_id,
                status = %status,
                "Refusing to resume a closed execution"
            );
            return Err(WaypointError::NotResumable(checkpoint.checkpoint_id.clone()));
        }
        Ok(())
    }

    /// Latest published state of an execution known to this process.
    pub fn get_state(&self, execution_id: &str) -> Result<ExecutionState> {
        self.registry
            .get(execution_id)
            .ok_or_else(|| WaypointError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Drive, and turn an infrastructure error into a FAILED execution
    /// before handing it back.
    async fn run_to_rest(
        &self,
        mut state: ExecutionState,
        graph: &WorkflowGraph,
        control: &ExecutionControl,
        from_stage: usize,
    ) -> Result<ExecutionState> {
        match self.drive(&mut state, graph, control, from_stage).await {
            Ok(()) => Ok(state),
            Err(e) => {
                error!(execution_id = %state.execution_id, error = %e, "Workflow execution aborted");
                if state.fail(e.to_string()).is_ok() {
                    self.emit(WorkflowEvent::ExecutionFailed {
                        execution_id: state.execution_id.clone(),
                        error: e.to_string(),
                    });
                }
                self.registry.publish(&state);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut ExecutionState,
        graph: &WorkflowGraph,
        control: &ExecutionControl,
        from_stage: usize,
    ) -> Result<()> {
        let stages = graph.stages();
        let metadata = graph_metadata(graph)?;
        let interval = self.config.checkpoint_interval.max(1);
        let mut since_checkpoint = 0usize;

        for (idx, stage) in stages.iter().enumerate().skip(from_stage) {
            let resume_point = stage.step_ids.first().cloned().unwrap_or_default();

            if control.is_cancelled() {
                state.set_status(ExecutionStatus::Cancelled)?;
                self.registry.publish(state);
                if self.checkpoints_enabled {
                    self.write_checkpoint(state, &resume_point, Some(&metadata))?;
                }
                info!(execution_id = %state.execution_id, "Workflow execution cancelled");
                self.emit(WorkflowEvent::ExecutionCancelled {
                    execution_id: state.execution_id.clone(),
                });
                return Ok(());
            }

            if control.is_pause_requested() {
                // Resumable snapshot first, then rest in PAUSED.
                self.write_checkpoint(state, &resume_point, Some(&metadata))?;
                state.set_status(ExecutionStatus::Paused)?;
                self.registry.publish(state);
                info!(execution_id = %state.execution_id, step_id = %resume_point, "Workflow execution paused");
                self.emit(WorkflowEvent::ExecutionPaused {
                    execution_id: state.execution_id.clone(),
                });
                return Ok(());
            }

            let pending: Vec<&WorkflowStep> = stage
                .step_ids
                .iter()
                .filter(|id| !state.step(id).is_some_and(WorkflowStep::is_completed))
                .filter_map(|id| graph.step(id))
                .collect();
            if pending.is_empty() {
                debug!(execution_id = %state.execution_id, stage = idx, "Stage already completed, skipping");
                continue;
            }

            let (completed, failure) = self.run_stage(state, &pending, stage.parallel).await?;
            since_checkpoint += completed;

            if let Some((step_id, message)) = failure {
                state.fail(format!("Step '{}' failed: {}", step_id, message))?;
                self.registry.publish(state);
                if self.checkpoints_enabled {
                    self.write_checkpoint(state, &step_id, Some(&metadata))?;
                }
                error!(execution_id = %state.execution_id, step_id = %step_id, error = %message, "Workflow execution failed");
                self.emit(WorkflowEvent::ExecutionFailed {
                    execution_id: state.execution_id.clone(),
                    error: state.error.clone().unwrap_or_default(),
                });
                return Ok(());
            }

            if let Some(next) = stages.get(idx + 1) {
                if self.checkpoints_enabled && since_checkpoint >= interval {
                    let next_step = next.step_ids.first().cloned().unwrap_or_default();
                    self.write_checkpoint(state, &next_step, Some(&metadata))?;
                    since_checkpoint = 0;
                }
            }
        }

        state.set_status(ExecutionStatus::Completed)?;
        self.registry.publish(state);
        if self.checkpoints_enabled {
            if let Some(last) = state.steps.last().map(|s| s.id.clone()) {
                self.write_checkpoint(state, &last, Some(&metadata))?;
            }
        }
        info!(
            execution_id = %state.execution_id,
            completed_steps = state.completed_steps,
            total_tokens = state.total_tokens_used,
            total_cost = state.total_cost,
            "Workflow execution completed"
        );
        self.emit(WorkflowEvent::ExecutionCompleted {
            execution_id: state.execution_id.clone(),
            completed_steps: state.completed_steps,
            total_tokens_used: state.total_tokens_used,
            total_cost: state.total_cost,
        });
        Ok(())
    }

    /// Run the pending steps of one stage. Returns how many completed and the
    /// first failure, if any.
    async fn run_stage(
        &self,
        state: &mut ExecutionState,
        steps: &[&WorkflowStep],
        parallel: bool,
    ) -> Result<(usize, Option<(String, String)>)> {
        for step in steps {
            info!(execution_id = %state.execution_id, step_id = %step.id, step_name = %step.name, "Executing workflow step");
            state.start_step(&step.id)?;
        }
        self.registry.publish(state);

        let base_ctx = StepContext {
            execution_id: state.execution_id.clone(),
            workflow_id: state.workflow_id.clone(),
            user_prompt: state.user_prompt.clone(),
            goal: state.goal.clone(),
            attempt: 0,
            prior_outputs: state.aggregate_output.clone(),
        };

        let width = if parallel {
            self.config.max_parallel.max(1)
        } else {
            1
        };
        let mut runs = futures::stream::iter(
            steps
                .iter()
                .map(|step| self.attempt_step(step, base_ctx.clone())),
        )
        .buffer_unordered(width);

        let mut completed = 0;
        let mut failure = None;
        while let Some(run) = runs.next().await {
            state.retry_count += run.retries;
            match run.result {
                Ok(outcome) => {
                    state.complete_step(&run.step_id, outcome)?;
                    completed += 1;
                    if let Some(step) = state.step(&run.step_id) {
                        debug!(
                            execution_id = %state.execution_id,
                            step_id = %run.step_id,
                            tokens = step.tokens_used,
                            elapsed_ms = step.duration().num_milliseconds(),
                            "Workflow step completed"
                        );
                        self.emit(WorkflowEvent::StepCompleted {
                            execution_id: state.execution_id.clone(),
                            step_id: run.step_id.clone(),
                            tokens_used: step.tokens_used,
                            cost: step.cost,
                            duration_ms: step.duration().num_milliseconds(),
                        });
                    }
                }
                Err(message) => {
                    state.fail_step(&run.step_id, message.clone())?;
                    if failure.is_none() {
                        failure = Some((run.step_id.clone(), message));
                    }
                }
            }
            self.registry.publish(state);
        }

        Ok((completed, failure))
    }

    /// Run one step, retrying up to `max_retries` times.
    async fn attempt_step(&self, step: &WorkflowStep, mut ctx: StepContext) -> StepRun {
        let max_retries = self.config.max_retries;
        let mut attempt = 0;
        loop {
            ctx.attempt = attempt;
            self.emit(WorkflowEvent::StepStarted {
                execution_id: ctx.execution_id.clone(),
                step_id: step.id.clone(),
                attempt,
            });

            let started = Instant::now();
            match self.invoke(step, ctx.clone()).await {
                Ok(outcome) => {
                    return StepRun {
                        step_id: step.id.clone(),
                        retries: attempt,
                        result: Ok(outcome),
                    };
                }
                Err(e) => {
                    let will_retry = attempt < max_retries;
                    warn!(
                        execution_id = %ctx.execution_id,
                        step_id = %step.id,
                        attempt,
                        will_retry,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "Workflow step failed"
                    );
                    self.emit(WorkflowEvent::StepFailed {
                        execution_id: ctx.execution_id.clone(),
                        step_id: step.id.clone(),
                        error: e.to_string(),
                        will_retry,
                    });
                    if !will_retry {
                        return StepRun {
                            step_id: step.id.clone(),
                            retries: attempt,
                            result: Err(e.to_string()),
                        };
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn invoke(&self, step: &WorkflowStep, ctx: StepContext) -> Result<StepOutcome> {
        let timeout_secs = self.config.step_timeout_secs;
        if timeout_secs == 0 {
            return self.runner.run(step, ctx).await;
        }
        match tokio::time::timeout(Duration::from_secs(timeout_secs), self.runner.run(step, ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(WaypointError::AgentTimeout {
                target: step.id.clone(),
                timeout_secs,
            }),
        }
    }

    fn write_checkpoint(
        &self,
        state: &ExecutionState,
        step_id: &str,
        metadata: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CheckpointData> {
        let step_name = state
            .step(step_id)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let checkpoint = self.checkpoints.create_checkpoint(
            &state.execution_id,
            state,
            step_id,
            &step_name,
            metadata.cloned(),
        )?;
        self.emit(WorkflowEvent::CheckpointCreated {
            execution_id: state.execution_id.clone(),
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            step_id: step_id.to_string(),
            can_resume: checkpoint.can_resume,
        });
        Ok(checkpoint)
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

fn closes_execution(status: ExecutionStatus) -> bool {
    matches!(status, ExecutionStatus::Completed | ExecutionStatus::Cancelled)
}

/// Metadata embedding the graph definition so a checkpoint can be resumed
/// without the caller supplying steps again.
fn graph_metadata(graph: &WorkflowGraph) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut metadata = serde_json::Map::new();
    metadata.insert(
        METADATA_STEPS_KEY.to_string(),
        serde_json::to_value(graph.steps())?,
    );
    metadata.insert(
        METADATA_PARALLEL_KEY.to_string(),
        serde_json::to_value(graph.parallel_step_ids())?,
    );
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_test_utils::RecordingStepRunner;

    fn steps(n: usize) -> Vec<WorkflowStep> {
        (0..n)
            .map(|i| WorkflowStep::new(format!("step_{}", i), format!("Step {}", i)))
            .collect()
    }

    fn engine(runner: Arc<RecordingStepRunner>) -> WorkflowEngine {
        WorkflowEngine::new(
            runner,
            CheckpointStore::in_memory(),
            Arc::new(ExecutionRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_sequential_run_completes() {
        let runner = Arc::new(RecordingStepRunner::new());
        let engine = engine(runner.clone());

        let state = engine
            .start(WorkflowRequest::new("wf", "do it", steps(3)).with_execution_id("exec-1"))
            .await
            .unwrap();

        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.completed_steps, 3);
        assert_eq!(state.aggregate_output.len(), 3);
        assert_eq!(runner.calls(), vec!["step_0", "step_1", "step_2"]);
        assert!(state.invariants_hold());

        // Two interval checkpoints plus the terminal snapshot
        let cps = engine.checkpoints().list_checkpoints("exec-1", None).unwrap();
        assert_eq!(cps.len(), 3);
        assert_eq!(cps[0].step_id, "step_1");
        assert!(!cps[2].can_resume);
        assert_eq!(
            engine.get_state("exec-1").unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_checkpoint_interval() {
        let runner = Arc::new(RecordingStepRunner::new());
        let engine = engine(runner).with_config(EngineConfig {
            checkpoint_interval: 2,
            ..Default::default()
        });
        engine
            .start(WorkflowRequest::new("wf", "p", steps(5)).with_execution_id("exec-1"))
            .await
            .unwrap();
        let cps = engine.checkpoints().list_checkpoints("exec-1", None).unwrap();
        let points: Vec<&str> = cps.iter().map(|c| c.step_id.as_str()).collect();
        assert_eq!(points, vec!["step_2", "step_4", "step_4"]);
    }

    #[tokio::test]
    async fn test_checkpoints_disabled() {
        let runner = Arc::new(RecordingStepRunner::new());
        let engine = engine(runner).with_checkpoints_enabled(false);
        engine
            .start(WorkflowRequest::new("wf", "p", steps(3)).with_execution_id("exec-1"))
            .await
            .unwrap();
        assert!(engine
            .checkpoints()
            .list_checkpoints("exec-1", None)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_prior_outputs_passed_to_later_steps() {
        let runner = Arc::new(RecordingStepRunner::new());
        let engine = engine(runner.clone());
        engine
            .start(WorkflowRequest::new("wf", "p", steps(3)))
            .await
            .unwrap();
        let seen = runner.prior_output_keys("step_2");
        assert_eq!(seen, vec!["step_0", "step_1"]);
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let runner = Arc::new(RecordingStepRunner::new().fail_times("step_1", 1));
        let engine = engine(runner.clone());
        let state = engine
            .start(WorkflowRequest::new("wf", "p", steps(3)))
            .await
            .unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.retry_count, 1);
        assert_eq!(runner.calls(), vec!["step_0", "step_1", "step_1", "step_2"]);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_execution() {
        let runner = Arc::new(RecordingStepRunner::new().fail_times("step_1", 10));
        let engine = engine(runner.clone()).with_config(EngineConfig {
            max_retries: 1,
            ..Default::default()
        });
        let state = engine
            .start(WorkflowRequest::new("wf", "p", steps(3)).with_execution_id("exec-1"))
            .await
            .unwrap();

        assert_eq!(state.status, ExecutionStatus::Failed);
        assert!(state.error.as_deref().unwrap().contains("step_1"));
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.completed_steps, 1);
        assert!(!runner.calls().contains(&"step_2".to_string()));

        let last = engine
            .checkpoints()
            .get_latest_checkpoint("exec-1")
            .unwrap()
            .unwrap();
        assert!(!last.can_resume);
        assert_eq!(last.state.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_step_timeout_counts_as_failure() {
        let runner = Arc::new(
            RecordingStepRunner::new().with_delay("step_0", Duration::from_secs(5)),
        );
        let engine = engine(runner).with_config(EngineConfig {
            max_retries: 0,
            step_timeout_secs: 1,
            ..Default::default()
        });
        let state = engine
            .start(WorkflowRequest::new("wf", "p", steps(2)))
            .await
            .unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert!(state.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(state.completed_steps, 0);
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected_while_running() {
        let runner = Arc::new(RecordingStepRunner::new());
        let engine = engine(runner);
        let mut running = ExecutionState::new("exec-1", "wf", "p", steps(1));
        running.set_status(ExecutionStatus::Running).unwrap();
        engine.registry().publish(&running);

        let err = engine
            .start(WorkflowRequest::new("wf", "p", steps(1)).with_execution_id("exec-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::ExecutionActive(_)));
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let runner = Arc::new(RecordingStepRunner::new());
        let engine = engine(runner);
        assert!(matches!(
            engine.get_state("nope"),
            Err(WaypointError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            engine.pause("nope"),
            Err(WaypointError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            engine.resume_latest("nope").await,
            Err(WaypointError::CheckpointNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_workflow_completes() {
        let runner = Arc::new(RecordingStepRunner::new());
        let engine = engine(runner);
        let state = engine
            .start(WorkflowRequest::new("wf", "p", vec![]))
            .await
            .unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.total_steps, 0);
    }
}
