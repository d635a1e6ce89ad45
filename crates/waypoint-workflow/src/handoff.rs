//! Macro-to-micro handoff: one planning-agent call, then its tasks run one
//! at a time on the execution agent in dependency order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waypoint_core::agent::{MacroAgentRequest, MicroAgentRequest, MicroAgentResult};
use waypoint_core::budget::BudgetScope;
use waypoint_core::config::HandoffConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{EventBus, WorkflowEvent};
use waypoint_core::task::{
    HandoffSession, HandoffStatus, ParsedTask, TaskExecution, TaskFailure, TaskStatus,
};
use waypoint_core::traits::{BudgetController, MacroAgent, MicroAgent};
use waypoint_core::types::new_id;

use crate::parser::TaskParser;

/// Input to one handoff.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    /// Generated when absent.
    pub session_id: Option<String>,
    pub workflow_id: String,
    pub project_id: String,
    pub user_id: String,
    pub prompt: String,
}

impl HandoffRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            session_id: None,
            workflow_id: workflow_id.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            prompt: prompt.into(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

type ProgressFn = Box<dyn FnMut(f64, &str) + Send>;
type TaskCompleteFn = Box<dyn FnMut(&TaskExecution) + Send>;

/// Optional observers, invoked synchronously from the session's own task.
#[derive(Default)]
pub struct HandoffCallbacks {
    on_progress: Option<ProgressFn>,
    on_task_complete: Option<TaskCompleteFn>,
}

impl HandoffCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives the progress percentage and a message.
    pub fn on_progress(mut self, f: impl FnMut(f64, &str) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Receives every task as it reaches a terminal status.
    pub fn on_task_complete(mut self, f: impl FnMut(&TaskExecution) + Send + 'static) -> Self {
        self.on_task_complete = Some(Box::new(f));
        self
    }

    fn progress(&mut self, progress: f64, message: &str) {
        if let Some(f) = self.on_progress.as_mut() {
            f(progress, message);
        }
    }

    fn task_complete(&mut self, task: &TaskExecution) {
        if let Some(f) = self.on_task_complete.as_mut() {
            f(task);
        }
    }
}

struct Entry {
    session: HandoffSession,
    cancel: CancellationToken,
}

/// Runs handoff sessions and keeps a copy of each for inspection.
pub struct HandoffProtocol {
    macro_agent: Arc<dyn MacroAgent>,
    micro_agent: Arc<dyn MicroAgent>,
    budget: Arc<dyn BudgetController>,
    parser: TaskParser,
    config: HandoffConfig,
    sessions: Mutex<HashMap<String, Entry>>,
    event_bus: Option<Arc<EventBus>>,
}

impl HandoffProtocol {
    pub fn new(
        macro_agent: Arc<dyn MacroAgent>,
        micro_agent: Arc<dyn MicroAgent>,
        budget: Arc<dyn BudgetController>,
    ) -> Self {
        Self {
            macro_agent,
            micro_agent,
            budget,
            parser: TaskParser::new(),
            config: HandoffConfig::default(),
            sessions: Mutex::new(HashMap::new()),
            event_bus: None,
        }
    }

    pub fn with_config(mut self, config: HandoffConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the macro agent, then every eligible task, and return the
    /// terminal session.
    ///
    /// Macro and task failures end up on the returned session. `Err` is
    /// reserved for infrastructure faults such as the budget controller
    /// failing; the stored session is marked FAILED in that case too.
    pub async fn execute_macro_to_micro(
        &self,
        request: HandoffRequest,
        mut callbacks: HandoffCallbacks,
    ) -> Result<HandoffSession> {
        let session_id = request.session_id.clone().unwrap_or_else(new_id);
        let mut session = HandoffSession::new(
            &session_id,
            &request.workflow_id,
            &request.project_id,
            &request.user_id,
        );
        let cancel = self.register(&session)?;

        info!(
            session_id = %session_id,
            workflow_id = %request.workflow_id,
            "Starting handoff session"
        );
        self.emit(WorkflowEvent::HandoffStarted {
            session_id: session_id.clone(),
            workflow_id: request.workflow_id.clone(),
        });

        let outcome = self
            .run_session(&request, &mut session, &mut callbacks, &cancel)
            .await;
        if let Err(e) = &outcome {
            error!(session_id = %session_id, error = %e, "Handoff session aborted");
            session.fail(format!("Handoff aborted: {}", e));
        }
        self.publish(&session);

        info!(
            session_id = %session_id,
            status = %session.status,
            completed = session.completed_tasks(),
            total = session.total_tasks(),
            tokens = session.total_tokens_used(),
            "Handoff session finished"
        );
        self.emit(WorkflowEvent::HandoffFinished {
            session_id: session_id.clone(),
            workflow_id: request.workflow_id.clone(),
            status: session.status,
            completed_tasks: session.completed_tasks(),
            total_tasks: session.total_tasks(),
        });

        let message = match session.status {
            HandoffStatus::Completed => "Handoff completed".to_string(),
            status => format!(
                "Handoff {}: {}",
                status,
                session.error.as_deref().unwrap_or("no further detail")
            ),
        };
        callbacks.progress(100.0, &message);
        outcome?;
        Ok(session)
    }

    async fn run_session(
        &self,
        request: &HandoffRequest,
        session: &mut HandoffSession,
        callbacks: &mut HandoffCallbacks,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let allocation = self
            .budget
            .create_allocation(BudgetScope::Workflow, &request.workflow_id)
            .await?;
        let allocation_id = allocation.allocation_id;
        session.allocation_id = Some(allocation_id.clone());
        session.status = HandoffStatus::InProgress;
        session.touch();
        self.publish(session);

        let macro_request = MacroAgentRequest {
            project_id: request.project_id.clone(),
            user_id: request.user_id.clone(),
            prompt: request.prompt.clone(),
            mode: self.config.macro_mode.clone(),
            context: HashMap::from([
                ("workflow_id".to_string(), serde_json::json!(request.workflow_id)),
                ("session_id".to_string(), serde_json::json!(session.session_id)),
            ]),
        };
        let result = match self.macro_agent.execute(macro_request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "Macro agent call failed");
                session.fail(e.to_string());
                return Ok(());
            }
        };
        if let Err(e) = self
            .budget
            .record_usage(&allocation_id, result.tokens_used, result.cost)
            .await
        {
            warn!(session_id = %session.session_id, error = %e, "Macro agent usage rejected");
            session.fail(format!("Macro agent usage rejected: {}", e));
            return Ok(());
        }
        session.macro_tokens_used = result.tokens_used;
        session.macro_cost = result.cost;

        if !result.success {
            let reason = result
                .error
                .unwrap_or_else(|| "macro agent reported failure".to_string());
            warn!(session_id = %session.session_id, reason = %reason, "Macro agent reported failure");
            session.fail(format!("Macro agent failed: {}", reason));
            return Ok(());
        }

        let output = self.parser.parse_output(&result.output);
        session.specification = output.specification;
        session.plan = output.plan;
        if output.tasks.is_empty() {
            session.fail("Macro agent output contained no recognizable tasks");
            return Ok(());
        }
        session.tasks = output.tasks.into_iter().map(TaskExecution::new).collect();
        session.touch();
        self.publish(session);
        info!(
            session_id = %session.session_id,
            tasks = session.total_tasks(),
            "Planned handoff tasks"
        );
        callbacks.progress(0.0, &format!("Planned {} tasks", session.total_tasks()));

        loop {
            if !session.tasks.iter().any(|t| t.status == TaskStatus::Pending) {
                break;
            }
            if cancel.is_cancelled() {
                info!(session_id = %session.session_id, "Handoff session cancelled");
                self.skip_pending(session, callbacks, TaskFailure::Cancelled, |_| {
                    "Session cancelled".to_string()
                });
                session.status = HandoffStatus::Cancelled;
                session.touch();
                return Ok(());
            }
            let allocation = self.budget.get_allocation(&allocation_id).await?;
            if allocation.is_exhausted() {
                warn!(
                    session_id = %session.session_id,
                    used_tokens = allocation.used_tokens,
                    used_cost = allocation.used_cost,
                    "Budget exhausted, skipping remaining tasks"
                );
                self.skip_pending(session, callbacks, TaskFailure::BudgetExhausted, |_| {
                    "Budget exhausted".to_string()
                });
                session.fail(format!(
                    "Budget exhausted after {} of {} tasks ({} tokens, ${:.4} used)",
                    session.completed_tasks(),
                    session.total_tasks(),
                    allocation.used_tokens,
                    allocation.used_cost
                ));
                return Ok(());
            }
            let Some(index) = next_eligible(&session.tasks) else {
                break;
            };
            self.run_task(session, index, &allocation_id, callbacks)
                .await?;
        }

        let tasks_snapshot = session.tasks.clone();
        self.skip_pending(session, callbacks, TaskFailure::Blocked, |task| {
            blocked_reason(task, &tasks_snapshot)
        });

        if session.completed_tasks() == session.total_tasks() {
            session.status = HandoffStatus::Completed;
            session.touch();
        } else {
            session.fail(summary(session));
        }
        Ok(())
    }

    async fn run_task(
        &self,
        session: &mut HandoffSession,
        index: usize,
        allocation_id: &str,
        callbacks: &mut HandoffCallbacks,
    ) -> Result<()> {
        let prompt = build_task_prompt(session, &session.tasks[index].task);
        let task_id = session.tasks[index].task.task_id.clone();
        let request = MicroAgentRequest {
            prompt,
            file_targets: session.tasks[index].task.file_targets.clone(),
        };

        {
            let task = &mut session.tasks[index];
            task.status = TaskStatus::Running;
            task.started_at = Some(chrono::Utc::now());
        }
        session.touch();
        self.publish(session);
        info!(session_id = %session.session_id, task_id = %task_id, "Executing handoff task");
        self.emit(WorkflowEvent::TaskStarted {
            session_id: session.session_id.clone(),
            workflow_id: session.workflow_id.clone(),
            task_id: task_id.clone(),
        });

        let outcome = self.call_micro(&task_id, request).await;
        let task = &mut session.tasks[index];
        match outcome {
            Ok(result) => {
                let recorded = self
                    .budget
                    .record_usage(allocation_id, result.tokens_used, result.cost)
                    .await;
                task.files_created = result.files_created;
                task.files_modified = result.files_modified;
                task.output = Some(result.output);
                match recorded {
                    Err(e) => {
                        task.fail(
                            TaskFailure::AgentError,
                            format!("Micro agent usage rejected: {}", e),
                        );
                    }
                    Ok(_) => {
                        task.tokens_used = result.tokens_used;
                        task.cost = result.cost;
                        if result.success {
                            task.status = TaskStatus::Completed;
                            task.completed_at = Some(chrono::Utc::now());
                        } else {
                            let reason = result
                                .error
                                .unwrap_or_else(|| "micro agent reported failure".to_string());
                            task.fail(TaskFailure::AgentError, reason);
                        }
                    }
                }
            }
            Err(e @ WaypointError::AgentTimeout { .. }) => {
                task.fail(TaskFailure::Timeout, e.to_string());
            }
            Err(e) => {
                task.fail(TaskFailure::AgentError, e.to_string());
            }
        }

        if let Some(reason) = &task.error {
            warn!(
                session_id = %session.session_id,
                task_id = %task_id,
                error = %reason,
                "Handoff task failed"
            );
        }
        self.finish_task(session, index, callbacks);
        Ok(())
    }

    /// Call the micro agent, bounded by `micro_timeout_secs` (0 = unbounded).
    async fn call_micro(&self, task_id: &str, request: MicroAgentRequest) -> Result<MicroAgentResult> {
        let timeout_secs = self.config.micro_timeout_secs;
        if timeout_secs == 0 {
            return self.micro_agent.execute(request).await;
        }
        match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.micro_agent.execute(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WaypointError::AgentTimeout {
                target: format!("task {}", task_id),
                timeout_secs,
            }),
        }
    }

    /// Mark every PENDING task SKIPPED and report each one.
    fn skip_pending(
        &self,
        session: &mut HandoffSession,
        callbacks: &mut HandoffCallbacks,
        failure: TaskFailure,
        reason: impl Fn(&TaskExecution) -> String,
    ) {
        let pending: Vec<usize> = session
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        for index in pending {
            let why = reason(&session.tasks[index]);
            debug!(
                session_id = %session.session_id,
                task_id = %session.tasks[index].task_id(),
                reason = %why,
                "Skipping handoff task"
            );
            session.tasks[index].skip(failure, why);
            self.finish_task(session, index, callbacks);
        }
    }

    fn finish_task(
        &self,
        session: &mut HandoffSession,
        index: usize,
        callbacks: &mut HandoffCallbacks,
    ) {
        session.touch();
        self.publish(session);
        let task = &session.tasks[index];
        self.emit(WorkflowEvent::TaskFinished {
            session_id: session.session_id.clone(),
            workflow_id: session.workflow_id.clone(),
            task_id: task.task_id().to_string(),
            status: task.status,
        });
        callbacks.task_complete(task);
        let message = format!(
            "Task {} {} ({}/{} completed)",
            task.task_id(),
            status_word(task.status),
            session.completed_tasks(),
            session.total_tasks()
        );
        callbacks.progress(session.progress(), &message);
    }

    /// Latest copy of a session.
    pub fn get_session(&self, session_id: &str) -> Result<HandoffSession> {
        self.lock()
            .get(session_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| WaypointError::SessionNotFound(session_id.to_string()))
    }

    /// All known sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<HandoffSession> {
        let mut sessions: Vec<HandoffSession> =
            self.lock().values().map(|e| e.session.clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Request cancellation. Observed before the next task starts.
    ///
    /// Returns whether this call requested it: a terminal session, or one
    /// already asked to cancel, is left alone and reports `false`.
    pub fn cancel_session(&self, session_id: &str) -> Result<bool> {
        let entries = self.lock();
        let entry = entries
            .get(session_id)
            .ok_or_else(|| WaypointError::SessionNotFound(session_id.to_string()))?;
        if entry.session.status.is_terminal() || entry.cancel.is_cancelled() {
            debug!(session_id, status = %entry.session.status, "Cancel ignored");
            return Ok(false);
        }
        entry.cancel.cancel();
        info!(session_id, "Handoff cancellation requested");
        Ok(true)
    }

    /// Drop sessions that reached a terminal status more than `retention`
    /// ago and release their budget allocations. Returns how many were
    /// dropped.
    pub async fn purge_terminal(&self, retention: chrono::Duration) -> usize {
        let cutoff = chrono::Utc::now() - retention;
        let purged: Vec<HandoffSession> = {
            let mut entries = self.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.session.status.is_terminal() && e.session.updated_at <= cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .iter()
                .filter_map(|id| entries.remove(id))
                .map(|e| e.session)
                .collect()
        };

        for session in &purged {
            let Some(allocation_id) = &session.allocation_id else {
                continue;
            };
            if let Err(e) = self.budget.release_allocation(allocation_id).await {
                warn!(
                    session_id = %session.session_id,
                    allocation_id = %allocation_id,
                    error = %e,
                    "Failed to release budget allocation"
                );
            }
        }
        if !purged.is_empty() {
            debug!(purged = purged.len(), "Purged terminal handoff sessions");
        }
        purged.len()
    }

    /// Release both adapters. Both are always attempted; failures are
    /// logged and reported together.
    pub async fn cleanup(&self) -> Result<()> {
        let mut failures = Vec::new();
        if let Err(e) = self.macro_agent.cleanup().await {
            error!(error = %e, "Macro agent cleanup failed");
            failures.push(format!("macro agent: {}", e));
        }
        if let Err(e) = self.micro_agent.cleanup().await {
            error!(error = %e, "Micro agent cleanup failed");
            failures.push(format!("micro agent: {}", e));
        }
        if failures.is_empty() {
            debug!("Handoff adapters released");
            Ok(())
        } else {
            Err(WaypointError::Cleanup(failures.join("; ")))
        }
    }

    fn register(&self, session: &HandoffSession) -> Result<CancellationToken> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&session.session_id) {
            if !existing.session.status.is_terminal() {
                return Err(WaypointError::InvalidTransition {
                    from: existing.session.status.to_string(),
                    to: HandoffStatus::Pending.to_string(),
                });
            }
        }
        let cancel = CancellationToken::new();
        entries.insert(
            session.session_id.clone(),
            Entry {
                session: session.clone(),
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    fn publish(&self, session: &HandoffSession) {
        if let Some(entry) = self.lock().get_mut(&session.session_id) {
            entry.session = session.clone();
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Index of the first PENDING task whose dependencies have all completed.
fn next_eligible(tasks: &[TaskExecution]) -> Option<usize> {
    tasks.iter().position(|t| {
        t.status == TaskStatus::Pending
            && t
                .task
                .dependencies
                .iter()
                .all(|dep| dependency_met(dep, t.task_id(), tasks))
    })
}

fn dependency_met(reference: &str, own_id: &str, tasks: &[TaskExecution]) -> bool {
    tasks.iter().any(|other| {
        other.task_id() != own_id
            && other.status == TaskStatus::Completed
            && other.task.matches_reference(reference)
    })
}

fn blocked_reason(task: &TaskExecution, tasks: &[TaskExecution]) -> String {
    let unmet = task
        .task
        .dependencies
        .iter()
        .find(|dep| !dependency_met(dep, task.task_id(), tasks));
    match unmet {
        Some(dep)
            if !tasks
                .iter()
                .any(|o| o.task_id() != task.task_id() && o.task.matches_reference(dep)) =>
        {
            warn!(task_id = %task.task_id(), dependency = %dep, "Unknown task dependency");
            format!("Blocked by unknown dependency '{}'", dep)
        }
        Some(dep) => format!("Blocked by unmet dependency '{}'", dep),
        None => "Blocked".to_string(),
    }
}

fn summary(session: &HandoffSession) -> String {
    let ids = |status: TaskStatus| -> Vec<&str> {
        session
            .tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.task_id())
            .collect()
    };
    let mut summary = format!(
        "{} of {} tasks completed",
        session.completed_tasks(),
        session.total_tasks()
    );
    let failed = ids(TaskStatus::Failed);
    if !failed.is_empty() {
        summary.push_str(&format!("; failed: {}", failed.join(", ")));
    }
    let skipped = ids(TaskStatus::Skipped);
    if !skipped.is_empty() {
        summary.push_str(&format!("; skipped: {}", skipped.join(", ")));
    }
    summary
}

fn status_word(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Skipped => "skipped",
    }
}

/// Prompt for one task, with the plan context in front of it.
fn build_task_prompt(session: &HandoffSession, task: &ParsedTask) -> String {
    let mut prompt = String::new();

    if let Some(spec) = &session.specification {
        prompt.push_str("## Specification\n\n");
        prompt.push_str(spec);
        prompt.push_str("\n\n");
    }
    if let Some(plan) = &session.plan {
        prompt.push_str("## Plan\n\n");
        prompt.push_str(plan);
        prompt.push_str("\n\n");
    }
    let done: Vec<&TaskExecution> = session
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .collect();
    if !done.is_empty() {
        prompt.push_str("## Completed Tasks\n\n");
        for t in done {
            prompt.push_str(&format!("- {} ({})\n", t.task.title, t.task_id()));
        }
        prompt.push('\n');
    }
    if !prompt.is_empty() {
        prompt.push_str("---\n\n");
    }

    prompt.push_str(&format!("## Task {}: {}\n\n", task.task_id, task.title));
    if !task.description.is_empty() {
        prompt.push_str(&task.description);
        prompt.push_str("\n\n");
    }
    if !task.file_targets.is_empty() {
        prompt.push_str(&format!("**Files**: {}\n", task.file_targets.join(", ")));
    }
    prompt
}
