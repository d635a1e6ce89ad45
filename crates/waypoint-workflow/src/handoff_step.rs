use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::task::HandoffStatus;
use waypoint_core::traits::StepRunner;
use waypoint_core::types::{OutputMap, StepContext, StepKind, StepOutcome, WorkflowStep};

use crate::handoff::{HandoffCallbacks, HandoffProtocol, HandoffRequest};

/// Step runner that turns `handoff` steps into handoff sessions and passes
/// every other step to an inner runner.
pub struct HandoffStepRunner {
    protocol: Arc<HandoffProtocol>,
    inner: Arc<dyn StepRunner>,
    project_id: String,
    user_id: String,
}

impl HandoffStepRunner {
    pub fn new(protocol: Arc<HandoffProtocol>, inner: Arc<dyn StepRunner>) -> Self {
        Self {
            protocol,
            inner,
            project_id: String::new(),
            user_id: String::new(),
        }
    }

    /// Project and user forwarded to the macro agent.
    pub fn with_owner(mut self, project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self.user_id = user_id.into();
        self
    }

    /// Session id used for a step attempt. Each retry gets its own session.
    pub fn session_id(execution_id: &str, step_id: &str, attempt: u32) -> String {
        format!("{}:{}:{}", execution_id, step_id, attempt)
    }

    async fn run_handoff(&self, step: &WorkflowStep, ctx: StepContext) -> Result<StepOutcome> {
        let mut prompt = ctx.user_prompt.clone();
        if !step.description.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&step.description);
        }
        let request = HandoffRequest::new(&ctx.workflow_id, &self.project_id, &self.user_id, prompt)
            .with_session_id(Self::session_id(&ctx.execution_id, &step.id, ctx.attempt));

        let session = self
            .protocol
            .execute_macro_to_micro(request, HandoffCallbacks::new())
            .await?;

        if session.status != HandoffStatus::Completed {
            return Err(WaypointError::StepExecution {
                step_id: step.id.clone(),
                message: format!(
                    "handoff session {} {}: {}",
                    session.session_id,
                    session.status,
                    session.error.as_deref().unwrap_or("no detail")
                ),
            });
        }

        info!(
            step_id = %step.id,
            session_id = %session.session_id,
            tasks = session.total_tasks(),
            "Handoff step completed"
        );

        let mut output = OutputMap::new();
        output.insert("session_id".into(), serde_json::json!(session.session_id));
        output.insert("completed_tasks".into(), serde_json::json!(session.completed_tasks()));
        output.insert(
            "tasks".into(),
            serde_json::json!(session
                .tasks
                .iter()
                .map(|t| serde_json::json!({
                    "task_id": t.task_id(),
                    "title": t.task.title,
                    "output": t.output,
                    "files_created": t.files_created,
                    "files_modified": t.files_modified,
                }))
                .collect::<Vec<_>>()),
        );
        if let Some(plan) = &session.plan {
            output.insert("plan".into(), serde_json::json!(plan));
        }

        Ok(StepOutcome {
            output,
            provider: None,
            model: None,
            tokens_used: session.total_tokens_used(),
            cost: session.total_cost(),
        })
    }
}

impl StepRunner for HandoffStepRunner {
    fn run<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: StepContext,
    ) -> BoxFuture<'a, Result<StepOutcome>> {
        match step.kind {
            StepKind::Agent => self.inner.run(step, ctx),
            StepKind::Handoff => Box::pin(self.run_handoff(step, ctx)),
        }
    }
}
