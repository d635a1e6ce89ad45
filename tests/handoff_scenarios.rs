use std::sync::Arc;
use std::time::Duration;

use waypoint_core::budget::{BudgetCeiling, BudgetScope};
use waypoint_core::config::{BudgetConfig, HandoffConfig};
use waypoint_core::error::WaypointError;
use waypoint_core::event::{EventBus, WorkflowEvent};
use waypoint_core::task::{HandoffSession, HandoffStatus, TaskFailure, TaskStatus};
use waypoint_core::types::{ExecutionStatus, StepKind, WorkflowStep};
use waypoint_test_utils::{
    macro_output, RecordingStepRunner, ScriptedMacroAgent, ScriptedMicroAgent, TWO_TASK_OUTPUT,
};
use waypoint_workflow::{
    CheckpointStore, ExecutionRegistry, HandoffCallbacks, HandoffProtocol, HandoffRequest,
    HandoffStepRunner, InMemoryBudgetController, WorkflowEngine, WorkflowRequest,
};

fn request() -> HandoffRequest {
    HandoffRequest::new("wf-1", "proj-1", "user-1", "Build a greeter")
}

#[tokio::test]
async fn scenario_c_two_tasks_in_dependency_order() {
    let macro_agent = Arc::new(ScriptedMacroAgent::new(TWO_TASK_OUTPUT).with_usage(50, 0.2));
    let micro_agent = Arc::new(ScriptedMicroAgent::new());
    let budget = Arc::new(InMemoryBudgetController::new());
    let protocol = HandoffProtocol::new(macro_agent.clone(), micro_agent.clone(), budget.clone());

    let session = protocol
        .execute_macro_to_micro(request(), HandoffCallbacks::new())
        .await
        .unwrap();

    assert_eq!(session.status, HandoffStatus::Completed);
    assert_eq!(session.completed_tasks(), 2);
    assert_eq!(micro_agent.task_order(&["1.1", "1.2"]), vec!["1.1", "1.2"]);
    assert_eq!(
        session.specification.as_deref(),
        Some("A command-line greeter.")
    );

    let scaffold = session.task("1.1").unwrap();
    assert_eq!(scaffold.files_modified, vec!["Cargo.toml", "src/main.rs"]);
    assert!(scaffold.completed_at.is_some());

    // The second prompt lists the first task as done.
    let prompts = micro_agent.prompts();
    assert!(prompts[1].contains("- Scaffold crate (1.1)"));

    assert_eq!(session.total_tokens_used(), 50 + 2 * 100);
    let allocations = budget.allocations_for("wf-1").unwrap();
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].scope, BudgetScope::Workflow);
    assert_eq!(allocations[0].used_tokens, 250);

    let requests = macro_agent.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].project_id, "proj-1");
    assert_eq!(requests[0].mode, "plan");
}

#[tokio::test]
async fn scenario_d_macro_failure() {
    let micro_agent = Arc::new(ScriptedMicroAgent::new());
    let protocol = HandoffProtocol::new(
        Arc::new(ScriptedMacroAgent::failing("planner unavailable")),
        micro_agent.clone(),
        Arc::new(InMemoryBudgetController::new()),
    );

    let session = protocol
        .execute_macro_to_micro(request(), HandoffCallbacks::new())
        .await
        .unwrap();

    assert_eq!(session.status, HandoffStatus::Failed);
    assert_eq!(session.total_tasks(), 0);
    assert!(session.error.as_deref().unwrap().contains("planner unavailable"));
    assert_eq!(micro_agent.call_count(), 0);

    let stored = protocol.get_session(&session.session_id).unwrap();
    assert_eq!(stored.status, HandoffStatus::Failed);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let micro_agent = Arc::new(
        ScriptedMicroAgent::new().delay_when("Task 1.1:", Duration::from_millis(200)),
    );
    let protocol = Arc::new(HandoffProtocol::new(
        Arc::new(ScriptedMacroAgent::new(TWO_TASK_OUTPUT)),
        micro_agent.clone(),
        Arc::new(InMemoryBudgetController::new()),
    ));

    let run = protocol.execute_macro_to_micro(
        request().with_session_id("s1"),
        HandoffCallbacks::new(),
    );
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = protocol.cancel_session("s1").unwrap();
        let second = protocol.cancel_session("s1").unwrap();
        (first, second)
    };
    let (session, (first, second)) = tokio::join!(run, cancel);
    let session = session.unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(session.status, HandoffStatus::Cancelled);
    // The in-flight task finishes; the rest never start.
    assert_eq!(session.task("1.1").unwrap().status, TaskStatus::Completed);
    let skipped = session.task("1.2").unwrap();
    assert_eq!(skipped.status, TaskStatus::Skipped);
    assert_eq!(skipped.failure, Some(TaskFailure::Cancelled));
    assert_eq!(micro_agent.call_count(), 1);

    // Terminal sessions are left alone.
    assert!(!protocol.cancel_session("s1").unwrap());
    assert_eq!(
        protocol.get_session("s1").unwrap().status,
        HandoffStatus::Cancelled
    );
}

#[tokio::test]
async fn cancel_after_completion_changes_nothing() {
    let protocol = HandoffProtocol::new(
        Arc::new(ScriptedMacroAgent::new(TWO_TASK_OUTPUT)),
        Arc::new(ScriptedMicroAgent::new()),
        Arc::new(InMemoryBudgetController::new()),
    );
    protocol
        .execute_macro_to_micro(request().with_session_id("done"), HandoffCallbacks::new())
        .await
        .unwrap();

    assert!(!protocol.cancel_session("done").unwrap());
    assert!(!protocol.cancel_session("done").unwrap());
    assert_eq!(
        protocol.get_session("done").unwrap().status,
        HandoffStatus::Completed
    );
    assert!(matches!(
        protocol.cancel_session("missing"),
        Err(WaypointError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn budget_exhaustion_skips_remaining_tasks() {
    let budget = Arc::new(InMemoryBudgetController::with_config(BudgetConfig {
        workflow: Some(BudgetCeiling {
            max_tokens: Some(150),
            max_cost: None,
        }),
        ..Default::default()
    }));
    let micro_agent = Arc::new(ScriptedMicroAgent::new());
    let protocol = HandoffProtocol::new(
        Arc::new(ScriptedMacroAgent::new(macro_output(&[
            ("1", "First", ""),
            ("2", "Second", ""),
            ("3", "Third", ""),
        ]))),
        micro_agent.clone(),
        budget,
    );

    let session = protocol
        .execute_macro_to_micro(request(), HandoffCallbacks::new())
        .await
        .unwrap();

    assert_eq!(session.status, HandoffStatus::Failed);
    assert_eq!(session.completed_tasks(), 2);
    assert_eq!(micro_agent.call_count(), 2);
    let third = session.task("3").unwrap();
    assert_eq!(third.status, TaskStatus::Skipped);
    assert_eq!(third.failure, Some(TaskFailure::BudgetExhausted));
    assert!(session.error.as_deref().unwrap().starts_with("Budget exhausted"));
}

#[tokio::test]
async fn micro_failure_is_recorded_and_blocks_dependents() {
    let micro_agent = Arc::new(ScriptedMicroAgent::new().fail_when("Task 1.1:"));
    let protocol = HandoffProtocol::new(
        Arc::new(ScriptedMacroAgent::new(TWO_TASK_OUTPUT)),
        micro_agent.clone(),
        Arc::new(InMemoryBudgetController::new()),
    )
    .with_config(HandoffConfig {
        micro_timeout_secs: 0,
        ..Default::default()
    });

    let session = protocol
        .execute_macro_to_micro(request(), HandoffCallbacks::new())
        .await
        .unwrap();

    assert_eq!(session.status, HandoffStatus::Failed);
    let first = session.task("1.1").unwrap();
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(first.failure, Some(TaskFailure::AgentError));
    let second = session.task("1.2").unwrap();
    assert_eq!(second.status, TaskStatus::Skipped);
    assert_eq!(second.failure, Some(TaskFailure::Blocked));
    assert!(second.error.as_deref().unwrap().contains("unmet dependency"));
    assert_eq!(micro_agent.call_count(), 1);
}

fn run_two_tasks(micro_agent: Arc<ScriptedMicroAgent>, config: HandoffConfig) -> HandoffProtocol {
    HandoffProtocol::new(
        Arc::new(ScriptedMacroAgent::new(TWO_TASK_OUTPUT)),
        micro_agent,
        Arc::new(InMemoryBudgetController::new()),
    )
    .with_config(config)
}

fn assert_dependent_blocked(session: &HandoffSession) {
    assert_eq!(session.status, HandoffStatus::Failed);
    let second = session.task("1.2").unwrap();
    assert_eq!(second.status, TaskStatus::Skipped);
    assert_eq!(second.failure, Some(TaskFailure::Blocked));
    assert!(second.error.as_deref().unwrap().contains("unmet dependency"));
}

#[tokio::test]
async fn micro_adapter_error_is_recorded_on_task() {
    let micro_agent = Arc::new(ScriptedMicroAgent::new().error_when("Task 1.1:"));
    let protocol = run_two_tasks(micro_agent.clone(), HandoffConfig::default());

    let session = protocol
        .execute_macro_to_micro(request(), HandoffCallbacks::new())
        .await
        .unwrap();

    let first = session.task("1.1").unwrap();
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(first.failure, Some(TaskFailure::AgentError));
    assert!(first.error.as_deref().unwrap().contains("scripted adapter error"));
    assert_dependent_blocked(&session);
    assert_eq!(micro_agent.call_count(), 1);
}

#[tokio::test]
async fn micro_timeout_is_classified() {
    let micro_agent =
        Arc::new(ScriptedMicroAgent::new().delay_when("Task 1.1:", Duration::from_secs(3)));
    let protocol = run_two_tasks(
        micro_agent.clone(),
        HandoffConfig {
            micro_timeout_secs: 1,
            ..Default::default()
        },
    );

    let session = protocol
        .execute_macro_to_micro(request(), HandoffCallbacks::new())
        .await
        .unwrap();

    let first = session.task("1.1").unwrap();
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(first.failure, Some(TaskFailure::Timeout));
    assert!(first.error.as_deref().unwrap().contains("timed out"));
    assert_dependent_blocked(&session);
}

#[tokio::test]
async fn invalid_micro_usage_fails_task_not_session_call() {
    let micro_agent = Arc::new(ScriptedMicroAgent::new().with_usage(10, -0.01));
    let budget = Arc::new(InMemoryBudgetController::new());
    let protocol = HandoffProtocol::new(
        Arc::new(ScriptedMacroAgent::new(TWO_TASK_OUTPUT)),
        micro_agent.clone(),
        budget.clone(),
    );

    let session = protocol
        .execute_macro_to_micro(request().with_session_id("bad-cost"), HandoffCallbacks::new())
        .await
        .unwrap();

    let first = session.task("1.1").unwrap();
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(first.failure, Some(TaskFailure::AgentError));
    assert_dependent_blocked(&session);

    let stored = protocol.get_session("bad-cost").unwrap();
    assert_eq!(stored, session);
    assert!(stored
        .tasks
        .iter()
        .all(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped)));
    assert_eq!(budget.allocations_for("wf-1").unwrap()[0].used_tokens, 0);
}

#[tokio::test]
async fn cleanup_reports_adapter_failures() {
    let macro_agent = Arc::new(ScriptedMacroAgent::new(TWO_TASK_OUTPUT));
    let micro_agent = Arc::new(ScriptedMicroAgent::new().with_cleanup_error("socket busy"));
    let protocol = HandoffProtocol::new(
        macro_agent.clone(),
        micro_agent.clone(),
        Arc::new(InMemoryBudgetController::new()),
    );

    let err = protocol.cleanup().await.unwrap_err();
    assert!(matches!(err, WaypointError::Cleanup(_)));
    assert!(err.to_string().contains("socket busy"));
    assert_eq!(macro_agent.cleanup_calls(), 1);
    assert_eq!(micro_agent.cleanup_calls(), 1);
}

#[tokio::test]
async fn handoff_step_inside_workflow() {
    let bus = Arc::new(EventBus::new(256));
    let mut events = bus.subscribe();

    let protocol = Arc::new(
        HandoffProtocol::new(
            Arc::new(ScriptedMacroAgent::new(TWO_TASK_OUTPUT)),
            Arc::new(ScriptedMicroAgent::new()),
            Arc::new(InMemoryBudgetController::new()),
        )
        .with_event_bus(bus.clone()),
    );
    let inner = Arc::new(RecordingStepRunner::new());
    let runner = Arc::new(
        HandoffStepRunner::new(protocol.clone(), inner.clone()).with_owner("proj-1", "user-1"),
    );
    let engine = WorkflowEngine::new(
        runner,
        CheckpointStore::in_memory(),
        Arc::new(ExecutionRegistry::new()),
    )
    .with_event_bus(bus.clone());

    let steps = vec![
        WorkflowStep::new("step_0", "Design"),
        WorkflowStep::new("step_1", "Implement")
            .with_kind(StepKind::Handoff)
            .with_description("Keep it small."),
        WorkflowStep::new("step_2", "Review"),
    ];
    let state = engine
        .start(WorkflowRequest::new("wf-h", "Build a greeter", steps).with_execution_id("exec-h"))
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(inner.calls(), vec!["step_0", "step_2"]);
    assert_eq!(state.aggregate_output["step_1"]["completed_tasks"], 2);
    assert_eq!(inner.prior_output_keys("step_2"), vec!["step_0", "step_1"]);

    let session = protocol
        .get_session(&HandoffStepRunner::session_id("exec-h", "step_1", 0))
        .unwrap();
    assert_eq!(session.status, HandoffStatus::Completed);
    assert_eq!(session.workflow_id, "wf-h");

    let mut saw_handoff_finished = false;
    let mut saw_execution_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            WorkflowEvent::HandoffFinished { status, .. } => {
                assert_eq!(status, HandoffStatus::Completed);
                saw_handoff_finished = true;
            }
            WorkflowEvent::ExecutionCompleted { .. } => saw_execution_completed = true,
            _ => {}
        }
    }
    assert!(saw_handoff_finished);
    assert!(saw_execution_completed);
}
