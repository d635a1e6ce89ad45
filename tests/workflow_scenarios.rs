use std::sync::Arc;
use std::time::Duration;

use waypoint_core::config::EngineConfig;
use waypoint_core::error::WaypointError;
use waypoint_core::types::{ExecutionStatus, StepStatus, WorkflowStep};
use waypoint_test_utils::{steps, step_ids, temp_db, RecordingStepRunner};
use waypoint_workflow::{
    build_edges, CheckpointStore, ExecutionRegistry, SqliteCheckpointStore, WorkflowEngine,
    WorkflowRequest,
};

fn engine(runner: Arc<RecordingStepRunner>, store: CheckpointStore) -> WorkflowEngine {
    WorkflowEngine::new(runner, store, Arc::new(ExecutionRegistry::new()))
}

fn sqlite_store(path: &std::path::Path) -> CheckpointStore {
    CheckpointStore::new(Arc::new(SqliteCheckpointStore::open(path).unwrap()))
}

#[test]
fn scenario_a_sequential_edges() {
    let ids = step_ids(5);
    let edges = build_edges(&ids, &[]);
    assert_eq!(edges.len(), 5);
    assert!(edges.iter().any(|e| e.connects("step_3", "step_4")));
    assert!(edges.iter().any(|e| e.connects("step_4", "END")));
}

#[test]
fn scenario_b_fork_join_edges() {
    let ids = step_ids(5);
    let parallel: Vec<String> = vec!["step_1".into(), "step_2".into(), "step_3".into()];
    let edges = build_edges(&ids, &parallel);
    for p in &parallel {
        assert!(edges.iter().any(|e| e.connects("step_0", p)), "fan-out to {}", p);
        assert!(edges.iter().any(|e| e.connects(p, "step_4")), "fan-in from {}", p);
    }
    assert!(edges.iter().any(|e| e.connects("step_4", "END")));
    assert!(!edges.iter().any(|e| e.connects("step_1", "step_2")));
}

#[tokio::test]
async fn scenario_b_parallel_block_runs_concurrently() {
    let runner = Arc::new(
        RecordingStepRunner::new()
            .with_delay("step_1", Duration::from_millis(50))
            .with_delay("step_2", Duration::from_millis(50))
            .with_delay("step_3", Duration::from_millis(50)),
    );
    let engine = engine(runner.clone(), CheckpointStore::in_memory());
    let request = WorkflowRequest::new("wf-b", "go", steps(5)).with_parallel(vec![
        "step_1".into(),
        "step_2".into(),
        "step_3".into(),
    ]);

    let state = engine.start(request).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.completed_steps, 5);
    assert_eq!(runner.max_in_flight(), 3);

    let calls = runner.calls();
    assert_eq!(calls.first().map(String::as_str), Some("step_0"));
    assert_eq!(calls.last().map(String::as_str), Some("step_4"));
    assert_eq!(
        runner.prior_output_keys("step_4"),
        vec!["step_0", "step_1", "step_2", "step_3"]
    );
}

#[tokio::test]
async fn parallel_block_respects_max_parallel() {
    let runner = Arc::new(
        RecordingStepRunner::new()
            .with_delay("step_1", Duration::from_millis(30))
            .with_delay("step_2", Duration::from_millis(30))
            .with_delay("step_3", Duration::from_millis(30)),
    );
    let engine = engine(runner.clone(), CheckpointStore::in_memory()).with_config(EngineConfig {
        max_parallel: 2,
        ..Default::default()
    });
    let request = WorkflowRequest::new("wf", "go", steps(5)).with_parallel(vec![
        "step_1".into(),
        "step_2".into(),
        "step_3".into(),
    ]);

    engine.start(request).await.unwrap();
    assert_eq!(runner.max_in_flight(), 2);
}

#[tokio::test]
async fn sequential_steps_never_overlap() {
    let runner = Arc::new(
        RecordingStepRunner::new()
            .with_delay("step_0", Duration::from_millis(10))
            .with_delay("step_1", Duration::from_millis(10)),
    );
    let engine = engine(runner.clone(), CheckpointStore::in_memory());
    engine
        .start(WorkflowRequest::new("wf", "go", steps(3)))
        .await
        .unwrap();
    assert_eq!(runner.max_in_flight(), 1);
    assert_eq!(runner.calls(), vec!["step_0", "step_1", "step_2"]);
}

#[tokio::test]
async fn scenario_e_resume_after_restart() {
    let (_dir, db) = temp_db();
    let registry = Arc::new(ExecutionRegistry::new());

    // First process: pauses once step_1 has run, leaving a checkpoint at step_2.
    let pause_registry = registry.clone();
    let first_runner = Arc::new(RecordingStepRunner::new().with_hook("step_1", move |_| {
        if let Some(control) = pause_registry.control("exec-e") {
            control.request_pause();
        }
    }));
    let first = WorkflowEngine::new(first_runner.clone(), sqlite_store(&db), registry);
    let paused = first
        .start(WorkflowRequest::new("wf-e", "go", steps(5)).with_execution_id("exec-e"))
        .await
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(first_runner.calls(), vec!["step_0", "step_1"]);
    drop(first);

    // Second process: fresh registry, same database.
    let store = sqlite_store(&db);
    let checkpoint = store.get_latest_resumable("exec-e").unwrap().unwrap();
    assert_eq!(checkpoint.step_id, "step_2");
    let snapshot_outputs = checkpoint.state.aggregate_output.clone();

    let second_runner = Arc::new(RecordingStepRunner::new());
    let second = engine(second_runner.clone(), store);
    let state = second
        .resume_from_checkpoint(&checkpoint.checkpoint_id, None)
        .await
        .unwrap();

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(second_runner.calls(), vec!["step_2", "step_3", "step_4"]);
    assert_eq!(state.completed_steps, 5);
    assert_eq!(state.aggregate_output["step_0"], snapshot_outputs["step_0"]);
    assert_eq!(state.aggregate_output["step_1"], snapshot_outputs["step_1"]);
    assert_eq!(
        second_runner.prior_output_keys("step_2"),
        vec!["step_0", "step_1"]
    );
    assert!(state.invariants_hold());
}

#[tokio::test]
async fn resume_latest_after_failure_reruns_failed_step() {
    let runner = Arc::new(RecordingStepRunner::new().fail_times("step_2", 10));
    let store = CheckpointStore::in_memory();
    let engine = WorkflowEngine::new(runner.clone(), store.clone(), Arc::new(ExecutionRegistry::new()))
        .with_config(EngineConfig {
            max_retries: 0,
            ..Default::default()
        });
    let failed = engine
        .start(WorkflowRequest::new("wf", "go", steps(4)).with_execution_id("exec-f"))
        .await
        .unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("step_2"));
    assert_eq!(failed.step("step_2").unwrap().status, StepStatus::Failed);

    let latest = store.get_latest_checkpoint("exec-f").unwrap().unwrap();
    assert!(!latest.can_resume);

    let retry_runner = Arc::new(RecordingStepRunner::new());
    let retry = WorkflowEngine::new(retry_runner.clone(), store, engine.registry().clone());
    let state = retry.resume_latest("exec-f").await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(retry_runner.calls(), vec!["step_2", "step_3"]);
    assert!(state.error.is_none());
}

#[tokio::test]
async fn pause_then_resume_in_process() {
    let registry = Arc::new(ExecutionRegistry::new());
    let hook_registry = registry.clone();
    let runner = Arc::new(RecordingStepRunner::new().with_hook("step_0", move |_| {
        if let Some(control) = hook_registry.control("exec-p") {
            control.request_pause();
        }
    }));
    let store = CheckpointStore::in_memory();
    let engine = WorkflowEngine::new(runner.clone(), store.clone(), registry)
        .with_checkpoints_enabled(false);

    let paused = engine
        .start(WorkflowRequest::new("wf", "go", steps(3)).with_execution_id("exec-p"))
        .await
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(engine.get_state("exec-p").unwrap().status, ExecutionStatus::Paused);
    // Pausing an already paused execution is a no-op.
    engine.pause("exec-p").unwrap();

    // Pause writes a checkpoint even with interval checkpoints disabled.
    let checkpoints = store.list_checkpoints("exec-p", None).unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].step_id, "step_1");

    let state = engine.resume_latest("exec-p").await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(runner.calls(), vec!["step_0", "step_1", "step_2"]);
    assert!(matches!(
        engine.pause("exec-p"),
        Err(WaypointError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn cancel_running_execution() {
    let registry = Arc::new(ExecutionRegistry::new());
    let hook_registry = registry.clone();
    let runner = Arc::new(RecordingStepRunner::new().with_hook("step_1", move |_| {
        if let Some(control) = hook_registry.control("exec-c") {
            control.cancel();
        }
    }));
    let store = CheckpointStore::in_memory();
    let engine = WorkflowEngine::new(runner.clone(), store.clone(), registry);

    let state = engine
        .start(WorkflowRequest::new("wf", "go", steps(5)).with_execution_id("exec-c"))
        .await
        .unwrap();
    assert_eq!(state.status, ExecutionStatus::Cancelled);
    // The in-flight step finishes; nothing after it starts.
    assert_eq!(runner.calls(), vec!["step_0", "step_1"]);
    assert_eq!(state.completed_steps, 2);

    let latest = store.get_latest_checkpoint("exec-c").unwrap().unwrap();
    assert_eq!(latest.state.status, ExecutionStatus::Cancelled);
    assert!(!latest.can_resume);

    // Idempotent.
    engine.cancel("exec-c").unwrap();
    assert_eq!(
        engine.get_state("exec-c").unwrap().status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test]
async fn cancel_paused_execution_is_immediate() {
    let registry = Arc::new(ExecutionRegistry::new());
    let hook_registry = registry.clone();
    let runner = Arc::new(RecordingStepRunner::new().with_hook("step_0", move |_| {
        if let Some(control) = hook_registry.control("exec-x") {
            control.request_pause();
        }
    }));
    let store = CheckpointStore::in_memory();
    let engine = WorkflowEngine::new(runner, store.clone(), registry);
    engine
        .start(WorkflowRequest::new("wf", "go", steps(3)).with_execution_id("exec-x"))
        .await
        .unwrap();

    engine.cancel("exec-x").unwrap();
    assert_eq!(
        engine.get_state("exec-x").unwrap().status,
        ExecutionStatus::Cancelled
    );
    assert!(store.get_latest_resumable("exec-x").unwrap().is_some());
    assert!(!store.get_latest_checkpoint("exec-x").unwrap().unwrap().can_resume);
}

#[tokio::test]
async fn cancelled_execution_cannot_be_resumed() {
    let registry = Arc::new(ExecutionRegistry::new());
    let hook_registry = registry.clone();
    let runner = Arc::new(RecordingStepRunner::new().with_hook("step_0", move |_| {
        if let Some(control) = hook_registry.control("exec-y") {
            control.request_pause();
        }
    }));
    let store = CheckpointStore::in_memory();
    let engine = WorkflowEngine::new(runner.clone(), store.clone(), registry);
    engine
        .start(WorkflowRequest::new("wf", "go", steps(3)).with_execution_id("exec-y"))
        .await
        .unwrap();
    engine.cancel("exec-y").unwrap();

    // The pause checkpoint is still marked resumable on its own.
    let pause_point = store.get_latest_resumable("exec-y").unwrap().unwrap();
    assert!(matches!(
        engine.resume_latest("exec-y").await,
        Err(WaypointError::NotResumable(_))
    ));
    assert!(matches!(
        engine
            .resume_from_checkpoint(&pause_point.checkpoint_id, None)
            .await,
        Err(WaypointError::NotResumable(_))
    ));

    // A fresh process sees the terminal snapshot in the store.
    let other_runner = Arc::new(RecordingStepRunner::new());
    let other = WorkflowEngine::new(
        other_runner.clone(),
        store,
        Arc::new(ExecutionRegistry::new()),
    );
    assert!(matches!(
        other.resume_latest("exec-y").await,
        Err(WaypointError::NotResumable(_))
    ));

    assert_eq!(runner.calls(), vec!["step_0"]);
    assert!(other_runner.calls().is_empty());
    assert_eq!(
        engine.get_state("exec-y").unwrap().status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test]
async fn cancelled_execution_stays_closed_without_checkpoints() {
    let registry = Arc::new(ExecutionRegistry::new());
    let hook_registry = registry.clone();
    let runner = Arc::new(RecordingStepRunner::new().with_hook("step_0", move |_| {
        if let Some(control) = hook_registry.control("exec-z") {
            control.request_pause();
        }
    }));
    let engine = WorkflowEngine::new(runner.clone(), CheckpointStore::in_memory(), registry)
        .with_checkpoints_enabled(false);
    engine
        .start(WorkflowRequest::new("wf", "go", steps(3)).with_execution_id("exec-z"))
        .await
        .unwrap();
    engine.cancel("exec-z").unwrap();

    assert!(matches!(
        engine.resume_latest("exec-z").await,
        Err(WaypointError::NotResumable(_))
    ));
    assert_eq!(runner.calls(), vec!["step_0"]);
}

#[tokio::test]
async fn cancel_completed_execution_is_rejected() {
    let engine = engine(Arc::new(RecordingStepRunner::new()), CheckpointStore::in_memory());
    engine
        .start(WorkflowRequest::new("wf", "go", steps(2)).with_execution_id("done"))
        .await
        .unwrap();
    assert!(matches!(
        engine.cancel("done"),
        Err(WaypointError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine.cancel("never-started"),
        Err(WaypointError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn resume_errors() {
    let store = CheckpointStore::in_memory();
    let engine = engine(Arc::new(RecordingStepRunner::new()), store.clone());

    // Terminal snapshot.
    engine
        .start(WorkflowRequest::new("wf", "go", steps(2)).with_execution_id("exec-r"))
        .await
        .unwrap();
    let terminal = store.get_latest_checkpoint("exec-r").unwrap().unwrap();
    assert!(matches!(
        engine.resume_from_checkpoint(&terminal.checkpoint_id, None).await,
        Err(WaypointError::NotResumable(_))
    ));

    assert!(matches!(
        engine.resume_from_checkpoint("missing", None).await,
        Err(WaypointError::CheckpointNotFound(_))
    ));

    // A bare snapshot carries no step list.
    let mut state = terminal.state.clone();
    state.status = ExecutionStatus::Running;
    let bare = store
        .create_checkpoint("exec-bare", &state, "step_1", "Step 1", None)
        .unwrap();
    assert!(matches!(
        engine.resume_from_checkpoint(&bare.checkpoint_id, None).await,
        Err(WaypointError::NoWorkflowSteps(_))
    ));

    let ghost = store
        .create_checkpoint("exec-bare", &state, "ghost", "Ghost", None)
        .unwrap();
    assert!(matches!(
        engine
            .resume_from_checkpoint(&ghost.checkpoint_id, Some(steps(2)))
            .await,
        Err(WaypointError::StepNotFound { .. })
    ));

    assert!(matches!(
        engine.resume_latest("nobody").await,
        Err(WaypointError::CheckpointNotFound(_))
    ));
}

#[tokio::test]
async fn caller_steps_used_when_snapshot_has_none() {
    let store = CheckpointStore::in_memory();
    let runner = Arc::new(RecordingStepRunner::new());
    let engine = engine(runner.clone(), store.clone());

    let mut state = waypoint_core::types::ExecutionState::new("exec-s", "wf", "go", steps(3));
    state.status = ExecutionStatus::Running;
    let cp = store
        .create_checkpoint("exec-s", &state, "step_1", "Step 1", None)
        .unwrap();

    let mut defs = steps(3);
    defs.push(WorkflowStep::new("step_3", "Step 3"));
    let resumed = engine
        .resume_from_checkpoint(&cp.checkpoint_id, Some(defs))
        .await
        .unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(resumed.total_steps, 4);
    assert_eq!(runner.calls(), vec!["step_1", "step_2", "step_3"]);
}

#[tokio::test]
async fn checkpoints_survive_reopen_and_cleanup() {
    let (_dir, db) = temp_db();
    {
        let engine = engine(Arc::new(RecordingStepRunner::new()), sqlite_store(&db));
        engine
            .start(WorkflowRequest::new("wf", "go", steps(3)).with_execution_id("exec-k"))
            .await
            .unwrap();
    }

    let store = sqlite_store(&db);
    let checkpoints = store.list_checkpoints("exec-k", None).unwrap();
    let points: Vec<&str> = checkpoints.iter().map(|c| c.step_id.as_str()).collect();
    assert_eq!(points, vec!["step_1", "step_2", "step_2"]);
    assert_eq!(
        store
            .list_checkpoints("exec-k", Some(ExecutionStatus::Completed))
            .unwrap()
            .len(),
        1
    );

    assert_eq!(store.cleanup_old(chrono::Duration::days(7)).unwrap(), 0);
    assert_eq!(store.delete_execution("exec-k").unwrap(), 3);
    assert!(store.list_checkpoints("exec-k", None).unwrap().is_empty());
}
