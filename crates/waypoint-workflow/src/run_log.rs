use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use waypoint_core::config::AppConfig;
use waypoint_core::event::{EventBus, WorkflowEvent};

/// JSONL audit log of one execution.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{execution_id}/{timestamp}.jsonl`, flushing after every line
/// so a crash loses nothing already written.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
    workflow_id: Option<String>,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1 = lifecycle only, 2 = + checkpoints and handoff
    /// summaries, 3 = + every step and task transition.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self {
            log_dir,
            level,
            workflow_id: None,
        }
    }

    /// Logger configured by `[log]`, or `None` when logging is off.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let log = config.log.as_ref()?;
        log.enabled.then(|| Self::new(config.log_dir(), log.level))
    }

    /// Also record handoff events of this workflow. They are keyed by
    /// workflow id rather than execution id.
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Subscribe now and write in a background task. Events published after
    /// this call returns are never missed.
    pub fn spawn(
        self,
        event_bus: &Arc<EventBus>,
        execution_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let rx = event_bus.subscribe();
        let execution_id = execution_id.into();
        tokio::spawn(async move { self.consume(rx, execution_id, cancel).await })
    }

    /// Write until cancellation or the end of the execution.
    pub async fn run(
        self,
        event_bus: Arc<EventBus>,
        execution_id: impl Into<String>,
        cancel: CancellationToken,
    ) {
        let rx = event_bus.subscribe();
        self.consume(rx, execution_id.into(), cancel).await
    }

    async fn consume(
        self,
        mut rx: Receiver<WorkflowEvent>,
        execution_id: String,
        cancel: CancellationToken,
    ) {
        let exec_dir = self.log_dir.join(&execution_id);
        if let Err(e) = tokio::fs::create_dir_all(&exec_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = exec_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), execution_id = %execution_id, "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if !self.is_relevant(&execution_id, &event) {
                                continue;
                            }
                            let Some(entry) = self.event_to_entry(&execution_id, &event) else {
                                if event.is_execution_end() {
                                    break;
                                }
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if event.is_execution_end() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    fn is_relevant(&self, execution_id: &str, event: &WorkflowEvent) -> bool {
        let scope = event.scope_id();
        scope == execution_id || self.workflow_id.as_deref() == Some(scope)
    }

    /// Convert an event to a log entry; `None` when filtered by level.
    fn event_to_entry(&self, execution_id: &str, event: &WorkflowEvent) -> Option<LogEntry> {
        let (min_level, event_type, step_id, detail) = match event {
            WorkflowEvent::ExecutionStarted {
                workflow_id,
                total_steps,
                ..
            } => (
                1,
                "execution_started",
                None,
                Some(serde_json::json!({
                    "workflow_id": workflow_id,
                    "total_steps": total_steps,
                })),
            ),
            WorkflowEvent::ExecutionResumed {
                checkpoint_id,
                step_id,
                ..
            } => (
                1,
                "execution_resumed",
                Some(step_id.clone()),
                Some(serde_json::json!({ "checkpoint_id": checkpoint_id })),
            ),
            WorkflowEvent::ExecutionPaused { .. } => (1, "execution_paused", None, None),
            WorkflowEvent::ExecutionCompleted {
                completed_steps,
                total_tokens_used,
                total_cost,
                ..
            } => (
                1,
                "execution_completed",
                None,
                Some(serde_json::json!({
                    "completed_steps": completed_steps,
                    "total_tokens_used": total_tokens_used,
                    "total_cost": total_cost,
                })),
            ),
            WorkflowEvent::ExecutionFailed { error, .. } => (
                1,
                "execution_failed",
                None,
                Some(serde_json::json!({ "error": error })),
            ),
            WorkflowEvent::ExecutionCancelled { .. } => (1, "execution_cancelled", None, None),

            WorkflowEvent::CheckpointCreated {
                checkpoint_id,
                step_id,
                can_resume,
                ..
            } => (
                2,
                "checkpoint_created",
                Some(step_id.clone()),
                Some(serde_json::json!({
                    "checkpoint_id": checkpoint_id,
                    "can_resume": can_resume,
                })),
            ),
            WorkflowEvent::HandoffStarted { session_id, .. } => (
                2,
                "handoff_started",
                None,
                Some(serde_json::json!({ "session_id": session_id })),
            ),
            WorkflowEvent::HandoffFinished {
                session_id,
                status,
                completed_tasks,
                total_tasks,
                ..
            } => (
                2,
                "handoff_finished",
                None,
                Some(serde_json::json!({
                    "session_id": session_id,
                    "status": status,
                    "completed_tasks": completed_tasks,
                    "total_tasks": total_tasks,
                })),
            ),

            WorkflowEvent::StepStarted {
                step_id, attempt, ..
            } => (
                3,
                "step_started",
                Some(step_id.clone()),
                Some(serde_json::json!({ "attempt": attempt })),
            ),
            WorkflowEvent::StepCompleted {
                step_id,
                tokens_used,
                cost,
                duration_ms,
                ..
            } => (
                3,
                "step_completed",
                Some(step_id.clone()),
                Some(serde_json::json!({
                    "tokens_used": tokens_used,
                    "cost": cost,
                    "duration_ms": duration_ms,
                })),
            ),
            WorkflowEvent::StepFailed {
                step_id,
                error,
                will_retry,
                ..
            } => (
                3,
                "step_failed",
                Some(step_id.clone()),
                Some(serde_json::json!({
                    "error": truncate_str(error, 500),
                    "will_retry": will_retry,
                })),
            ),
            WorkflowEvent::TaskStarted {
                session_id,
                task_id,
                ..
            } => (
                3,
                "task_started",
                None,
                Some(serde_json::json!({ "session_id": session_id, "task_id": task_id })),
            ),
            WorkflowEvent::TaskFinished {
                session_id,
                task_id,
                status,
                ..
            } => (
                3,
                "task_finished",
                None,
                Some(serde_json::json!({
                    "session_id": session_id,
                    "task_id": task_id,
                    "status": status,
                })),
            ),
        };

        if self.level < min_level {
            return None;
        }
        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: execution_id.to_string(),
            event_type,
            step_id,
            detail,
        })
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::task::TaskStatus;

    fn started() -> WorkflowEvent {
        WorkflowEvent::ExecutionStarted {
            execution_id: "exec-1".into(),
            workflow_id: "wf-1".into(),
            total_steps: 2,
        }
    }

    fn step_started() -> WorkflowEvent {
        WorkflowEvent::StepStarted {
            execution_id: "exec-1".into(),
            step_id: "step_0".into(),
            attempt: 0,
        }
    }

    fn checkpoint() -> WorkflowEvent {
        WorkflowEvent::CheckpointCreated {
            execution_id: "exec-1".into(),
            checkpoint_id: "cp-1".into(),
            step_id: "step_1".into(),
            can_resume: true,
        }
    }

    #[test]
    fn test_event_level_filtering() {
        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry("exec-1", &started()).is_some());
        assert!(l1.event_to_entry("exec-1", &checkpoint()).is_none());
        assert!(l1.event_to_entry("exec-1", &step_started()).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry("exec-1", &checkpoint()).is_some());
        assert!(l2.event_to_entry("exec-1", &step_started()).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry("exec-1", &step_started()).is_some());
    }

    #[test]
    fn test_entry_serialization() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = logger.event_to_entry("exec-1", &checkpoint()).unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"checkpoint_created\""));
        assert!(json.contains("\"step_id\":\"step_1\""));
        assert!(json.contains("cp-1"));

        let entry = logger
            .event_to_entry("exec-1", &WorkflowEvent::ExecutionPaused {
                execution_id: "exec-1".into(),
            })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("step_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_relevance_by_scope() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 3).with_workflow_id("wf-1");
        let task = WorkflowEvent::TaskFinished {
            session_id: "s".into(),
            workflow_id: "wf-1".into(),
            task_id: "1".into(),
            status: TaskStatus::Completed,
        };
        assert!(logger.is_relevant("exec-1", &task));
        assert!(logger.is_relevant("exec-1", &started()));
        assert!(!logger.is_relevant("exec-2", &started()));
        assert!(!RunLogger::new(PathBuf::from("/tmp"), 3).is_relevant("exec-1", &task));
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("short", 10), "short");
    }

    #[tokio::test]
    async fn test_writes_jsonl_until_execution_end() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let handle = RunLogger::new(dir.path().to_path_buf(), 3).spawn(
            &bus,
            "exec-1",
            CancellationToken::new(),
        );

        bus.publish(started());
        bus.publish(step_started());
        bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: "other".into(),
            workflow_id: "wf-2".into(),
            total_steps: 1,
        });
        bus.publish(WorkflowEvent::ExecutionCompleted {
            execution_id: "exec-1".into(),
            completed_steps: 2,
            total_tokens_used: 20,
            total_cost: 1.0,
        });
        handle.await.unwrap();

        let exec_dir = dir.path().join("exec-1");
        let file = std::fs::read_dir(&exec_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let contents = std::fs::read_to_string(file).unwrap();
        let types: Vec<String> = contents
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["event_type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            types,
            vec!["execution_started", "step_started", "execution_completed"]
        );
    }
}
