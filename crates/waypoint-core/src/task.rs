use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority marker of a planned task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Parse a priority marker such as `P0`, `high` or `[HIGH]`.
    /// Unrecognized markers fall back to `Medium`.
    pub fn parse(marker: &str) -> Self {
        let cleaned = marker
            .trim()
            .trim_matches(|c: char| c == '[' || c == ']' || c == '(' || c == ')')
            .to_ascii_lowercase();
        match cleaned.as_str() {
            "p0" | "critical" | "urgent" | "blocker" => Self::Critical,
            "p1" | "high" => Self::High,
            "p2" | "medium" | "normal" => Self::Medium,
            "p3" | "low" | "minor" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// A task extracted from the planning agent's output. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTask {
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub effort: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    /// References to other tasks, by id or by title.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_targets: Vec<String>,
}

impl ParsedTask {
    pub fn new(task_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            priority: Priority::default(),
            effort: None,
            assignee: None,
            dependencies: vec![],
            description: String::new(),
            file_targets: vec![],
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.file_targets = files;
        self
    }

    /// Whether a dependency reference names this task (by id, or by title
    /// ignoring case).
    pub fn matches_reference(&self, reference: &str) -> bool {
        let reference = reference.trim();
        reference == self.task_id || reference.eq_ignore_ascii_case(self.title.trim())
    }
}

/// Status of one task inside a handoff session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Why a task did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailure {
    /// The micro agent reported failure or returned an error.
    AgentError,
    /// The micro agent did not answer within the configured timeout.
    Timeout,
    /// A dependency never completed.
    Blocked,
    /// The workflow budget ran out before the task was reached.
    BudgetExhausted,
    /// The session was cancelled before the task was reached.
    Cancelled,
}

/// Runtime wrapper around one parsed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task: ParsedTask,
    pub status: TaskStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure: Option<TaskFailure>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
}

impl TaskExecution {
    pub fn new(task: ParsedTask) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            failure: None,
            files_created: vec![],
            files_modified: vec![],
            tokens_used: 0,
            cost: 0.0,
        }
    }

    /// Identity key within a session.
    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.status, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn fail(&mut self, failure: TaskFailure, reason: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.failure = Some(failure);
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, failure: TaskFailure, reason: impl Into<String>) {
        self.status = TaskStatus::Skipped;
        self.failure = Some(failure);
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }
}

/// Lifecycle of a handoff session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl HandoffStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One macro-to-micro handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffSession {
    pub session_id: String,
    pub workflow_id: String,
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    pub status: HandoffStatus,
    pub tasks: Vec<TaskExecution>,
    #[serde(default)]
    pub specification: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub allocation_id: Option<String>,
    #[serde(default)]
    pub macro_tokens_used: u64,
    #[serde(default)]
    pub macro_cost: f64,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HandoffSession {
    pub fn new(
        session_id: impl Into<String>,
        workflow_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            workflow_id: workflow_id.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            status: HandoffStatus::Pending,
            tasks: vec![],
            specification: None,
            plan: None,
            allocation_id: None,
            macro_tokens_used: 0,
            macro_cost: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn completed_tasks(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    pub fn failed_tasks(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn skipped_tasks(&self) -> usize {
        self.count(TaskStatus::Skipped)
    }

    /// Percentage of completed tasks, 0 when there are no tasks.
    pub fn progress(&self) -> f64 {
        let total = self.total_tasks();
        if total == 0 {
            return 0.0;
        }
        self.completed_tasks() as f64 / total as f64 * 100.0
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.task_id() == task_id)
    }

    /// Total tokens across the macro call and all task calls.
    pub fn total_tokens_used(&self) -> u64 {
        self.macro_tokens_used + self.tasks.iter().map(|t| t.tokens_used).sum::<u64>()
    }

    pub fn total_cost(&self) -> f64 {
        self.macro_cost + self.tasks.iter().map(|t| t.cost).sum::<f64>()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move to FAILED. A failed session always carries its reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = HandoffStatus::Failed;
        self.error = Some(reason.into());
        self.touch();
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(statuses: &[TaskStatus]) -> HandoffSession {
        let mut session = HandoffSession::new("s", "w", "p", "u");
        for (i, status) in statuses.iter().enumerate() {
            let mut exec = TaskExecution::new(ParsedTask::new(format!("1.{}", i + 1), "t"));
            exec.status = *status;
            session.tasks.push(exec);
        }
        session
    }

    #[test]
    fn test_progress_empty() {
        let session = session_with(&[]);
        assert_eq!(session.total_tasks(), 0);
        assert_eq!(session.progress(), 0.0);
    }

    #[test]
    fn test_progress_partial() {
        let session = session_with(&[
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Pending,
            TaskStatus::Completed,
        ]);
        assert_eq!(session.completed_tasks(), 2);
        assert_eq!(session.failed_tasks(), 1);
        assert_eq!(session.progress(), 50.0);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("P0"), Priority::Critical);
        assert_eq!(Priority::parse("[HIGH]"), Priority::High);
        assert_eq!(Priority::parse("low"), Priority::Low);
        assert_eq!(Priority::parse("whenever"), Priority::Medium);
    }

    #[test]
    fn test_matches_reference() {
        let task = ParsedTask::new("1.1", "Set up project skeleton");
        assert!(task.matches_reference("1.1"));
        assert!(task.matches_reference(" set up PROJECT skeleton "));
        assert!(!task.matches_reference("1.2"));
    }

    #[test]
    fn test_skip_marks_finished() {
        let mut exec = TaskExecution::new(ParsedTask::new("1", "t"));
        assert!(!exec.is_finished());
        exec.skip(TaskFailure::Blocked, "dependency 0 failed");
        assert!(exec.is_finished());
        assert_eq!(exec.status, TaskStatus::Skipped);
        assert_eq!(exec.failure, Some(TaskFailure::Blocked));
    }
}
