use std::io::Write;
use std::path::PathBuf;

use tempfile::{NamedTempFile, TempDir};

use waypoint_core::types::WorkflowStep;

/// Planning output with two tasks, `1.2` depending on `1.1`.
pub const TWO_TASK_OUTPUT: &str = "\
## Specification
A command-line greeter.

## Plan
Scaffold the crate, then add the greeting.

## Tasks

### Task 1.1: Scaffold crate
Priority: high
Effort: 1h
Assignee: micro
Dependencies: none
Files: Cargo.toml, src/main.rs
Create the crate layout.

### Task 1.2: Add greeting
Priority: medium
Dependencies: Task 1.1
Files: src/main.rs
Print a greeting.
";

/// Build a planning output from `(id, title, dependencies)` triples, with
/// dependencies written as a comma-separated list.
pub fn macro_output(tasks: &[(&str, &str, &str)]) -> String {
    let mut out = String::from("## Specification\nSpec.\n\n## Plan\nPlan.\n\n## Tasks\n");
    for (id, title, deps) in tasks {
        let deps = if deps.is_empty() { "none" } else { deps };
        out.push_str(&format!(
            "\n### Task {}: {}\nDependencies: {}\nDo {}.\n",
            id, title, deps, title
        ));
    }
    out
}

/// `step_0..step_{n-1}`.
pub fn steps(n: usize) -> Vec<WorkflowStep> {
    (0..n)
        .map(|i| WorkflowStep::new(format!("step_{}", i), format!("Step {}", i)))
        .collect()
}

pub fn step_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("step_{}", i)).collect()
}

/// Write `contents` to a temporary `waypoint.toml`.
pub fn temp_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("waypoint")
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// A fresh directory and a checkpoint database path inside it. Keep the
/// directory alive for as long as the path is used.
pub fn temp_db() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoints.db");
    (dir, path)
}
