//! Task parser: turns a planning agent's markdown output into structured,
//! dependency-annotated tasks.
//!
//! Expected layout:
//!
//! ```text
//! ## Specification
//! ...
//! ## Plan
//! ...
//! ## Tasks
//! ### Task 1.1: Scaffold crate
//! Priority: high
//! Dependencies: none
//! Files: Cargo.toml, src/main.rs
//! Free-form description.
//! ```
//!
//! Parsing never fails. Blocks without a recognizable id are dropped with a
//! warning.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use waypoint_core::task::{ParsedTask, Priority};

fn task_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*#{2,4}\s+(?:\*\*)?task\b\s*(.*)$").expect("static pattern")
    })
}

fn task_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)*|[Tt]-?\d+)(?:\s*[:.\-]\s*|\s+|$)(.*)$")
            .expect("static pattern")
    })
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(#{1,4})\s+(.*)$").expect("static pattern"))
}

fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:[-*+]\s+)?(?:\*\*)?(priority|effort|assignee|dependencies|depends on|files)(?:\*\*)?\s*:\s*(?:\*\*)?\s*(.*?)\s*$",
        )
        .expect("static pattern")
    })
}

/// The three sections of a planning agent's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroOutput {
    pub specification: Option<String>,
    pub plan: Option<String>,
    pub tasks: Vec<ParsedTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Specification,
    Plan,
    Tasks,
    Other,
}

impl Section {
    fn from_heading(text: &str) -> Self {
        let name = text
            .trim()
            .trim_matches('*')
            .trim_end_matches(':')
            .trim()
            .to_ascii_lowercase();
        match name.as_str() {
            "specification" | "spec" => Self::Specification,
            "plan" | "implementation plan" => Self::Plan,
            n if n.starts_with("task") => Self::Tasks,
            _ => Self::Other,
        }
    }
}

/// Parses planning output. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskParser;

impl TaskParser {
    pub fn new() -> Self {
        Self
    }

    /// Extract the tasks, in document order.
    pub fn parse(&self, text: &str) -> Vec<ParsedTask> {
        self.parse_output(text).tasks
    }

    /// Split the output into its sections and parse the tasks. Without a
    /// tasks section the whole text is scanned for task blocks.
    pub fn parse_output(&self, text: &str) -> MacroOutput {
        let mut section = Section::Preamble;
        let mut specification = Vec::new();
        let mut plan = Vec::new();
        let mut task_lines = Vec::new();
        let mut has_tasks_section = false;

        for line in text.lines() {
            if !task_heading_re().is_match(line) {
                if let Some(caps) = heading_re().captures(line) {
                    if caps[1].len() <= 2 {
                        section = Section::from_heading(&caps[2]);
                        has_tasks_section |= section == Section::Tasks;
                        continue;
                    }
                }
            }
            match section {
                Section::Specification => specification.push(line),
                Section::Plan => plan.push(line),
                Section::Tasks => task_lines.push(line),
                Section::Preamble | Section::Other => {}
            }
        }

        let tasks = if has_tasks_section {
            parse_tasks(task_lines)
        } else {
            parse_tasks(text.lines())
        };
        debug!(
            tasks = tasks.len(),
            has_tasks_section, "Parsed planning output"
        );

        MacroOutput {
            specification: join_section(&specification),
            plan: join_section(&plan),
            tasks,
        }
    }
}

fn join_section(lines: &[&str]) -> Option<String> {
    let text = lines.join("\n").trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// A task block being accumulated.
struct Block {
    task: ParsedTask,
    description: Vec<String>,
    in_files_list: bool,
}

impl Block {
    fn new(task_id: String, title: String) -> Self {
        Self {
            task: ParsedTask::new(task_id, title),
            description: vec![],
            in_files_list: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        if let Some(caps) = field_re().captures(line) {
            let value = caps[2].trim_matches('*').trim();
            let field = caps[1].to_ascii_lowercase();
            self.in_files_list = false;
            match field.as_str() {
                "priority" => self.task.priority = Priority::parse(value),
                "effort" => self.task.effort = non_empty(value),
                "assignee" => self.task.assignee = non_empty(value),
                "dependencies" | "depends on" => {
                    self.task.dependencies = parse_dependencies(value)
                }
                "files" => {
                    self.task.file_targets = split_list(value)
                        .map(|f| f.trim_matches('`').to_string())
                        .collect();
                    self.in_files_list = value.is_empty();
                }
                _ => {}
            }
            return;
        }

        if self.in_files_list {
            let trimmed = line.trim();
            if let Some(path) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
            {
                self.task
                    .file_targets
                    .push(path.trim().trim_matches('`').to_string());
                return;
            }
            self.in_files_list = false;
            if trimmed.is_empty() {
                return;
            }
        }

        self.description.push(line.trim_end().to_string());
    }

    fn finish(mut self) -> ParsedTask {
        self.task.description = self.description.join("\n").trim().to_string();
        self.task
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_dependencies(value: &str) -> Vec<String> {
    let lowered = value.to_ascii_lowercase();
    if matches!(lowered.as_str(), "" | "none" | "n/a" | "-") {
        return vec![];
    }
    split_list(value)
        .filter(|d| !matches!(d.to_ascii_lowercase().as_str(), "none" | "n/a" | "-"))
        .map(|d| {
            let stripped = match d.get(..5) {
                Some(prefix) if prefix.eq_ignore_ascii_case("task ") => &d[5..],
                _ => d,
            };
            stripped.trim().to_string()
        })
        .collect()
}

fn flush(block: Option<Block>, tasks: &mut Vec<ParsedTask>) {
    let Some(block) = block else { return };
    let task = block.finish();
    if tasks.iter().any(|t| t.task_id == task.task_id) {
        warn!(task_id = %task.task_id, "Dropping duplicate task id");
        return;
    }
    tasks.push(task);
}

fn parse_tasks<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<ParsedTask> {
    let mut tasks: Vec<ParsedTask> = Vec::new();
    let mut current: Option<Block> = None;

    for line in lines {
        if let Some(caps) = task_heading_re().captures(line) {
            flush(current.take(), &mut tasks);
            let rest = caps[1].trim();
            match task_id_re().captures(rest) {
                Some(id_caps) => {
                    let task_id = id_caps[1].to_string();
                    let title = id_caps[2].trim().trim_end_matches('*').trim();
                    let title = if title.is_empty() {
                        format!("Task {}", task_id)
                    } else {
                        title.to_string()
                    };
                    current = Some(Block::new(task_id, title));
                }
                None => {
                    warn!(heading = line.trim(), "Dropping task block without a recognizable id");
                }
            }
            continue;
        }

        if heading_re().is_match(line) {
            flush(current.take(), &mut tasks);
            continue;
        }

        if let Some(block) = current.as_mut() {
            block.push_line(line);
        }
    }
    flush(current.take(), &mut tasks);

    tasks
}
