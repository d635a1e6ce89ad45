use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::budget::{BudgetCeiling, BudgetScope};
use crate::error::{Result, WaypointError};

/// Top-level Waypoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            engine: EngineConfig::default(),
            checkpoint: CheckpointConfig::default(),
            handoff: HandoffConfig::default(),
            budget: BudgetConfig::default(),
            log: None,
        }
    }
}

/// Execution state machine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Take a checkpoint after this many completed steps (default: every step).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    /// Upper bound on concurrently running steps inside one fork-join block.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Retries per failed step before the execution fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-step timeout in seconds (0 = unbounded).
    #[serde(default)]
    pub step_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            max_parallel: default_max_parallel(),
            max_retries: default_max_retries(),
            step_timeout_secs: 0,
        }
    }
}

fn default_checkpoint_interval() -> usize { 1 }
fn default_max_parallel() -> usize { 4 }
fn default_max_retries() -> u32 { 2 }

/// Which persistence backend holds checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Checkpoint / resume configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Enable checkpointing (default: true).
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// SQLite database path. Default: <workspace>/checkpoints.db
    #[serde(default)]
    pub path: Option<String>,
    /// Checkpoints older than this many days are removed by cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CheckpointBackend::default(),
            path: None,
            retention_days: default_retention_days(),
        }
    }
}

fn default_checkpoint_enabled() -> bool { true }
fn default_retention_days() -> u64 { 7 }

/// Macro-to-micro handoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Mode string passed to the macro agent.
    #[serde(default = "default_macro_mode")]
    pub macro_mode: String,
    /// Seconds a single micro-agent task may run before it counts as failed.
    #[serde(default = "default_micro_timeout")]
    pub micro_timeout_secs: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            macro_mode: default_macro_mode(),
            micro_timeout_secs: default_micro_timeout(),
        }
    }
}

fn default_macro_mode() -> String { "plan".to_string() }
fn default_micro_timeout() -> u64 { 300 }

/// Optional ceilings per budget scope. Absent = unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub workflow: Option<BudgetCeiling>,
    #[serde(default)]
    pub session: Option<BudgetCeiling>,
    #[serde(default)]
    pub task: Option<BudgetCeiling>,
}

impl BudgetConfig {
    pub fn ceiling_for(&self, scope: BudgetScope) -> Option<BudgetCeiling> {
        match scope {
            BudgetScope::Workflow => self.workflow,
            BudgetScope::Session => self.session,
            BudgetScope::Task => self.task,
        }
    }
}

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = lifecycle only, 2 = + checkpoints and handoffs, 3 = every transition.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

fn default_workspace() -> String { "~/.waypoint".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WaypointError::Config(e.to_string()))?;
        config.validate()?;
        debug!(path = %path.display(), workspace = %config.workspace, "Loaded config");
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.checkpoint_interval == 0 {
            return Err(WaypointError::Config(
                "engine.checkpoint_interval must be at least 1".into(),
            ));
        }
        if self.engine.max_parallel == 0 {
            return Err(WaypointError::Config(
                "engine.max_parallel must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Path of the SQLite checkpoint database.
    pub fn checkpoint_path(&self) -> PathBuf {
        match self.checkpoint.path {
            Some(ref p) => PathBuf::from(p),
            None => self.workspace_dir().join("checkpoints.db"),
        }
    }

    /// Directory for JSONL run logs.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_ref()) {
            Some(dir) => PathBuf::from(dir),
            None => self.workspace_dir().join("logs"),
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
