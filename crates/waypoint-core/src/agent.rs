use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Request sent to the planning (macro) agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroAgentRequest {
    pub project_id: String,
    pub user_id: String,
    pub prompt: String,
    /// Agent mode, e.g. `plan`.
    pub mode: String,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

/// What the macro agent returns. `output` embeds the specification, plan
/// and tasks sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MacroAgentResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    /// Adapter-side checkpoint reference, if the backend keeps one.
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl MacroAgentResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Request sent to the execution (micro) agent for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroAgentRequest {
    pub prompt: String,
    #[serde(default)]
    pub file_targets: Vec<String>,
}

/// What the micro agent returns for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MicroAgentResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub error: Option<String>,
}

impl MicroAgentResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_tokens(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }
}
