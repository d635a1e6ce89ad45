use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WaypointError};

/// What a budget allocation is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Workflow,
    Session,
    Task,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Workflow => "workflow",
            Self::Session => "session",
            Self::Task => "task",
        };
        f.write_str(s)
    }
}

/// Upper bounds for an allocation. Either limit may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetCeiling {
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_cost: Option<f64>,
}

/// A scoped ledger of token and cost usage.
///
/// Used amounts only ever grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub allocation_id: String,
    pub scope: BudgetScope,
    pub scope_id: String,
    #[serde(default)]
    pub ceiling: Option<BudgetCeiling>,
    pub used_tokens: u64,
    pub used_cost: f64,
    pub created_at: DateTime<Utc>,
}

impl BudgetAllocation {
    pub fn new(
        allocation_id: impl Into<String>,
        scope: BudgetScope,
        scope_id: impl Into<String>,
        ceiling: Option<BudgetCeiling>,
    ) -> Self {
        Self {
            allocation_id: allocation_id.into(),
            scope,
            scope_id: scope_id.into(),
            ceiling,
            used_tokens: 0,
            used_cost: 0.0,
            created_at: Utc::now(),
        }
    }

    /// Add usage. Negative or non-finite cost is rejected.
    pub fn record(&mut self, tokens: u64, cost: f64) -> Result<()> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(WaypointError::Budget(format!(
                "invalid cost {} for allocation {}",
                cost, self.allocation_id
            )));
        }
        self.used_tokens = self.used_tokens.saturating_add(tokens);
        self.used_cost += cost;
        Ok(())
    }

    /// Whether any configured ceiling has been reached.
    pub fn is_exhausted(&self) -> bool {
        let Some(ceiling) = self.ceiling else {
            return false;
        };
        ceiling.max_tokens.is_some_and(|max| self.used_tokens >= max)
            || ceiling.max_cost.is_some_and(|max| self.used_cost >= max)
    }

    pub fn remaining_tokens(&self) -> Option<u64> {
        self.ceiling?
            .max_tokens
            .map(|max| max.saturating_sub(self.used_tokens))
    }
}
