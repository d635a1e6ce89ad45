use serde::{Deserialize, Serialize};

/// Where an edge leads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EdgeTarget {
    /// Another step in the same workflow.
    Step(String),
    /// Terminal sink of the graph.
    End,
}

impl EdgeTarget {
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::Step(id) => Some(id),
            Self::End => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

impl std::fmt::Display for EdgeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step(id) => f.write_str(id),
            Self::End => f.write_str("END"),
        }
    }
}

/// A directed edge between two steps, or from a step to END.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source step id.
    pub from: String,
    pub to: EdgeTarget,
}

impl Edge {
    /// Create an edge between two steps.
    pub fn step(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: EdgeTarget::Step(to.into()),
        }
    }

    /// Create an edge from a step to END.
    pub fn end(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: EdgeTarget::End,
        }
    }

    /// Whether this edge goes `from -> to` (use `"END"` for the sink).
    pub fn connects(&self, from: &str, to: &str) -> bool {
        self.from == from
            && match &self.to {
                EdgeTarget::Step(id) => id == to,
                EdgeTarget::End => to == "END",
            }
    }
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}
