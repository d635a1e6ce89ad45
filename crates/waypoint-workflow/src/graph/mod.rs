//! Workflow graph: an explicit step arena plus an edge list computed once.
//!
//! Steps are ordered; an optional parallel subset turns the chain into a
//! fork-join block. The executor walks the graph stage by stage: a stage is
//! either a single step or the parallel members of one topological level.

pub mod builder;
pub mod edge;

pub use builder::{build_edges, Stage, WorkflowGraph};
pub use edge::{Edge, EdgeTarget};
