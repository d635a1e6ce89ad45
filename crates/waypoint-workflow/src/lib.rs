pub mod budget;
pub mod checkpoint;
pub mod executor;
pub mod graph;
pub mod handoff;
pub mod handoff_step;
pub mod parser;
pub mod registry;
pub mod run_log;

pub use budget::InMemoryBudgetController;
pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
pub use executor::{WorkflowEngine, WorkflowRequest};
pub use graph::{build_edges, Edge, EdgeTarget, WorkflowGraph};
pub use handoff::{HandoffCallbacks, HandoffProtocol, HandoffRequest};
pub use handoff_step::HandoffStepRunner;
pub use parser::{MacroOutput, TaskParser};
pub use registry::ExecutionRegistry;
pub use run_log::RunLogger;
