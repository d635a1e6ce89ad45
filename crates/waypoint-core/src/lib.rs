pub mod agent;
pub mod budget;
pub mod config;
pub mod error;
pub mod event;
pub mod task;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, Result, WaypointError};
pub use event::{EventBus, WorkflowEvent};
pub use types::*;
