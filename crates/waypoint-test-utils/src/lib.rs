//! Shared test utilities for Waypoint crates: scripted agents, a recording
//! step runner, and fixtures.

pub mod agents;
pub mod fixtures;
pub mod runner;

pub use agents::{ScriptedMacroAgent, ScriptedMicroAgent};
pub use fixtures::*;
pub use runner::RecordingStepRunner;
