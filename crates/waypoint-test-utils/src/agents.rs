use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use waypoint_core::agent::{MacroAgentRequest, MacroAgentResult, MicroAgentRequest, MicroAgentResult};
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::{MacroAgent, MicroAgent};

/// What a scripted macro agent does when called.
enum MacroScript {
    Succeed(String),
    ReportFailure(String),
    Error(String),
}

/// Planning agent that returns a fixed response.
pub struct ScriptedMacroAgent {
    script: MacroScript,
    tokens_used: u64,
    cost: f64,
    cleanup_error: Option<String>,
    requests: Mutex<Vec<MacroAgentRequest>>,
    cleanup_calls: AtomicUsize,
}

impl ScriptedMacroAgent {
    fn with_script(script: MacroScript) -> Self {
        Self {
            script,
            tokens_used: 0,
            cost: 0.0,
            cleanup_error: None,
            requests: Mutex::new(vec![]),
            cleanup_calls: AtomicUsize::new(0),
        }
    }

    /// Succeed with `output`.
    pub fn new(output: impl Into<String>) -> Self {
        Self::with_script(MacroScript::Succeed(output.into()))
    }

    /// Return `success = false` with `error`.
    pub fn failing(error: impl Into<String>) -> Self {
        Self::with_script(MacroScript::ReportFailure(error.into()))
    }

    /// Return an adapter error.
    pub fn erroring(error: impl Into<String>) -> Self {
        Self::with_script(MacroScript::Error(error.into()))
    }

    pub fn with_usage(mut self, tokens_used: u64, cost: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost = cost;
        self
    }

    pub fn with_cleanup_error(mut self, error: impl Into<String>) -> Self {
        self.cleanup_error = Some(error.into());
        self
    }

    pub fn requests(&self) -> Vec<MacroAgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }
}

impl MacroAgent for ScriptedMacroAgent {
    fn execute(&self, request: MacroAgentRequest) -> BoxFuture<'_, Result<MacroAgentResult>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let mut result = match &self.script {
                MacroScript::Succeed(output) => MacroAgentResult::success(output.clone()),
                MacroScript::ReportFailure(error) => MacroAgentResult::failure(error.clone()),
                MacroScript::Error(error) => return Err(WaypointError::MacroAgent(error.clone())),
            };
            result.tokens_used = self.tokens_used;
            result.cost = self.cost;
            Ok(result)
        })
    }

    fn cleanup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            match &self.cleanup_error {
                Some(e) => Err(WaypointError::Cleanup(e.clone())),
                None => Ok(()),
            }
        })
    }
}

type MicroHook = Box<dyn Fn(&MicroAgentRequest) + Send + Sync>;

/// Execution agent that succeeds by default and can be scripted to fail,
/// stall or error on prompts containing a marker.
pub struct ScriptedMicroAgent {
    fail_on: Vec<String>,
    error_on: Vec<String>,
    delays: Vec<(String, Duration)>,
    tokens_used: u64,
    cost: f64,
    cleanup_error: Option<String>,
    hook: Option<MicroHook>,
    prompts: Mutex<Vec<String>>,
    cleanup_calls: AtomicUsize,
}

impl ScriptedMicroAgent {
    pub fn new() -> Self {
        Self {
            fail_on: vec![],
            error_on: vec![],
            delays: vec![],
            tokens_used: 100,
            cost: 0.01,
            cleanup_error: None,
            hook: None,
            prompts: Mutex::new(vec![]),
            cleanup_calls: AtomicUsize::new(0),
        }
    }

    /// Report `success = false` for prompts containing `marker`.
    pub fn fail_when(mut self, marker: impl Into<String>) -> Self {
        self.fail_on.push(marker.into());
        self
    }

    /// Return an adapter error for prompts containing `marker`.
    pub fn error_when(mut self, marker: impl Into<String>) -> Self {
        self.error_on.push(marker.into());
        self
    }

    /// Sleep before answering prompts containing `marker`.
    pub fn delay_when(mut self, marker: impl Into<String>, delay: Duration) -> Self {
        self.delays.push((marker.into(), delay));
        self
    }

    pub fn with_usage(mut self, tokens_used: u64, cost: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost = cost;
        self
    }

    pub fn with_cleanup_error(mut self, error: impl Into<String>) -> Self {
        self.cleanup_error = Some(error.into());
        self
    }

    /// Run `hook` on every request before answering.
    pub fn with_hook(mut self, hook: impl Fn(&MicroAgentRequest) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// For each call, the first of `task_ids` whose `Task <id>:` heading
    /// appears in the prompt.
    pub fn task_order(&self, task_ids: &[&str]) -> Vec<String> {
        self.prompts()
            .iter()
            .filter_map(|p| {
                task_ids
                    .iter()
                    .find(|id| p.contains(&format!("Task {}:", id)))
                    .map(|id| id.to_string())
            })
            .collect()
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedMicroAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MicroAgent for ScriptedMicroAgent {
    fn execute(&self, request: MicroAgentRequest) -> BoxFuture<'_, Result<MicroAgentResult>> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            if let Some(hook) = &self.hook {
                hook(&request);
            }

            let delay = self
                .delays
                .iter()
                .find(|(marker, _)| request.prompt.contains(marker.as_str()))
                .map(|(_, d)| *d);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self
                .error_on
                .iter()
                .any(|m| request.prompt.contains(m.as_str()))
            {
                return Err(WaypointError::MicroAgent("scripted adapter error".into()));
            }

            let mut result = if self
                .fail_on
                .iter()
                .any(|m| request.prompt.contains(m.as_str()))
            {
                MicroAgentResult::failure("scripted task failure")
            } else {
                let mut ok = MicroAgentResult::success("task done");
                ok.files_modified = request.file_targets.clone();
                ok
            };
            result.tokens_used = self.tokens_used;
            result.cost = self.cost;
            Ok(result)
        })
    }

    fn cleanup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            match &self.cleanup_error {
                Some(e) => Err(WaypointError::Cleanup(e.clone())),
                None => Ok(()),
            }
        })
    }
}
