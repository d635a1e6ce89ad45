use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::StepRunner;
use waypoint_core::types::{StepContext, StepOutcome, WorkflowStep};

type Hook = Box<dyn Fn(&WorkflowStep) + Send + Sync>;

/// Step runner that records every call and can be scripted to fail, stall,
/// or trigger a side effect for particular steps.
pub struct RecordingStepRunner {
    calls: Mutex<Vec<String>>,
    prior: Mutex<HashMap<String, Vec<String>>>,
    failures: Mutex<HashMap<String, u32>>,
    delays: HashMap<String, Duration>,
    hooks: HashMap<String, Hook>,
    tokens_per_step: u64,
    cost_per_step: f64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingStepRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(vec![]),
            prior: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            delays: HashMap::new(),
            hooks: HashMap::new(),
            tokens_per_step: 10,
            cost_per_step: 0.5,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail the first `times` attempts of `step_id`.
    pub fn fail_times(self, step_id: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(step_id.to_string(), times);
        self
    }

    pub fn with_delay(mut self, step_id: &str, delay: Duration) -> Self {
        self.delays.insert(step_id.to_string(), delay);
        self
    }

    /// Run `hook` whenever `step_id` starts.
    pub fn with_hook(
        mut self,
        step_id: &str,
        hook: impl Fn(&WorkflowStep) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.insert(step_id.to_string(), Box::new(hook));
        self
    }

    pub fn with_usage(mut self, tokens: u64, cost: f64) -> Self {
        self.tokens_per_step = tokens;
        self.cost_per_step = cost;
        self
    }

    /// Step ids in call order, one entry per attempt.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, step_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == step_id)
            .count()
    }

    /// Sorted keys of `prior_outputs` seen by the last attempt of `step_id`.
    pub fn prior_output_keys(&self, step_id: &str) -> Vec<String> {
        self.prior
            .lock()
            .unwrap()
            .get(step_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of steps observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for RecordingStepRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRunner for RecordingStepRunner {
    fn run<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: StepContext,
    ) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(step.id.clone());
            let mut keys: Vec<String> = ctx.prior_outputs.keys().cloned().collect();
            keys.sort();
            self.prior.lock().unwrap().insert(step.id.clone(), keys);

            if let Some(hook) = self.hooks.get(&step.id) {
                hook(step);
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(&step.id) {
                tokio::time::sleep(*delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(&step.id) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(WaypointError::StepExecution {
                            step_id: step.id.clone(),
                            message: format!("scripted failure (attempt {})", ctx.attempt),
                        });
                    }
                }
            }

            Ok(StepOutcome::text(format!("{} done", step.id))
                .with_usage(self.tokens_per_step, self.cost_per_step))
        })
    }
}
