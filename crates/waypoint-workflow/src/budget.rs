use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use waypoint_core::budget::{BudgetAllocation, BudgetScope};
use waypoint_core::config::BudgetConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::BudgetController;
use waypoint_core::types::new_id;

/// Budget controller that keeps allocations in process memory.
///
/// Ceilings come from `[budget]`; usage is always recorded, even past a
/// ceiling, so callers can see how far over they went.
#[derive(Default)]
pub struct InMemoryBudgetController {
    allocations: Mutex<HashMap<String, BudgetAllocation>>,
    config: BudgetConfig,
}

impl InMemoryBudgetController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BudgetConfig) -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, BudgetAllocation>>> {
        self.allocations
            .lock()
            .map_err(|e| WaypointError::Budget(e.to_string()))
    }

    /// All allocations opened for `scope_id`.
    pub fn allocations_for(&self, scope_id: &str) -> Result<Vec<BudgetAllocation>> {
        let mut found: Vec<BudgetAllocation> = self
            .lock()?
            .values()
            .filter(|a| a.scope_id == scope_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.created_at);
        Ok(found)
    }
}

impl BudgetController for InMemoryBudgetController {
    fn create_allocation(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> BoxFuture<'_, Result<BudgetAllocation>> {
        let scope_id = scope_id.to_string();
        Box::pin(async move {
            let allocation =
                BudgetAllocation::new(new_id(), scope, scope_id, self.config.ceiling_for(scope));
            self.lock()?
                .insert(allocation.allocation_id.clone(), allocation.clone());
            debug!(
                allocation_id = %allocation.allocation_id,
                scope = %scope,
                scope_id = %allocation.scope_id,
                "Budget allocation created"
            );
            Ok(allocation)
        })
    }

    fn record_usage(
        &self,
        allocation_id: &str,
        tokens: u64,
        cost: f64,
    ) -> BoxFuture<'_, Result<BudgetAllocation>> {
        let allocation_id = allocation_id.to_string();
        Box::pin(async move {
            let mut allocations = self.lock()?;
            let allocation = allocations
                .get_mut(&allocation_id)
                .ok_or_else(|| WaypointError::AllocationNotFound(allocation_id.clone()))?;
            allocation.record(tokens, cost)?;
            if allocation.is_exhausted() {
                warn!(
                    allocation_id = %allocation_id,
                    used_tokens = allocation.used_tokens,
                    used_cost = allocation.used_cost,
                    "Budget allocation exhausted"
                );
            }
            Ok(allocation.clone())
        })
    }

    fn get_allocation(&self, allocation_id: &str) -> BoxFuture<'_, Result<BudgetAllocation>> {
        let allocation_id = allocation_id.to_string();
        Box::pin(async move {
            self.lock()?
                .get(&allocation_id)
                .cloned()
                .ok_or(WaypointError::AllocationNotFound(allocation_id))
        })
    }

    fn release_allocation(&self, allocation_id: &str) -> BoxFuture<'_, Result<()>> {
        let allocation_id = allocation_id.to_string();
        Box::pin(async move {
            self.lock()?
                .remove(&allocation_id)
                .ok_or_else(|| WaypointError::AllocationNotFound(allocation_id.clone()))?;
            debug!(allocation_id = %allocation_id, "Budget allocation released");
            Ok(())
        })
    }
}
