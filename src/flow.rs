//! Budget flow aggregator: rolled-up allocated/used/transferred/available
//! views per allocation tree. Pure reads, recomputed on demand from the
//! ledger; never incrementally maintained, so it cannot drift.

use std::sync::Arc;

use crate::allocation::Allocation;
use crate::error::AllocationError;
use crate::ledger::AllocationLedger;
use crate::tenant::Level;

/// Consumed over allocated, 0 when nothing is allocated.
pub fn utilization_rate(allocation: &Allocation) -> f64 {
    if allocation.allocated == 0 {
        0.0
    } else {
        allocation.used as f64 / allocation.allocated as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Low,
    Normal,
    Warning,
    Critical,
}

impl AlertLevel {
    /// Pure classification of a utilization rate. Monotone: a higher rate
    /// never maps to a less severe level.
    pub fn classify(rate: f64) -> Self {
        if rate < 0.30 {
            AlertLevel::Low
        } else if rate < 0.75 {
            AlertLevel::Normal
        } else if rate <= 0.90 {
            AlertLevel::Warning
        } else {
            AlertLevel::Critical
        }
    }
}

/// One node of the rolled-up view. `transferred` sums the reservations of
/// live children; `available` is what remains distributable.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BudgetFlow {
    pub allocation_id: String,
    pub target_tenant: String,
    pub level: Level,
    pub status: &'static str,
    pub allocated: u64,
    pub used: u64,
    pub transferred: u64,
    pub available: u64,
    pub utilization: f64,
    pub alert: AlertLevel,
    pub per_child: Vec<BudgetFlow>,
}

pub struct BudgetFlowAggregator {
    ledger: Arc<AllocationLedger>,
}

impl BudgetFlowAggregator {
    pub fn new(ledger: Arc<AllocationLedger>) -> Self {
        Self { ledger }
    }

    /// Recompute the flow tree rooted at one allocation. Depth is bounded by
    /// the three-level hierarchy, so this is O(descendants) and terminates.
    /// The result is a point-in-time snapshot, not transactionally consistent
    /// with concurrent writes.
    pub fn flow(&self, root_id: &str) -> Result<BudgetFlow, AllocationError> {
        let root = self.ledger.get_by_id(root_id)?;
        self.node(&root, 0)
    }

    fn node(&self, alloc: &Allocation, depth: u8) -> Result<BudgetFlow, AllocationError> {
        // hierarchy guarantees depth <= 3; the guard only protects against
        // a corrupted child index
        if depth > 3 {
            return Err(AllocationError::InvalidLevel(
                "allocation tree deeper than the hierarchy allows".into(),
            ));
        }

        let mut per_child = vec![];
        let mut transferred = 0u64;
        for child_id in self.ledger.child_ids(&alloc.id)? {
            let child = self.ledger.get_by_id(&child_id)?;
            if child.status.holds_reservation() {
                transferred += child.allocated;
            }
            per_child.push(self.node(&child, depth + 1)?);
        }

        let rate = utilization_rate(alloc);
        Ok(BudgetFlow {
            allocation_id: alloc.id.clone(),
            target_tenant: alloc.target_tenant.clone(),
            level: alloc.level,
            status: alloc.status.as_str(),
            allocated: alloc.allocated,
            used: alloc.used,
            transferred,
            available: alloc
                .allocated
                .saturating_sub(alloc.used)
                .saturating_sub(transferred),
            utilization: rate,
            alert: AlertLevel::classify(rate),
            per_child,
        })
    }
}
