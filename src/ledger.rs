//! Allocation ledger: the entity store for budget and stock allocations.
//!
//! Every write that touches a parent's distributable balance runs inside a
//! serializable sled transaction over the allocation tree and the child
//! index, so two concurrent check-then-act sequences against the same parent
//! cannot both win.

use std::collections::BTreeMap;
use std::sync::Arc;

use sled::transaction::{
    ConflictableTransactionError, TransactionError, Transactional, TransactionalTree,
};
use tracing::info;

use crate::allocation::{Allocation, AllocationDraft, AllocationKind, AllocationStatus};
use crate::config::{Actor, EnginePolicy};
use crate::error::AllocationError;
use crate::tenant::{Level, TenantRegistry};
use crate::utils::{from_cbor, new_uuid_to_bech32, to_cbor};

pub const ALLOCATIONS_TREE: &str = "allocations";
pub const CHILD_INDEX_TREE: &str = "allocation_children";

type TxResult<T> = Result<T, ConflictableTransactionError<AllocationError>>;

pub struct AllocationLedger {
    allocations: sled::Tree,
    children: sled::Tree,
    registry: TenantRegistry,
    policy: EnginePolicy,
}

impl AllocationLedger {
    pub fn new(db: Arc<sled::Db>, policy: EnginePolicy) -> Result<Self, AllocationError> {
        let allocations = db.open_tree(ALLOCATIONS_TREE)?;
        let children = db.open_tree(CHILD_INDEX_TREE)?;
        let registry = TenantRegistry::new(db)?;
        Ok(Self {
            allocations,
            children,
            registry,
            policy,
        })
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// Create an allocation from a draft. With a parent set, the balance
    /// check and the insert happen in one serializable transaction.
    pub fn create(&self, draft: AllocationDraft) -> Result<Allocation, AllocationError> {
        if draft.is_peer_transfer() && !self.policy.allow_peer_transfers {
            return Err(AllocationError::InvalidLevel(
                "peer transfers are disabled by policy".into(),
            ));
        }

        let source = draft
            .source()
            .ok_or_else(|| AllocationError::InvalidDraft("source tenant not set".into()))?;
        let target = draft
            .target()
            .ok_or_else(|| AllocationError::InvalidDraft("target tenant not set".into()))?;
        let (_, target_node) =
            self.registry
                .check_link(source, target, draft.is_peer_transfer())?;

        let id = new_uuid_to_bech32("alloc")
            .map_err(|e| AllocationError::Codec(e.to_string()))?;
        let alloc = draft.validate_and_finalise(id, target_node.level)?;

        let created = match alloc.parent_id.clone() {
            None => {
                self.allocations
                    .insert(alloc.id.as_bytes(), to_cbor(&alloc)?)?;
                alloc
            }
            Some(parent_id) => self.run_tx(|(alloc_t, child_t)| {
                let parent = tx_get(alloc_t, &parent_id)?;
                check_parent_accepts_child(&parent, &alloc)?;

                let reserved = tx_reserved_child_sum(alloc_t, child_t, &parent_id)?;
                let available = parent
                    .allocated
                    .saturating_sub(parent.used)
                    .saturating_sub(reserved);
                if alloc.allocated > available {
                    return Err(abort(AllocationError::InsufficientParentBalance {
                        requested: alloc.allocated,
                        available,
                    }));
                }

                tx_put(alloc_t, &alloc)?;
                tx_append_child(child_t, &parent_id, &alloc.id)?;
                Ok(alloc.clone())
            })?,
        };

        info!(
            id = %created.id,
            level = %created.level,
            allocated = created.allocated,
            parent = created.parent_id.as_deref().unwrap_or("-"),
            "allocation created"
        );
        Ok(created)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Allocation, AllocationError> {
        match self.allocations.get(id.as_bytes())? {
            Some(bytes) => from_cbor(&bytes),
            None => Err(AllocationError::NotFound(id.to_string())),
        }
    }

    /// Allocations where the tenant is source or target, creation-ordered.
    pub fn list_by_tenant(
        &self,
        tenant_id: &str,
        level: Option<Level>,
    ) -> Result<Vec<Allocation>, AllocationError> {
        self.scan(|a| {
            (a.source_tenant == tenant_id || a.target_tenant == tenant_id)
                && level.is_none_or(|l| a.level == l)
        })
    }

    /// Full ledger history, creation-ordered.
    pub fn history(&self) -> Result<Vec<Allocation>, AllocationError> {
        self.scan(|_| true)
    }

    /// Allocations awaiting validation, creation-ordered.
    pub fn pending(&self) -> Result<Vec<Allocation>, AllocationError> {
        self.scan(|a| a.status == AllocationStatus::Pending)
    }

    /// Cancel from `Pending` or `Approved`. The reservation against the
    /// parent disappears structurally: cancelled children no longer count
    /// toward the parent's reserved sum.
    pub fn cancel(
        &self,
        id: &str,
        actor: &Actor,
        reason: &str,
    ) -> Result<Allocation, AllocationError> {
        let id = id.to_string();
        let reason = reason.to_string();
        let cancelled = self.run_tx(|(alloc_t, _)| {
            let mut alloc = tx_get(alloc_t, &id)?;
            match alloc.status {
                AllocationStatus::Pending | AllocationStatus::Approved => {}
                AllocationStatus::Executed => {
                    return Err(abort(AllocationError::IllegalTransition {
                        from: alloc.status.as_str().into(),
                        attempted: "cancel".into(),
                    }));
                }
                AllocationStatus::Rejected | AllocationStatus::Cancelled => {
                    return Err(abort(AllocationError::AlreadyTerminal(alloc.id.clone())));
                }
            }
            alloc.status = AllocationStatus::Cancelled;
            alloc.status_reason = Some(reason.clone());
            tx_put(alloc_t, &alloc)?;
            Ok(alloc)
        })?;

        info!(id = %cancelled.id, actor = %actor.id, "allocation cancelled");
        Ok(cancelled)
    }

    /// Record an external consumption event. `used` is monotonic and may
    /// never push the allocation past what its children have reserved.
    pub fn record_usage(&self, id: &str, delta: u64) -> Result<Allocation, AllocationError> {
        if delta == 0 {
            return Err(AllocationError::InvalidAmount(delta));
        }

        let id = id.to_string();
        let updated = self.run_tx(|(alloc_t, child_t)| {
            let mut alloc = tx_get(alloc_t, &id)?;
            match alloc.status {
                AllocationStatus::Approved | AllocationStatus::Executed => {}
                _ => {
                    return Err(abort(AllocationError::IllegalTransition {
                        from: alloc.status.as_str().into(),
                        attempted: "record_usage".into(),
                    }));
                }
            }

            let reserved = tx_reserved_child_sum(alloc_t, child_t, &id)?;
            let headroom = alloc
                .allocated
                .saturating_sub(reserved)
                .saturating_sub(alloc.used);
            if delta > headroom {
                return Err(abort(AllocationError::InsufficientParentBalance {
                    requested: delta,
                    available: headroom,
                }));
            }

            alloc.used += delta;
            tx_put(alloc_t, &alloc)?;
            Ok(alloc)
        })?;

        info!(id = %updated.id, used = updated.used, "usage recorded");
        Ok(updated)
    }

    /// Incoming totals per kind for one tenant.
    pub fn summary(&self, tenant_id: &str) -> Result<TenantSummary, AllocationError> {
        let mut summary = TenantSummary::new(tenant_id);
        for alloc in self.scan(|a| a.target_tenant == tenant_id)? {
            if !alloc.status.holds_reservation() {
                continue;
            }
            let totals = match alloc.kind {
                AllocationKind::Budget { .. } => &mut summary.budget,
                AllocationKind::Stock { .. } => &mut summary.stock,
            };
            totals.allocated += alloc.allocated;
            totals.used += alloc.used;
            totals.count += 1;
        }
        Ok(summary)
    }

    /// Ledger-wide counts and totals, keyed by status and level.
    pub fn statistics(&self) -> Result<LedgerStatistics, AllocationError> {
        let mut stats = LedgerStatistics::default();
        for alloc in self.scan(|_| true)? {
            stats.total += 1;
            *stats
                .by_status
                .entry(alloc.status.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_level
                .entry(alloc.level.as_str().to_string())
                .or_insert(0) += 1;
            if alloc.status.holds_reservation() {
                match alloc.kind {
                    AllocationKind::Budget { .. } => stats.budget_allocated += alloc.allocated,
                    AllocationKind::Stock { .. } => stats.stock_allocated += alloc.allocated,
                }
            }
        }
        Ok(stats)
    }

    /// Ids of an allocation's children, in creation order.
    pub fn child_ids(&self, parent_id: &str) -> Result<Vec<String>, AllocationError> {
        match self.children.get(parent_id.as_bytes())? {
            Some(bytes) => from_cbor(&bytes),
            None => Ok(vec![]),
        }
    }

    /// Point-in-time distributable balance of an allocation.
    pub fn available(&self, id: &str) -> Result<u64, AllocationError> {
        let alloc = self.get_by_id(id)?;
        let mut reserved = 0u64;
        for child_id in self.child_ids(id)? {
            let child = self.get_by_id(&child_id)?;
            if child.status.holds_reservation() {
                reserved += child.allocated;
            }
        }
        Ok(alloc
            .allocated
            .saturating_sub(alloc.used)
            .saturating_sub(reserved))
    }

    pub(crate) fn run_tx<T>(
        &self,
        body: impl Fn((&TransactionalTree, &TransactionalTree)) -> TxResult<T>,
    ) -> Result<T, AllocationError> {
        let res: Result<T, TransactionError<AllocationError>> = (&self.allocations, &self.children)
            .transaction(|(alloc_t, child_t)| body((alloc_t, child_t)));
        match res {
            Ok(v) => Ok(v),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(AllocationError::Store(e)),
        }
    }

    fn scan(
        &self,
        keep: impl Fn(&Allocation) -> bool,
    ) -> Result<Vec<Allocation>, AllocationError> {
        let mut found = vec![];
        for entry in self.allocations.iter() {
            let (_, bytes) = entry?;
            let alloc: Allocation = from_cbor(&bytes)?;
            if keep(&alloc) {
                found.push(alloc);
            }
        }
        found.sort_by(|a, b| {
            a.created_at
                .to_datetime_utc()
                .cmp(&b.created_at.to_datetime_utc())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(found)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct KindTotals {
    pub allocated: u64,
    pub used: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TenantSummary {
    pub tenant_id: String,
    pub budget: KindTotals,
    pub stock: KindTotals,
}

impl TenantSummary {
    fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            budget: KindTotals::default(),
            stock: KindTotals::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LedgerStatistics {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_level: BTreeMap<String, u64>,
    pub budget_allocated: u64,
    pub stock_allocated: u64,
}

// transaction-scope helpers shared with the cascade distributor

pub(crate) fn abort(err: AllocationError) -> ConflictableTransactionError<AllocationError> {
    ConflictableTransactionError::Abort(err)
}

pub(crate) fn tx_get(tree: &TransactionalTree, id: &str) -> TxResult<Allocation> {
    match tree.get(id.as_bytes())? {
        Some(bytes) => from_cbor(&bytes).map_err(abort),
        None => Err(abort(AllocationError::NotFound(id.to_string()))),
    }
}

pub(crate) fn tx_put(tree: &TransactionalTree, alloc: &Allocation) -> TxResult<()> {
    let bytes = to_cbor(alloc).map_err(abort)?;
    tree.insert(alloc.id.as_bytes(), bytes)?;
    Ok(())
}

pub(crate) fn tx_child_ids(tree: &TransactionalTree, parent_id: &str) -> TxResult<Vec<String>> {
    match tree.get(parent_id.as_bytes())? {
        Some(bytes) => from_cbor(&bytes).map_err(abort),
        None => Ok(vec![]),
    }
}

pub(crate) fn tx_append_child(
    tree: &TransactionalTree,
    parent_id: &str,
    child_id: &str,
) -> TxResult<()> {
    let mut ids = tx_child_ids(tree, parent_id)?;
    ids.push(child_id.to_string());
    let bytes = to_cbor(&ids).map_err(abort)?;
    tree.insert(parent_id.as_bytes(), bytes)?;
    Ok(())
}

/// Sum of `allocated` over children still holding a reservation.
pub(crate) fn tx_reserved_child_sum(
    alloc_t: &TransactionalTree,
    child_t: &TransactionalTree,
    parent_id: &str,
) -> TxResult<u64> {
    let mut sum = 0u64;
    for child_id in tx_child_ids(child_t, parent_id)? {
        let child = tx_get(alloc_t, &child_id)?;
        if child.status.holds_reservation() {
            sum += child.allocated;
        }
    }
    Ok(sum)
}

/// Shared precondition for attaching a child under a parent allocation.
pub(crate) fn check_parent_accepts_child(
    parent: &Allocation,
    child: &Allocation,
) -> TxResult<()> {
    match parent.status {
        AllocationStatus::Approved | AllocationStatus::Executed => {}
        _ => {
            return Err(abort(AllocationError::IllegalTransition {
                from: parent.status.as_str().into(),
                attempted: "distribute".into(),
            }));
        }
    }
    if Some(parent.level) != child.level.parent() {
        return Err(abort(AllocationError::InvalidHierarchy {
            source_level: parent.level.to_string(),
            target_level: child.level.to_string(),
        }));
    }
    Ok(())
}
