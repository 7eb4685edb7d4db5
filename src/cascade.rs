//! Cascade distributor: splits one allocation's distributable balance among
//! several child allocations at the next hierarchy level, atomically.
//!
//! The whole batch commits or nothing does. Any validation failure aborts
//! the sled transaction, so a half-applied cascade cannot exist.

use std::sync::Arc;

use tracing::info;

use crate::allocation::{Allocation, AllocationStatus, TimeStamp};
use crate::config::Actor;
use crate::error::AllocationError;
use crate::ledger::{
    abort, check_parent_accepts_child, tx_append_child, tx_get, tx_put, tx_reserved_child_sum,
    AllocationLedger,
};
use crate::tenant::Level;
use crate::utils::new_uuid_to_bech32;

/// Ephemeral input: one requested child slice of a parent's balance.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionProposal {
    pub target_tenant: String,
    pub level: Level,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    pub parent: Allocation,
    pub children: Vec<Allocation>,
}

pub struct CascadeDistributor {
    ledger: Arc<AllocationLedger>,
}

impl CascadeDistributor {
    pub fn new(ledger: Arc<AllocationLedger>) -> Self {
        Self { ledger }
    }

    /// Validate and atomically apply a batch of child distributions against
    /// one parent. With `validate_parent` set, a fully-consumed parent moves
    /// from `approved` to `executed` in the same transaction.
    pub fn distribute(
        &self,
        parent_id: &str,
        proposals: &[DistributionProposal],
        validate_parent: bool,
        actor: &Actor,
    ) -> Result<CascadeOutcome, AllocationError> {
        if proposals.is_empty() {
            return Err(AllocationError::InvalidAmount(0));
        }

        // snapshot of the parent for building child templates; everything
        // mutable is re-checked inside the transaction
        let parent = self.ledger.get_by_id(parent_id)?;
        let expected_level = parent.level.child().ok_or_else(|| {
            AllocationError::InvalidLevel(format!(
                "{} allocations cannot be distributed further",
                parent.level
            ))
        })?;

        let mut templates = Vec::with_capacity(proposals.len());
        for proposal in proposals {
            if proposal.amount == 0 {
                return Err(AllocationError::InvalidAmount(proposal.amount));
            }
            if proposal.level != expected_level {
                return Err(AllocationError::InvalidHierarchy {
                    source_level: parent.level.to_string(),
                    target_level: proposal.level.to_string(),
                });
            }
            // the tenant receiving the parent allocation is the one fanning
            // it out to its own children
            let (_, target_node) =
                self.ledger
                    .registry()
                    .check_link(&parent.target_tenant, &proposal.target_tenant, false)?;
            if target_node.level != proposal.level {
                return Err(AllocationError::InvalidLevel(format!(
                    "tenant {} is {}, proposal says {}",
                    target_node.id, target_node.level, proposal.level
                )));
            }

            let id = new_uuid_to_bech32("alloc")
                .map_err(|e| AllocationError::Codec(e.to_string()))?;
            templates.push(Allocation {
                id,
                kind: parent.kind,
                level: proposal.level,
                source_tenant: parent.target_tenant.clone(),
                target_tenant: proposal.target_tenant.clone(),
                parent_id: Some(parent.id.clone()),
                peer_transfer: false,
                allocated: proposal.amount,
                used: 0,
                status: AllocationStatus::Pending,
                created_by: actor.id.clone(),
                validated_by: None,
                created_at: TimeStamp::new(),
                validated_at: None,
                executed_at: None,
                status_reason: None,
            });
        }

        // a batch total that overflows u64 exceeds any parent by definition
        let requested = proposals
            .iter()
            .try_fold(0u64, |total, p| total.checked_add(p.amount))
            .ok_or(AllocationError::DistributionExceedsParent {
                requested: u64::MAX,
                available: parent.allocated.saturating_sub(parent.used),
            })?;
        let parent_key = parent.id.clone();

        let outcome = self.ledger.run_tx(move |(alloc_t, child_t)| {
            let mut parent = tx_get(alloc_t, &parent_key)?;
            check_parent_accepts_child(&parent, &templates[0])?;

            let reserved = tx_reserved_child_sum(alloc_t, child_t, &parent_key)?;
            let available = parent
                .allocated
                .saturating_sub(parent.used)
                .saturating_sub(reserved);
            if requested > available {
                return Err(abort(AllocationError::DistributionExceedsParent {
                    requested,
                    available,
                }));
            }

            for child in &templates {
                tx_put(alloc_t, child)?;
                tx_append_child(child_t, &parent_key, &child.id)?;
            }

            let fully_distributed = requested == available;
            if validate_parent && fully_distributed && parent.status == AllocationStatus::Approved
            {
                parent.status = AllocationStatus::Executed;
                parent.executed_at = Some(TimeStamp::new());
                tx_put(alloc_t, &parent)?;
            }

            Ok(CascadeOutcome {
                parent,
                children: templates.clone(),
            })
        })?;

        info!(
            parent = %outcome.parent.id,
            children = outcome.children.len(),
            requested,
            "cascade distributed"
        );
        Ok(outcome)
    }
}
