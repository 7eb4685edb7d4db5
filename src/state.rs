//! Validation state machine for allocations: role-gated approve/reject and
//! idempotent execution. Every transition re-reads status inside its own
//! transaction, so concurrent requests resolve to exactly one winner.

use std::sync::Arc;

use tracing::{info, warn};

use crate::allocation::{Allocation, AllocationStatus, TimeStamp};
use crate::config::{Actor, ApproverPolicy};
use crate::error::AllocationError;
use crate::ledger::{abort, tx_get, tx_put, AllocationLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidateAction {
    Approve,
    Reject,
}

/// Seam to the external ledger/inventory collaborator that moves the real
/// resources when an allocation executes.
pub trait ResourceTransfer {
    fn transfer(&self, allocation: &Allocation) -> Result<(), AllocationError>;
}

/// Transfer backend for hosts without an inventory system, and for tests.
#[derive(Debug, Default)]
pub struct NoopTransfer;

impl ResourceTransfer for NoopTransfer {
    fn transfer(&self, _allocation: &Allocation) -> Result<(), AllocationError> {
        Ok(())
    }
}

pub struct ValidationStateMachine {
    ledger: Arc<AllocationLedger>,
    policy: ApproverPolicy,
    transfer: Box<dyn ResourceTransfer + Send + Sync>,
}

impl ValidationStateMachine {
    pub fn new(
        ledger: Arc<AllocationLedger>,
        policy: ApproverPolicy,
        transfer: Box<dyn ResourceTransfer + Send + Sync>,
    ) -> Self {
        Self {
            ledger,
            policy,
            transfer,
        }
    }

    /// Approve or reject a pending allocation. The actor's role must match
    /// the configured approver role for the allocation's level.
    pub fn validate(
        &self,
        id: &str,
        action: ValidateAction,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Allocation, AllocationError> {
        let id = id.to_string();
        let reason = reason.map(str::to_string);
        let required = self.policy.clone();

        let validated = self.ledger.run_tx(move |(alloc_t, _)| {
            let mut alloc = tx_get(alloc_t, &id)?;

            if alloc.status != AllocationStatus::Pending {
                return Err(abort(AllocationError::AlreadyTerminal(alloc.id.clone())));
            }
            let required_role = required.required_for(alloc.level);
            if actor.role != required_role {
                return Err(abort(AllocationError::NotAuthorized {
                    required: required_role.as_str().into(),
                    actual: actor.role.as_str().into(),
                }));
            }

            alloc.status = match action {
                ValidateAction::Approve => AllocationStatus::Approved,
                ValidateAction::Reject => AllocationStatus::Rejected,
            };
            alloc.validated_by = Some(actor.id.clone());
            alloc.validated_at = Some(TimeStamp::new());
            if let Some(reason) = &reason {
                alloc.status_reason = Some(reason.clone());
            }
            tx_put(alloc_t, &alloc)?;
            Ok(alloc)
        })?;

        info!(
            id = %validated.id,
            status = validated.status.as_str(),
            validator = %actor.id,
            "allocation validated"
        );
        Ok(validated)
    }

    /// Execute an approved allocation: take the `Approved -> Executed` edge
    /// (one winner under concurrency), then hand the physical transfer to
    /// the collaborator. Executing an already-executed allocation is a
    /// no-op success so caller retries are safe.
    pub fn execute(&self, id: &str) -> Result<Allocation, AllocationError> {
        let key = id.to_string();
        let (executed, won) = self.ledger.run_tx(move |(alloc_t, _)| {
            let mut alloc = tx_get(alloc_t, &key)?;
            match alloc.status {
                AllocationStatus::Executed => return Ok((alloc, false)),
                AllocationStatus::Approved => {}
                _ => {
                    return Err(abort(AllocationError::IllegalTransition {
                        from: alloc.status.as_str().into(),
                        attempted: "execute".into(),
                    }));
                }
            }
            alloc.status = AllocationStatus::Executed;
            alloc.executed_at = Some(TimeStamp::new());
            tx_put(alloc_t, &alloc)?;
            Ok((alloc, true))
        })?;

        if !won {
            // already executed, the transfer has happened exactly once
            return Ok(executed);
        }

        if let Err(transfer_err) = self.transfer.transfer(&executed) {
            // transfer never happened; reopen the allocation so the caller
            // can retry through the same idempotent path
            warn!(id = %executed.id, error = %transfer_err, "resource transfer failed, reverting");
            let key = executed.id.clone();
            self.ledger.run_tx(move |(alloc_t, _)| {
                let mut alloc = tx_get(alloc_t, &key)?;
                if alloc.status == AllocationStatus::Executed {
                    alloc.status = AllocationStatus::Approved;
                    alloc.executed_at = None;
                    tx_put(alloc_t, &alloc)?;
                }
                Ok(())
            })?;
            return Err(transfer_err);
        }

        info!(id = %executed.id, "allocation executed");
        Ok(executed)
    }
}
