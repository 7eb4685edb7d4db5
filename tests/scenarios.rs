//! End-to-end lifecycle scenarios against a real sled database.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use allocation_engine::{
    Actor, AllocationDraft, AllocationError, AllocationLedger, AllocationStatus, ApproverPolicy,
    ApproverRole, BudgetFlowAggregator, CascadeDistributor, Currency, DistributionProposal,
    EnginePolicy, Level, NoopTransfer, ResourceTransfer, TenantNode, ValidateAction,
    ValidationStateMachine, utils,
};
use tempfile::tempdir;

struct Engine {
    ledger: Arc<AllocationLedger>,
    machine: ValidationStateMachine,
    cascade: CascadeDistributor,
    flow: BudgetFlowAggregator,
}

// Sled uses file-based locking to prevent concurrent access, so each test
// opens its own database under a tempdir for simplified cleanup.
fn open_engine(path: &std::path::Path) -> anyhow::Result<Engine> {
    let db = Arc::new(sled::open(path)?);
    db.clear()?;

    let ledger = Arc::new(AllocationLedger::new(db, EnginePolicy::default())?);
    let machine = ValidationStateMachine::new(
        ledger.clone(),
        ApproverPolicy::default(),
        Box::new(NoopTransfer),
    );
    let cascade = CascadeDistributor::new(ledger.clone());
    let flow = BudgetFlowAggregator::new(ledger.clone());
    Ok(Engine {
        ledger,
        machine,
        cascade,
        flow,
    })
}

struct Tenants {
    ministry: String,
    region: String,
    crou_a: String,
    crou_b: String,
    crou_c: String,
}

fn provision_tenants(ledger: &AllocationLedger) -> anyhow::Result<Tenants> {
    let registry = ledger.registry();

    let ministry = utils::new_uuid_to_bech32("tenant")?;
    registry.register(TenantNode {
        id: ministry.clone(),
        name: "Ministere".into(),
        level: Level::Top,
        parent_id: None,
    })?;

    let region = utils::new_uuid_to_bech32("tenant")?;
    registry.register(TenantNode {
        id: region.clone(),
        name: "Region Centre".into(),
        level: Level::Regional,
        parent_id: Some(ministry.clone()),
    })?;

    let mut crous = vec![];
    for name in ["CROU-A", "CROU-B", "CROU-C"] {
        let id = utils::new_uuid_to_bech32("tenant")?;
        registry.register(TenantNode {
            id: id.clone(),
            name: name.into(),
            level: Level::Operating,
            parent_id: Some(region.clone()),
        })?;
        crous.push(id);
    }

    Ok(Tenants {
        ministry,
        region,
        crou_a: crous.remove(0),
        crou_b: crous.remove(0),
        crou_c: crous.remove(0),
    })
}

fn regional_director() -> anyhow::Result<Actor> {
    Ok(Actor::new(
        utils::new_uuid_to_bech32("user")?,
        ApproverRole::RegionalDirector,
    ))
}

fn unit_manager() -> anyhow::Result<Actor> {
    Ok(Actor::new(
        utils::new_uuid_to_bech32("user")?,
        ApproverRole::UnitManager,
    ))
}

/// The reference scenario: a 1,000,000-unit top allocation, fully cascaded
/// over two operating units, leaves nothing for a third.
#[test]
fn full_cascade_exhausts_parent() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let engine = open_engine(&temp_dir.path().join("full_cascade.db"))?;
    let tenants = provision_tenants(&engine.ledger)?;
    let creator = utils::new_uuid_to_bech32("user")?;

    let parent = engine.ledger.create(
        AllocationDraft::new()
            .budget(1_000_000, Currency::XOF)
            .from_tenant(&tenants.ministry)
            .to_tenant(&tenants.region)
            .created_by(&creator),
    )?;
    assert_eq!(parent.status, AllocationStatus::Pending);
    assert_eq!(parent.level, Level::Regional);

    let approver = regional_director()?;
    let parent = engine
        .machine
        .validate(&parent.id, ValidateAction::Approve, &approver, None)?;
    assert_eq!(parent.status, AllocationStatus::Approved);

    let parent = engine.machine.execute(&parent.id)?;
    assert_eq!(parent.status, AllocationStatus::Executed);

    let outcome = engine.cascade.distribute(
        &parent.id,
        &[
            DistributionProposal {
                target_tenant: tenants.crou_a.clone(),
                level: Level::Operating,
                amount: 600_000,
            },
            DistributionProposal {
                target_tenant: tenants.crou_b.clone(),
                level: Level::Operating,
                amount: 400_000,
            },
        ],
        false,
        &approver,
    )?;
    assert_eq!(outcome.children.len(), 2);
    assert_eq!(engine.ledger.available(&parent.id)?, 0);

    // one more unit than remains must fail, and fail whole
    let err = engine
        .cascade
        .distribute(
            &parent.id,
            &[DistributionProposal {
                target_tenant: tenants.crou_c.clone(),
                level: Level::Operating,
                amount: 1,
            }],
            false,
            &approver,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        AllocationError::DistributionExceedsParent {
            requested: 1,
            available: 0
        }
    ));
    assert_eq!(engine.ledger.child_ids(&parent.id)?.len(), 2);

    let view = engine.flow.flow(&parent.id)?;
    assert_eq!(view.allocated, 1_000_000);
    assert_eq!(view.transferred, 1_000_000);
    assert_eq!(view.available, 0);
    assert_eq!(view.per_child.len(), 2);

    Ok(())
}

/// Cancelling a pending child releases its reservation back to the parent,
/// observable through the flow aggregator.
#[test]
fn cancelling_a_child_releases_balance() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let engine = open_engine(&temp_dir.path().join("cancel_release.db"))?;
    let tenants = provision_tenants(&engine.ledger)?;
    let creator = utils::new_uuid_to_bech32("user")?;

    let parent = engine.ledger.create(
        AllocationDraft::new()
            .budget(1_000_000, Currency::XOF)
            .from_tenant(&tenants.ministry)
            .to_tenant(&tenants.region)
            .created_by(&creator),
    )?;
    let approver = regional_director()?;
    engine
        .machine
        .validate(&parent.id, ValidateAction::Approve, &approver, None)?;

    let outcome = engine.cascade.distribute(
        &parent.id,
        &[
            DistributionProposal {
                target_tenant: tenants.crou_a.clone(),
                level: Level::Operating,
                amount: 600_000,
            },
            DistributionProposal {
                target_tenant: tenants.crou_b.clone(),
                level: Level::Operating,
                amount: 400_000,
            },
        ],
        false,
        &approver,
    )?;

    let child_b = &outcome.children[1];
    let cancelled = engine
        .ledger
        .cancel(&child_b.id, &approver, "duplicate request")?;
    assert_eq!(cancelled.status, AllocationStatus::Cancelled);

    let view = engine.flow.flow(&parent.id)?;
    assert_eq!(view.transferred, 600_000);
    assert_eq!(view.available, 400_000);

    // the released slice is distributable again
    let retry = engine.cascade.distribute(
        &parent.id,
        &[DistributionProposal {
            target_tenant: tenants.crou_c.clone(),
            level: Level::Operating,
            amount: 400_000,
        }],
        false,
        &approver,
    )?;
    assert_eq!(retry.children.len(), 1);
    assert_eq!(engine.ledger.available(&parent.id)?, 0);

    Ok(())
}

#[test]
fn state_machine_rejects_illegal_paths() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let engine = open_engine(&temp_dir.path().join("illegal_paths.db"))?;
    let tenants = provision_tenants(&engine.ledger)?;
    let creator = utils::new_uuid_to_bech32("user")?;

    let alloc = engine.ledger.create(
        AllocationDraft::new()
            .budget(10_000, Currency::EUR)
            .from_tenant(&tenants.ministry)
            .to_tenant(&tenants.region)
            .created_by(&creator),
    )?;

    // executing a pending allocation is an illegal transition
    let err = engine.machine.execute(&alloc.id).unwrap_err();
    assert!(matches!(err, AllocationError::IllegalTransition { .. }));

    // wrong role for the level
    let wrong_role = unit_manager()?;
    let err = engine
        .machine
        .validate(&alloc.id, ValidateAction::Approve, &wrong_role, None)
        .unwrap_err();
    assert!(matches!(err, AllocationError::NotAuthorized { .. }));

    // first approval wins, second hits a terminal record
    let approver = regional_director()?;
    engine
        .machine
        .validate(&alloc.id, ValidateAction::Approve, &approver, None)?;
    let err = engine
        .machine
        .validate(&alloc.id, ValidateAction::Approve, &approver, None)
        .unwrap_err();
    assert!(matches!(err, AllocationError::AlreadyTerminal(_)));

    // cancelling an executed allocation is refused
    engine.machine.execute(&alloc.id)?;
    let err = engine
        .ledger
        .cancel(&alloc.id, &approver, "too late")
        .unwrap_err();
    assert!(matches!(err, AllocationError::IllegalTransition { .. }));

    Ok(())
}

struct CountingTransfer(Arc<AtomicU64>);

impl ResourceTransfer for CountingTransfer {
    fn transfer(
        &self,
        _allocation: &allocation_engine::Allocation,
    ) -> Result<(), AllocationError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Re-executing an executed allocation succeeds without a second transfer.
#[test]
fn execute_is_idempotent() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("idempotent.db"))?);
    db.clear()?;

    let ledger = Arc::new(AllocationLedger::new(db, EnginePolicy::default())?);
    let transfers = Arc::new(AtomicU64::new(0));
    let machine = ValidationStateMachine::new(
        ledger.clone(),
        ApproverPolicy::default(),
        Box::new(CountingTransfer(transfers.clone())),
    );

    let tenants = provision_tenants(&ledger)?;
    let creator = utils::new_uuid_to_bech32("user")?;
    let alloc = ledger.create(
        AllocationDraft::new()
            .stock(5_000, allocation_engine::StockUnit::Sack)
            .from_tenant(&tenants.ministry)
            .to_tenant(&tenants.region)
            .created_by(&creator),
    )?;

    let approver = regional_director()?;
    machine.validate(&alloc.id, ValidateAction::Approve, &approver, None)?;

    let first = machine.execute(&alloc.id)?;
    let second = machine.execute(&alloc.id)?;

    assert_eq!(first.status, AllocationStatus::Executed);
    assert_eq!(second.status, AllocationStatus::Executed);
    assert_eq!(transfers.load(Ordering::SeqCst), 1);

    Ok(())
}

#[test]
fn usage_is_bounded_by_children_reservations() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let engine = open_engine(&temp_dir.path().join("usage_bounds.db"))?;
    let tenants = provision_tenants(&engine.ledger)?;
    let creator = utils::new_uuid_to_bech32("user")?;

    let parent = engine.ledger.create(
        AllocationDraft::new()
            .budget(100_000, Currency::XOF)
            .from_tenant(&tenants.ministry)
            .to_tenant(&tenants.region)
            .created_by(&creator),
    )?;
    let approver = regional_director()?;
    engine
        .machine
        .validate(&parent.id, ValidateAction::Approve, &approver, None)?;

    engine.cascade.distribute(
        &parent.id,
        &[DistributionProposal {
            target_tenant: tenants.crou_a.clone(),
            level: Level::Operating,
            amount: 70_000,
        }],
        false,
        &approver,
    )?;

    // 30_000 headroom left beside the child's reservation
    engine.ledger.record_usage(&parent.id, 30_000)?;
    let err = engine.ledger.record_usage(&parent.id, 1).unwrap_err();
    assert!(matches!(
        err,
        AllocationError::InsufficientParentBalance {
            requested: 1,
            available: 0
        }
    ));

    let view = engine.flow.flow(&parent.id)?;
    assert_eq!(view.used, 30_000);
    assert_eq!(view.available, 0);

    Ok(())
}

/// A batch whose total wraps around u64 must be refused outright, not
/// slipped past the balance check as a tiny wrapped sum.
#[test]
fn overflowing_batch_total_is_refused() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let engine = open_engine(&temp_dir.path().join("overflow.db"))?;
    let tenants = provision_tenants(&engine.ledger)?;
    let creator = utils::new_uuid_to_bech32("user")?;

    let parent = engine.ledger.create(
        AllocationDraft::new()
            .budget(1_000_000, Currency::XOF)
            .from_tenant(&tenants.ministry)
            .to_tenant(&tenants.region)
            .created_by(&creator),
    )?;
    let approver = regional_director()?;
    engine
        .machine
        .validate(&parent.id, ValidateAction::Approve, &approver, None)?;

    let err = engine
        .cascade
        .distribute(
            &parent.id,
            &[
                DistributionProposal {
                    target_tenant: tenants.crou_a.clone(),
                    level: Level::Operating,
                    amount: u64::MAX,
                },
                DistributionProposal {
                    target_tenant: tenants.crou_b.clone(),
                    level: Level::Operating,
                    amount: 2,
                },
            ],
            false,
            &approver,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        AllocationError::DistributionExceedsParent { .. }
    ));
    assert_eq!(engine.ledger.child_ids(&parent.id)?.len(), 0);
    assert_eq!(engine.ledger.available(&parent.id)?, 1_000_000);

    Ok(())
}

#[test]
fn hierarchy_violations_are_refused() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let engine = open_engine(&temp_dir.path().join("hierarchy.db"))?;
    let tenants = provision_tenants(&engine.ledger)?;
    let creator = utils::new_uuid_to_bech32("user")?;

    // top -> operating skips a level
    let err = engine
        .ledger
        .create(
            AllocationDraft::new()
                .budget(1_000, Currency::XOF)
                .from_tenant(&tenants.ministry)
                .to_tenant(&tenants.crou_a)
                .created_by(&creator),
        )
        .unwrap_err();
    assert!(matches!(err, AllocationError::InvalidHierarchy { .. }));

    // peer transfers are off by default
    let err = engine
        .ledger
        .create(
            AllocationDraft::new()
                .budget(1_000, Currency::XOF)
                .from_tenant(&tenants.crou_a)
                .to_tenant(&tenants.crou_b)
                .created_by(&creator)
                .peer_transfer(),
        )
        .unwrap_err();
    assert!(matches!(err, AllocationError::InvalidLevel(_)));

    Ok(())
}

#[test]
fn ledger_queries_cover_history_pending_and_statistics() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let engine = open_engine(&temp_dir.path().join("queries.db"))?;
    let tenants = provision_tenants(&engine.ledger)?;
    let creator = utils::new_uuid_to_bech32("user")?;

    let first = engine.ledger.create(
        AllocationDraft::new()
            .budget(10_000, Currency::XOF)
            .from_tenant(&tenants.ministry)
            .to_tenant(&tenants.region)
            .created_by(&creator),
    )?;
    let second = engine.ledger.create(
        AllocationDraft::new()
            .stock(200, allocation_engine::StockUnit::Kilogram)
            .from_tenant(&tenants.ministry)
            .to_tenant(&tenants.region)
            .created_by(&creator),
    )?;

    let approver = regional_director()?;
    engine
        .machine
        .validate(&first.id, ValidateAction::Approve, &approver, None)?;

    let history = engine.ledger.history()?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first.id); // creation order preserved

    let pending = engine.ledger.pending()?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second.id);

    let by_tenant = engine
        .ledger
        .list_by_tenant(&tenants.region, Some(Level::Regional))?;
    assert_eq!(by_tenant.len(), 2);

    let summary = engine.ledger.summary(&tenants.region)?;
    assert_eq!(summary.budget.allocated, 10_000);
    assert_eq!(summary.stock.allocated, 200);

    let stats = engine.ledger.statistics()?;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_status.get("approved"), Some(&1));
    assert_eq!(stats.by_status.get("pending"), Some(&1));
    assert_eq!(stats.budget_allocated, 10_000);

    Ok(())
}
