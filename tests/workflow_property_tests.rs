//! Property-based tests for workflow action-log replay.
//!
//! Instance state is never stored; it is derived by replaying the
//! append-only action log. Bugs in the replay corrupt every workflow, so
//! these tests check invariants that must hold for arbitrary logs, not just
//! hand-picked sequences.
//!
//! These cover:
//!
//! 1. Determinism - the same log always replays to the same state
//! 2. Terminal state stability - nothing appended after a terminal action
//!    changes the derived status
//! 3. Base case - an empty log is a pending instance at step 0
//! 4. Delegation neutrality - delegate actions never move the step cursor
//! 5. Serialization correctness - critical for the persisted log
//!
//! What these DON'T cover (deliberately): authorization and persistence,
//! which live in the runner service and are exercised in integration tests.

use allocation_engine::{
    ApproverRole, InstanceStatus, TimeStamp, WorkflowAction, WorkflowActionKind,
    WorkflowDefinition, WorkflowStep, workflow::replay,
};
use proptest::prelude::*;

fn action_kind_strategy() -> impl Strategy<Value = WorkflowActionKind> {
    prop_oneof![
        Just(WorkflowActionKind::Start),
        Just(WorkflowActionKind::Approve),
        Just(WorkflowActionKind::Reject),
        Just(WorkflowActionKind::Cancel),
        Just(WorkflowActionKind::Comment),
        any::<u32>().prop_map(|n| WorkflowActionKind::Delegate {
            to: format!("user_{n}"),
        }),
    ]
}

fn action(seq: u64, kind: WorkflowActionKind) -> WorkflowAction {
    WorkflowAction {
        instance_id: "wfi1prop".into(),
        seq,
        actor: "user1prop".into(),
        step: 0,
        kind,
        comment: None,
        at: TimeStamp::new(),
    }
}

/// Logs that begin with Start, as every real instance's log does.
fn started_log_strategy() -> impl Strategy<Value = Vec<WorkflowAction>> {
    prop::collection::vec(action_kind_strategy(), 0..=9).prop_map(|kinds| {
        let mut log = vec![action(0, WorkflowActionKind::Start)];
        for (i, kind) in kinds.into_iter().enumerate() {
            log.push(action(i as u64 + 1, kind));
        }
        log
    })
}

fn definition() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "prop definition",
        vec![
            WorkflowStep::new(0, ApproverRole::UnitManager).delegatable(),
            WorkflowStep::new(1, ApproverRole::RegionalDirector)
                .optional()
                .skippable(),
            WorkflowStep::new(2, ApproverRole::MinistryController),
        ],
    )
    .unwrap()
}

proptest! {
    /// Property: replay is deterministic and side-effect free.
    #[test]
    fn prop_replay_is_deterministic(log in started_log_strategy()) {
        let def = definition();

        let first = replay(&def, &log);
        let second = replay(&def, &log);
        let third = replay(&def, &log);

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&second, &third);
    }

    /// Property: once a log reaches a terminal status, appending any suffix
    /// leaves the derived status unchanged. Workflow endpoints are final.
    #[test]
    fn prop_terminal_states_are_stable(
        log in started_log_strategy(),
        suffix in prop::collection::vec(action_kind_strategy(), 1..=5),
    ) {
        let def = definition();
        let state = replay(&def, &log);

        if state.status.is_terminal() {
            let mut extended = log.clone();
            for (i, kind) in suffix.into_iter().enumerate() {
                extended.push(action(log.len() as u64 + i as u64, kind));
            }

            prop_assert_eq!(replay(&def, &extended).status, state.status);
        }
    }

    /// Property: the step cursor never leaves the definition's bounds while
    /// the instance is in progress.
    #[test]
    fn prop_step_index_stays_in_bounds(log in started_log_strategy()) {
        let def = definition();
        let state = replay(&def, &log);

        if state.status == InstanceStatus::InProgress {
            prop_assert!(state.step_index < def.steps.len());
        }
    }

    /// Property: delegation reassigns without advancing. A log and the same
    /// log with delegate actions inserted derive the same step cursor.
    #[test]
    fn prop_delegation_does_not_advance(approvals in 0usize..=2) {
        let def = definition();

        let mut plain = vec![action(0, WorkflowActionKind::Start)];
        let mut delegated = vec![action(0, WorkflowActionKind::Start)];
        for i in 0..approvals {
            delegated.push(action(
                delegated.len() as u64,
                WorkflowActionKind::Delegate { to: format!("user_{i}") },
            ));
            plain.push(action(plain.len() as u64, WorkflowActionKind::Approve));
            delegated.push(action(delegated.len() as u64, WorkflowActionKind::Approve));
        }

        let plain_state = replay(&def, &plain);
        let delegated_state = replay(&def, &delegated);

        prop_assert_eq!(plain_state.status, delegated_state.status);
        prop_assert_eq!(plain_state.step_index, delegated_state.step_index);
    }

    /// Property: the persisted encoding round-trips every action exactly.
    #[test]
    fn prop_action_log_encoding_round_trips(log in started_log_strategy()) {
        for action in &log {
            let (hash, bytes) = action.build().unwrap();
            let decoded: WorkflowAction = minicbor::decode(&bytes).unwrap();

            prop_assert_eq!(&decoded, action);
            prop_assert_eq!(hash.len(), 64); // sha256 hex digest
        }
    }
}
