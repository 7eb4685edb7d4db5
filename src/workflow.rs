//! Generic approval workflow runner, independent of allocation specifics.
//!
//! An instance never stores its status: status is derived by replaying the
//! append-only action log against the step definition, and every action is
//! persisted to the log tree in the same transaction that updates the
//! instance (log-then-apply). A crash between the two is recoverable by
//! replaying the log.

use std::sync::Arc;

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use tracing::info;

use crate::allocation::TimeStamp;
use crate::config::{Actor, ApproverRole};
use crate::error::AllocationError;
use crate::utils::{from_cbor, new_uuid_to_bech32, to_cbor};

pub const WORKFLOW_INSTANCES_TREE: &str = "workflow_instances";
pub const WORKFLOW_ACTIONS_TREE: &str = "workflow_actions";

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize)]
pub struct WorkflowStep {
    #[n(0)]
    pub order: u32,
    #[n(1)]
    pub role: ApproverRole,
    #[n(2)]
    pub is_required: bool,
    #[n(3)]
    pub can_skip: bool,
    #[n(4)]
    pub can_reject: bool,
    #[n(5)]
    pub can_delegate: bool,
}

impl WorkflowStep {
    pub fn new(order: u32, role: ApproverRole) -> Self {
        Self {
            order,
            role,
            is_required: true,
            can_skip: false,
            can_reject: true,
            can_delegate: false,
        }
    }
    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }
    pub fn skippable(mut self) -> Self {
        self.can_skip = true;
        self
    }
    pub fn no_reject(mut self) -> Self {
        self.can_reject = false;
        self
    }
    pub fn delegatable(mut self) -> Self {
        self.can_delegate = true;
        self
    }

    /// Steps that are optional and skippable are passed over silently when
    /// the previous step approves.
    fn auto_skipped(&self) -> bool {
        !self.is_required && self.can_skip
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize)]
pub struct WorkflowDefinition {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(name: &str, mut steps: Vec<WorkflowStep>) -> Result<Self, AllocationError> {
        if steps.is_empty() {
            return Err(AllocationError::InvalidLevel(
                "workflow definition needs at least one step".into(),
            ));
        }
        steps.sort_by_key(|s| s.order);
        let id =
            new_uuid_to_bech32("wf").map_err(|e| AllocationError::Codec(e.to_string()))?;
        Ok(Self {
            id,
            name: name.to_string(),
            steps,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowActionKind {
    #[n(0)]
    Start,
    #[n(1)]
    Approve,
    #[n(2)]
    Reject,
    #[n(3)]
    Delegate {
        #[n(0)]
        to: String,
    },
    #[n(4)]
    Cancel,
    #[n(5)]
    Comment,
}

/// One immutable entry of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize)]
pub struct WorkflowAction {
    #[n(0)]
    pub instance_id: String,
    #[n(1)]
    pub seq: u64,
    #[n(2)]
    pub actor: String,
    #[n(3)]
    pub step: u32, // step index when the action was recorded
    #[n(4)]
    pub kind: WorkflowActionKind,
    #[n(5)]
    pub comment: Option<String>,
    #[n(6)]
    pub at: TimeStamp<Utc>,
}

impl WorkflowAction {
    /// Content hash of the encoded record, used in audit views so a log
    /// entry can be referenced without re-serializing it.
    pub fn build(&self) -> Result<(String, Vec<u8>), AllocationError> {
        let cbor = to_cbor(self)?;
        let hash = sha256::digest(&cbor);
        Ok((hash, cbor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    InProgress,
    Completed,
    Rejected,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Rejected | InstanceStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::InProgress => "in_progress",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Rejected => "rejected",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

/// Point-in-time view of a replayed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayState {
    pub status: InstanceStatus,
    pub step_index: usize,
    /// Assignee override from a delegate action on the current step.
    pub delegate: Option<String>,
}

/// Derive instance state purely from the definition and the action log.
/// Deterministic: the same log always yields the same state.
pub fn replay(definition: &WorkflowDefinition, actions: &[WorkflowAction]) -> ReplayState {
    let mut state = ReplayState {
        status: InstanceStatus::Pending,
        step_index: 0,
        delegate: None,
    };

    for action in actions {
        if state.status.is_terminal() {
            break;
        }
        match &action.kind {
            WorkflowActionKind::Start => {
                state.status = InstanceStatus::InProgress;
                state.step_index = first_active_step(definition, 0)
                    .unwrap_or(definition.steps.len());
                if state.step_index == definition.steps.len() {
                    // nothing to approve, degenerate definition completes
                    state.status = InstanceStatus::Completed;
                }
            }
            WorkflowActionKind::Approve => {
                match first_active_step(definition, state.step_index + 1) {
                    Some(next) => {
                        state.step_index = next;
                        state.delegate = None;
                    }
                    None => state.status = InstanceStatus::Completed,
                }
            }
            WorkflowActionKind::Reject => state.status = InstanceStatus::Rejected,
            WorkflowActionKind::Cancel => state.status = InstanceStatus::Cancelled,
            WorkflowActionKind::Delegate { to } => state.delegate = Some(to.clone()),
            WorkflowActionKind::Comment => {}
        }
    }
    state
}

fn first_active_step(definition: &WorkflowDefinition, from: usize) -> Option<usize> {
    definition
        .steps
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, s)| !s.auto_skipped())
        .map(|(i, _)| i)
}

/// A running approval process attached to one entity. The embedded action
/// vector mirrors the log tree; the log tree is authoritative for recovery.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, serde::Serialize)]
pub struct WorkflowInstance {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub definition: WorkflowDefinition,
    #[n(2)]
    pub entity_ref: String, // e.g. an allocation id
    #[n(3)]
    pub initiated_by: String,
    #[n(4)]
    pub actions: Vec<WorkflowAction>,
}

impl WorkflowInstance {
    pub fn current_state(&self) -> ReplayState {
        replay(&self.definition, &self.actions)
    }

    pub fn status(&self) -> InstanceStatus {
        self.current_state().status
    }
}

/// Commands a caller may issue against a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowCommand {
    Approve,
    Reject,
    Delegate,
    Cancel,
    Comment,
}

pub struct WorkflowRunner {
    instances: sled::Tree,
    actions: sled::Tree,
}

impl WorkflowRunner {
    pub fn new(db: Arc<sled::Db>) -> Result<Self, AllocationError> {
        let instances = db.open_tree(WORKFLOW_INSTANCES_TREE)?;
        let actions = db.open_tree(WORKFLOW_ACTIONS_TREE)?;
        Ok(Self { instances, actions })
    }

    /// Create an instance at step 0 and log the `Start` action.
    pub fn start(
        &self,
        definition: WorkflowDefinition,
        entity_ref: &str,
        initiator: &Actor,
    ) -> Result<WorkflowInstance, AllocationError> {
        let id =
            new_uuid_to_bech32("wfi").map_err(|e| AllocationError::Codec(e.to_string()))?;
        let mut instance = WorkflowInstance {
            id: id.clone(),
            definition,
            entity_ref: entity_ref.to_string(),
            initiated_by: initiator.id.clone(),
            actions: vec![],
        };
        let start = WorkflowAction {
            instance_id: id.clone(),
            seq: 0,
            actor: initiator.id.clone(),
            step: 0,
            kind: WorkflowActionKind::Start,
            comment: None,
            at: TimeStamp::new(),
        };
        instance.actions.push(start.clone());

        let action_bytes = to_cbor(&start)?;
        let instance_bytes = to_cbor(&instance)?;
        self.commit(&instance.id, start.seq, action_bytes, instance_bytes)?;

        info!(instance = %instance.id, entity = %instance.entity_ref, "workflow started");
        Ok(instance)
    }

    pub fn get(&self, instance_id: &str) -> Result<WorkflowInstance, AllocationError> {
        match self.instances.get(instance_id.as_bytes())? {
            Some(bytes) => from_cbor(&bytes),
            None => Err(AllocationError::NotFound(instance_id.to_string())),
        }
    }

    /// The authoritative action log, replayable independently of the
    /// instance record.
    pub fn action_log(&self, instance_id: &str) -> Result<Vec<WorkflowAction>, AllocationError> {
        let prefix = format!("{instance_id}/");
        let mut log = vec![];
        for entry in self.actions.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry?;
            log.push(from_cbor::<WorkflowAction>(&bytes)?);
        }
        log.sort_by_key(|a| a.seq);
        Ok(log)
    }

    /// Apply one command. The action record is appended to the log and the
    /// instance is rewritten in the same transaction.
    pub fn act(
        &self,
        instance_id: &str,
        command: WorkflowCommand,
        actor: &Actor,
        comment: Option<&str>,
        delegate_to: Option<&str>,
    ) -> Result<WorkflowInstance, AllocationError> {
        let mut instance = self.get(instance_id)?;
        let state = instance.current_state();

        if state.status.is_terminal() {
            return Err(AllocationError::AlreadyTerminal(instance.id.clone()));
        }
        let step = &instance.definition.steps[state.step_index];

        let is_assignee = match &state.delegate {
            Some(delegate) => actor.id == *delegate,
            None => actor.role == step.role,
        };
        let is_initiator = actor.id == instance.initiated_by;

        let kind = match command {
            WorkflowCommand::Approve => {
                if !is_assignee {
                    return Err(AllocationError::NotAuthorized {
                        required: step.role.as_str().into(),
                        actual: actor.role.as_str().into(),
                    });
                }
                WorkflowActionKind::Approve
            }
            WorkflowCommand::Reject => {
                if !is_assignee {
                    return Err(AllocationError::NotAuthorized {
                        required: step.role.as_str().into(),
                        actual: actor.role.as_str().into(),
                    });
                }
                if !step.can_reject {
                    return Err(AllocationError::IllegalTransition {
                        from: state.status.as_str().into(),
                        attempted: "reject".into(),
                    });
                }
                WorkflowActionKind::Reject
            }
            WorkflowCommand::Delegate => {
                if !is_assignee {
                    return Err(AllocationError::NotAuthorized {
                        required: step.role.as_str().into(),
                        actual: actor.role.as_str().into(),
                    });
                }
                if !step.can_delegate {
                    return Err(AllocationError::IllegalTransition {
                        from: state.status.as_str().into(),
                        attempted: "delegate".into(),
                    });
                }
                let to = delegate_to.ok_or_else(|| {
                    AllocationError::NotFound("delegate target not provided".into())
                })?;
                WorkflowActionKind::Delegate { to: to.to_string() }
            }
            WorkflowCommand::Cancel => {
                if !is_assignee && !is_initiator {
                    return Err(AllocationError::NotAuthorized {
                        required: step.role.as_str().into(),
                        actual: actor.role.as_str().into(),
                    });
                }
                WorkflowActionKind::Cancel
            }
            WorkflowCommand::Comment => {
                if !is_assignee && !is_initiator {
                    return Err(AllocationError::NotAuthorized {
                        required: step.role.as_str().into(),
                        actual: actor.role.as_str().into(),
                    });
                }
                WorkflowActionKind::Comment
            }
        };

        let action = WorkflowAction {
            instance_id: instance.id.clone(),
            seq: instance.actions.len() as u64,
            actor: actor.id.clone(),
            step: step.order,
            kind,
            comment: comment.map(str::to_string),
            at: TimeStamp::new(),
        };
        instance.actions.push(action.clone());

        let action_bytes = to_cbor(&action)?;
        let instance_bytes = to_cbor(&instance)?;
        self.commit(&instance.id, action.seq, action_bytes, instance_bytes)?;

        info!(
            instance = %instance.id,
            actor = %actor.id,
            status = instance.status().as_str(),
            "workflow action applied"
        );
        Ok(instance)
    }

    // log entry first, instance record second, one transaction. `seq` was
    // derived from a read made before this call; the stored record is
    // re-checked here so a concurrent appender cannot be overwritten.
    fn commit(
        &self,
        instance_id: &str,
        seq: u64,
        action_bytes: Vec<u8>,
        instance_bytes: Vec<u8>,
    ) -> Result<(), AllocationError> {
        let log_key = format!("{instance_id}/{seq:08}");
        let res: Result<(), TransactionError<AllocationError>> = (&self.actions, &self.instances)
            .transaction(|(action_t, instance_t)| {
                let stored_len = match instance_t.get(instance_id.as_bytes())? {
                    Some(bytes) => {
                        let stored: WorkflowInstance =
                            from_cbor(&bytes).map_err(ConflictableTransactionError::Abort)?;
                        stored.actions.len() as u64
                    }
                    None => 0,
                };
                if stored_len != seq {
                    return Err(ConflictableTransactionError::Abort(
                        AllocationError::IllegalTransition {
                            from: format!("log length {stored_len}"),
                            attempted: format!("append at {seq}"),
                        },
                    ));
                }
                action_t.insert(log_key.as_bytes(), action_bytes.clone())?;
                instance_t.insert(instance_id.as_bytes(), instance_bytes.clone())?;
                Ok(())
            });
        match res {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(AllocationError::Store(e)),
        }
    }
}
