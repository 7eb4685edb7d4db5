//! JSON wire contract. The engine is consumed over HTTP by thin client
//! wrappers; the listener itself is host glue, but the payload shapes and
//! the error mapping live here so every internal error kind surfaces 1:1.
//!
//! Every response wraps its payload in `{ data, message? }`; list responses
//! additionally carry a `count`. Errors are `{ error, message, details? }`
//! plus an HTTP status.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::allocation::{AllocationDraft, Currency, StockUnit};
use crate::cascade::DistributionProposal;
use crate::config::ApproverRole;
use crate::error::AllocationError;
use crate::state::ValidateAction;
use crate::workflow::{WorkflowCommand, WorkflowDefinition, WorkflowStep};

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data,
            message: None,
        }
    }
    pub fn with_message(data: T, message: &str) -> Self {
        Self {
            data,
            message: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiListResponse<T> {
    pub data: Vec<T>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiListResponse<T> {
    pub fn ok(data: Vec<T>) -> Self {
        let count = data.len();
        Self {
            data,
            count,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// HTTP status for each engine error kind. Total: new variants fail to
/// compile until they are mapped.
pub fn http_status(err: &AllocationError) -> u16 {
    match err {
        AllocationError::NotFound(_) => 404,
        AllocationError::NotAuthorized { .. } => 403,
        AllocationError::IllegalTransition { .. } | AllocationError::AlreadyTerminal(_) => 409,
        AllocationError::InvalidHierarchy { .. }
        | AllocationError::InvalidLevel(_)
        | AllocationError::InvalidAmount(_)
        | AllocationError::InvalidDraft(_)
        | AllocationError::InsufficientParentBalance { .. }
        | AllocationError::DistributionExceedsParent { .. } => 422,
        AllocationError::Store(_) | AllocationError::Codec(_) => 500,
    }
}

impl From<&AllocationError> for ApiError {
    fn from(err: &AllocationError) -> Self {
        let details = match err {
            AllocationError::InsufficientParentBalance {
                requested,
                available,
            }
            | AllocationError::DistributionExceedsParent {
                requested,
                available,
            } => Some(json!({ "requested": requested, "available": available })),
            AllocationError::IllegalTransition { from, attempted } => {
                Some(json!({ "from": from, "attempted": attempted }))
            }
            AllocationError::NotAuthorized { required, actual } => {
                Some(json!({ "required": required, "actual": actual }))
            }
            AllocationError::InvalidHierarchy {
                source_level,
                target_level,
            } => Some(json!({ "source": source_level, "target": target_level })),
            _ => None,
        };
        Self {
            error: err.code().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

// request payloads, one per observed route

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBudgetAllocationRequest {
    pub source_tenant: String,
    pub target_tenant: String,
    pub amount: u64,
    pub currency: Currency,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub peer_transfer: bool,
}

impl CreateBudgetAllocationRequest {
    pub fn into_draft(self, created_by: &str) -> AllocationDraft {
        let mut draft = AllocationDraft::new()
            .budget(self.amount, self.currency)
            .from_tenant(&self.source_tenant)
            .to_tenant(&self.target_tenant)
            .created_by(created_by);
        if let Some(parent_id) = &self.parent_id {
            draft = draft.under_parent(parent_id);
        }
        if self.peer_transfer {
            draft = draft.peer_transfer();
        }
        draft
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStockAllocationRequest {
    pub source_tenant: String,
    pub target_tenant: String,
    pub quantity: u64,
    pub unit: StockUnit,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub peer_transfer: bool,
}

impl CreateStockAllocationRequest {
    pub fn into_draft(self, created_by: &str) -> AllocationDraft {
        let mut draft = AllocationDraft::new()
            .stock(self.quantity, self.unit)
            .from_tenant(&self.source_tenant)
            .to_tenant(&self.target_tenant)
            .created_by(created_by);
        if let Some(parent_id) = &self.parent_id {
            draft = draft.under_parent(parent_id);
        }
        if self.peer_transfer {
            draft = draft.peer_transfer();
        }
        draft
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateRequest {
    pub action: ValidateAction,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeRequest {
    pub parent_id: String,
    pub proposals: Vec<DistributionProposal>,
    #[serde(default)]
    pub validate_parent: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepRequest {
    pub order: u32,
    pub role: ApproverRole,
    #[serde(default = "default_true")]
    pub is_required: bool,
    #[serde(default)]
    pub can_skip: bool,
    #[serde(default = "default_true")]
    pub can_reject: bool,
    #[serde(default)]
    pub can_delegate: bool,
}

fn default_true() -> bool {
    true
}

impl WorkflowStepRequest {
    fn into_step(self) -> WorkflowStep {
        WorkflowStep {
            order: self.order,
            role: self.role,
            is_required: self.is_required,
            can_skip: self.can_skip,
            can_reject: self.can_reject,
            can_delegate: self.can_delegate,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    pub name: String,
    pub entity_ref: String,
    pub steps: Vec<WorkflowStepRequest>,
}

impl StartWorkflowRequest {
    pub fn into_definition(self) -> Result<WorkflowDefinition, AllocationError> {
        let steps = self
            .steps
            .into_iter()
            .map(WorkflowStepRequest::into_step)
            .collect();
        WorkflowDefinition::new(&self.name, steps)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowActionRequest {
    pub action: WorkflowCommand,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub delegate_to: Option<String>,
}
