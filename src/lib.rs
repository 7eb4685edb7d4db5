//! Hierarchical resource-allocation engine: budget and stock quantities
//! distributed through a three-level tenant hierarchy with cascading
//! parent/child allocations, approval state machines and utilization
//! accounting. Persistence is a shared sled database; every
//! invariant-bearing write runs in a serializable transaction.

pub mod allocation;
pub mod api;
pub mod cascade;
pub mod config;
pub mod error;
pub mod flow;
pub mod ledger;
pub mod state;
pub mod tenant;
pub mod utils;
pub mod workflow;

pub use allocation::{
    Allocation, AllocationDraft, AllocationKind, AllocationStatus, Currency, StockUnit, TimeStamp,
};
pub use cascade::{CascadeDistributor, CascadeOutcome, DistributionProposal};
pub use config::{Actor, ApproverPolicy, ApproverRole, EnginePolicy};
pub use error::AllocationError;
pub use flow::{AlertLevel, BudgetFlow, BudgetFlowAggregator, utilization_rate};
pub use ledger::{AllocationLedger, KindTotals, LedgerStatistics, TenantSummary};
pub use state::{NoopTransfer, ResourceTransfer, ValidateAction, ValidationStateMachine};
pub use tenant::{Level, TenantNode, TenantRegistry};
pub use workflow::{
    InstanceStatus, WorkflowAction, WorkflowActionKind, WorkflowCommand, WorkflowDefinition,
    WorkflowInstance, WorkflowRunner, WorkflowStep,
};
