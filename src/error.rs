//! Engine error taxonomy. Every variant is a deterministic validation
//! failure surfaced to the caller, except `Store` and `Codec` which wrap
//! infrastructure faults.

#[derive(thiserror::Error, Debug)]
pub enum AllocationError {
    #[error("target level {target_level} is not a legal child of source level {source_level}")]
    InvalidHierarchy {
        source_level: String,
        target_level: String,
    },
    #[error("level is not valid here: {0}")]
    InvalidLevel(String),
    #[error("parent has insufficient distributable balance: requested {requested}, available {available}")]
    InsufficientParentBalance { requested: u64, available: u64 },
    #[error("distribution batch total {requested} exceeds parent available {available}")]
    DistributionExceedsParent { requested: u64, available: u64 },
    #[error("amount must be strictly positive, got {0}")]
    InvalidAmount(u64),
    #[error("draft is incomplete: {0}")]
    InvalidDraft(String),
    #[error("illegal transition from {from} via {attempted}")]
    IllegalTransition { from: String, attempted: String },
    #[error("actor role {actual} does not match required approver role {required}")]
    NotAuthorized { required: String, actual: String },
    #[error("record {0} is already in a terminal state")]
    AlreadyTerminal(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Store(#[from] sled::Error),
    #[error("serialization failure: {0}")]
    Codec(String),
}

impl AllocationError {
    /// Stable machine-readable code, used by the wire contract.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidHierarchy { .. } => "InvalidHierarchy",
            Self::InvalidLevel(_) => "InvalidLevel",
            Self::InsufficientParentBalance { .. } => "InsufficientParentBalance",
            Self::DistributionExceedsParent { .. } => "DistributionExceedsParent",
            Self::InvalidAmount(_) => "InvalidAmount",
            Self::InvalidDraft(_) => "InvalidDraft",
            Self::IllegalTransition { .. } => "IllegalTransition",
            Self::NotAuthorized { .. } => "NotAuthorized",
            Self::AlreadyTerminal(_) => "AlreadyTerminal",
            Self::NotFound(_) => "NotFound",
            Self::Store(_) => "Store",
            Self::Codec(_) => "Codec",
        }
    }
}
