//! Engine configuration: the level-to-approver-role table and policy
//! switches. Loaded from JSON by the host; defaults mirror the portal's
//! production setup.

use crate::tenant::Level;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ApproverRole {
    #[n(0)]
    MinistryController,
    #[n(1)]
    RegionalDirector,
    #[n(2)]
    UnitManager,
}

impl ApproverRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ApproverRole::MinistryController => "ministry_controller",
            ApproverRole::RegionalDirector => "regional_director",
            ApproverRole::UnitManager => "unit_manager",
        }
    }
}

/// Someone acting on the engine: a creator, approver or workflow actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String, // bech32 encoded uuid7
    pub role: ApproverRole,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: ApproverRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Which role may validate allocations at each hierarchy level. This is the
/// explicit table replacing ad-hoc role checks in handlers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ApproverPolicy {
    pub top: ApproverRole,
    pub regional: ApproverRole,
    pub operating: ApproverRole,
}

impl ApproverPolicy {
    pub fn required_for(&self, level: Level) -> ApproverRole {
        match level {
            Level::Top => self.top,
            Level::Regional => self.regional,
            Level::Operating => self.operating,
        }
    }
}

impl Default for ApproverPolicy {
    fn default() -> Self {
        Self {
            top: ApproverRole::MinistryController,
            regional: ApproverRole::RegionalDirector,
            operating: ApproverRole::UnitManager,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EnginePolicy {
    /// Same-level transfers are refused unless this is on AND the draft
    /// carries the explicit peer flag.
    #[serde(default)]
    pub allow_peer_transfers: bool,
}
