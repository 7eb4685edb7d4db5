//! Core allocation entity and the draft builder used to create one.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::AllocationError;
use crate::tenant::Level;

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
)]
pub enum Currency {
    #[n(0)]
    XOF,
    #[n(1)]
    EUR,
    #[n(2)]
    USD,
}

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
)]
#[serde(rename_all = "lowercase")]
pub enum StockUnit {
    #[n(0)]
    Kilogram,
    #[n(1)]
    Litre,
    #[n(2)]
    Sack,
    #[n(3)]
    Piece,
}

/// Discriminates monetary from physical allocations. Magnitudes live on the
/// allocation itself; the kind only carries the denomination.
#[derive(
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
)]
#[serde(rename_all = "lowercase")]
pub enum AllocationKind {
    #[n(0)]
    Budget {
        #[n(0)]
        currency: Currency,
    },
    #[n(1)]
    Stock {
        #[n(0)]
        unit: StockUnit,
    },
}

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Executed,
    #[n(4)]
    Cancelled,
}

impl AllocationStatus {
    /// Legal lifecycle edges. Everything not listed is an illegal transition.
    pub fn can_transition(self, to: AllocationStatus) -> bool {
        use AllocationStatus::*;
        matches!(
            (self, to),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Approved, Executed)
                | (Approved, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AllocationStatus::Rejected | AllocationStatus::Executed | AllocationStatus::Cancelled
        )
    }

    /// Live allocations hold a reservation against their parent's balance.
    /// Rejected and cancelled ones have released it.
    pub fn holds_reservation(self) -> bool {
        matches!(
            self,
            AllocationStatus::Pending | AllocationStatus::Approved | AllocationStatus::Executed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStatus::Pending => "pending",
            AllocationStatus::Approved => "approved",
            AllocationStatus::Rejected => "rejected",
            AllocationStatus::Executed => "executed",
            AllocationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl serde::Serialize for TimeStamp<Utc> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

/// A budget or stock grant from one tenant to another, optionally derived
/// from a parent allocation one level above.
///
/// `allocated` is immutable once set. `used` only grows, driven by external
/// consumption events. The transferred total is never stored; it is always
/// recomputed as the sum of live children so cancellations release balance
/// structurally.
#[derive(minicbor::Encode, minicbor::Decode, serde::Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub kind: AllocationKind,
    #[n(2)]
    pub level: Level,
    #[n(3)]
    pub source_tenant: String,
    #[n(4)]
    pub target_tenant: String,
    #[n(5)]
    pub parent_id: Option<String>,
    #[n(6)]
    pub peer_transfer: bool,
    #[n(7)]
    pub allocated: u64,
    #[n(8)]
    pub used: u64,
    #[n(9)]
    pub status: AllocationStatus,
    #[n(10)]
    pub created_by: String,
    #[n(11)]
    pub validated_by: Option<String>,
    #[n(12)]
    pub created_at: TimeStamp<Utc>,
    #[n(13)]
    pub validated_at: Option<TimeStamp<Utc>>,
    #[n(14)]
    pub executed_at: Option<TimeStamp<Utc>>,
    #[n(15)]
    pub status_reason: Option<String>,
}

impl Allocation {
    /// Portion not yet consumed by this allocation's own usage. Children's
    /// reservations are tracked separately by the ledger's child index.
    pub fn unconsumed(&self) -> u64 {
        self.allocated.saturating_sub(self.used)
    }
}

// Also used for constructing drafts; the ledger turns a validated draft
// into a persisted Allocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AllocationDraft {
    kind: Option<AllocationKind>,
    source_tenant: Option<String>,
    target_tenant: Option<String>,
    parent_id: Option<String>,
    peer_transfer: bool,
    amount: u64,
    created_by: Option<String>,
}

impl AllocationDraft {
    /// Construct a new builder object, this becomes the basis for a draft
    pub fn new() -> Self {
        Self::default()
    }
    pub fn budget(mut self, amount: u64, currency: Currency) -> Self {
        self.kind = Some(AllocationKind::Budget { currency });
        self.amount = amount;
        self
    }
    pub fn stock(mut self, quantity: u64, unit: StockUnit) -> Self {
        self.kind = Some(AllocationKind::Stock { unit });
        self.amount = quantity;
        self
    }
    pub fn from_tenant(mut self, tenant_id: &str) -> Self {
        self.source_tenant = Some(tenant_id.to_string());
        self
    }
    pub fn to_tenant(mut self, tenant_id: &str) -> Self {
        self.target_tenant = Some(tenant_id.to_string());
        self
    }
    pub fn under_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }
    pub fn peer_transfer(mut self) -> Self {
        self.peer_transfer = true;
        self
    }
    pub fn created_by(mut self, actor_id: &str) -> Self {
        self.created_by = Some(actor_id.to_string());
        self
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
    pub fn source(&self) -> Option<&str> {
        self.source_tenant.as_deref()
    }
    pub fn target(&self) -> Option<&str> {
        self.target_tenant.as_deref()
    }
    pub fn is_peer_transfer(&self) -> bool {
        self.peer_transfer
    }
    pub fn amount(&self) -> u64 {
        self.amount
    }

    // Checks fields, then finalises into a pending allocation at the given
    // level. The ledger supplies the id and the hierarchy-derived level.
    pub fn validate_and_finalise(
        self,
        id: String,
        level: Level,
    ) -> Result<Allocation, AllocationError> {
        let Some(kind) = self.kind else {
            return Err(AllocationError::InvalidDraft("allocation kind not set".into()));
        };
        if self.amount == 0 {
            return Err(AllocationError::InvalidAmount(self.amount));
        }
        let Some(source_tenant) = self.source_tenant else {
            return Err(AllocationError::InvalidDraft("source tenant not set".into()));
        };
        let Some(target_tenant) = self.target_tenant else {
            return Err(AllocationError::InvalidDraft("target tenant not set".into()));
        };
        let Some(created_by) = self.created_by else {
            return Err(AllocationError::InvalidDraft("creator not set".into()));
        };

        Ok(Allocation {
            id,
            kind,
            level,
            source_tenant,
            target_tenant,
            parent_id: self.parent_id,
            peer_transfer: self.peer_transfer,
            allocated: self.amount,
            used: 0,
            status: AllocationStatus::Pending,
            created_by,
            validated_by: None,
            created_at: TimeStamp::new(),
            validated_at: None,
            executed_at: None,
            status_reason: None,
        })
    }
}
