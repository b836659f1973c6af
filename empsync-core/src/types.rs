//! Domain types shared by the source (HR) and target (Payroll) sides.
//!
//! Every persisted type is serializable via serde + serde_json. Field values are
//! carried as [`serde_json::Value`] so the sync core never needs to know the
//! employee schema.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field name → new value.
pub type FieldMap = BTreeMap<String, Value>;

/// Current on-disk payload schema. Payloads with a newer version are refused.
pub const SCHEMA_VERSION: u32 = 1;

pub const SOURCE_SYSTEM: &str = "hr";
pub const TARGET_SYSTEM: &str = "payroll";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of an employee record, shared by both stores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub const MAX_LEN: usize = 64;

    /// 1..=64 characters of ASCII alphanumerics, `-` or `_`.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= Self::MAX_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Content address of a [`SyncPayload`]: lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadId(pub String);

impl PayloadId {
    /// First 12 hex digits, for tables and log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for PayloadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PayloadId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of mutation observed on the source entity table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Any operation name this build does not know, kept verbatim. Never
    /// produced locally; a foreign payload still parses, still hashes to the
    /// sender's id, and the validator can report it.
    Unrecognized(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Unrecognized(name) => name,
        }
    }
}

impl From<String> for Operation {
    fn from(name: String) -> Self {
        match name.as_str() {
            "CREATE" => Operation::Create,
            "UPDATE" => Operation::Update,
            "DELETE" => Operation::Delete,
            _ => Operation::Unrecognized(name),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Unrecognized(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim lifecycle of a change entry: `Unclaimed → Claimed → Confirmed`, never back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "payload_id", rename_all = "UPPERCASE")]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Claimed(PayloadId),
    Confirmed(PayloadId),
}

impl ClaimState {
    pub fn is_unclaimed(&self) -> bool {
        matches!(self, ClaimState::Unclaimed)
    }

    pub fn payload_id(&self) -> Option<&PayloadId> {
        match self {
            ClaimState::Unclaimed => None,
            ClaimState::Claimed(id) | ClaimState::Confirmed(id) => Some(id),
        }
    }

    /// Whether `next` is a legal successor: strictly forward, and a confirmation
    /// must name the payload that holds the claim.
    pub fn can_become(&self, next: &ClaimState) -> bool {
        match (self, next) {
            (ClaimState::Unclaimed, ClaimState::Claimed(_)) => true,
            (ClaimState::Claimed(held), ClaimState::Confirmed(by)) => held == by,
            _ => false,
        }
    }
}

/// Which store a [`SyncOutcome`] row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Target => write!(f, "target"),
        }
    }
}

/// Progress of one payload on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    Sent,
    Received,
    Validated,
    Applied,
    Rejected,
}

impl OutcomeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OutcomeStatus::Applied | OutcomeStatus::Rejected)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Sent => write!(f, "SENT"),
            OutcomeStatus::Received => write!(f, "RECEIVED"),
            OutcomeStatus::Validated => write!(f, "VALIDATED"),
            OutcomeStatus::Applied => write!(f, "APPLIED"),
            OutcomeStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One row of the Change Ledger. Immutable except for `claim_state` and the
/// claim timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: u64,
    pub entity_id: EntityId,
    pub operation: Operation,
    #[serde(default)]
    pub changed_fields: FieldMap,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub claim_state: ClaimState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl ChangeEntry {
    /// The immutable part of the entry, as shipped inside a payload.
    pub fn snapshot(&self) -> PayloadEntry {
        PayloadEntry {
            id: self.id,
            entity_id: self.entity_id.clone(),
            operation: self.operation.clone(),
            changed_fields: self.changed_fields.clone(),
            observed_at: self.observed_at,
        }
    }
}

/// A [`ChangeEntry`] snapshot inside a payload (no claim state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEntry {
    pub id: u64,
    pub entity_id: EntityId,
    pub operation: Operation,
    #[serde(default)]
    pub changed_fields: FieldMap,
    pub observed_at: DateTime<Utc>,
}

/// The immutable transfer unit between the two sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub payload_id: PayloadId,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_source_system")]
    pub source_system: String,
    #[serde(default = "default_target_system")]
    pub target_system: String,
    pub entries: Vec<PayloadEntry>,
}

fn default_source_system() -> String {
    SOURCE_SYSTEM.to_string()
}

fn default_target_system() -> String {
    TARGET_SYSTEM.to_string()
}

impl SyncPayload {
    pub fn entity_ids(&self) -> BTreeSet<EntityId> {
        self.entries.iter().map(|e| e.entity_id.clone()).collect()
    }

    pub fn entry_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

/// One Sync Ledger row: the state of one payload on one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub payload_id: PayloadId,
    pub side: Side,
    pub status: OutcomeStatus,
    /// Present iff `status == Rejected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub applied_entity_ids: BTreeSet<EntityId>,
    #[serde(default)]
    pub rejected: BTreeMap<EntityId, String>,
    #[serde(default)]
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

impl SyncOutcome {
    pub fn new(payload_id: PayloadId, side: Side, status: OutcomeStatus) -> Self {
        Self {
            payload_id,
            side,
            status,
            error_detail: None,
            applied_entity_ids: BTreeSet::new(),
            rejected: BTreeMap::new(),
            attempts: 0,
            recorded_at: Utc::now(),
        }
    }
}

/// A Payroll-side employee record, mutated only by the applier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub entity_id: EntityId,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_payload_id: Option<PayloadId>,
    /// Highest change entry id applied to this record; entries at or below it are replays.
    #[serde(default)]
    pub last_applied_entry_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone set by DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TargetRecord {
    pub fn new(entity_id: EntityId, fields: FieldMap) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            fields,
            last_applied_payload_id: None,
            last_applied_entry_id: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn newtype_display() {
        assert_eq!(EntityId::from("E42").to_string(), "E42");
        assert_eq!(PayloadId::from("abc").to_string(), "abc");
    }

    #[test]
    fn entity_id_well_formed() {
        assert!(EntityId::from("EMP001").is_well_formed());
        assert!(EntityId::from("emp_7-b").is_well_formed());
        assert!(!EntityId::from("").is_well_formed());
        assert!(!EntityId::from("EMP 001").is_well_formed());
        assert!(!EntityId::from("x".repeat(65)).is_well_formed());
    }

    #[test]
    fn payload_id_short_is_prefix() {
        let id = PayloadId::from("0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(PayloadId::from("ab").short(), "ab");
    }

    #[test]
    fn unknown_operation_deserializes_as_unrecognized() {
        let op: Operation = serde_json::from_value(json!("MERGE")).unwrap();
        assert_eq!(op, Operation::Unrecognized("MERGE".into()));
        assert_eq!(serde_json::to_value(&op).unwrap(), json!("MERGE"));
        let op: Operation = serde_json::from_value(json!("UPDATE")).unwrap();
        assert_eq!(op, Operation::Update);
    }

    #[test]
    fn claim_state_only_moves_forward() {
        let p1 = PayloadId::from("p1");
        let p2 = PayloadId::from("p2");
        let unclaimed = ClaimState::Unclaimed;
        let claimed = ClaimState::Claimed(p1.clone());
        let confirmed = ClaimState::Confirmed(p1.clone());

        assert!(unclaimed.can_become(&claimed));
        assert!(claimed.can_become(&confirmed));
        assert!(!claimed.can_become(&ClaimState::Confirmed(p2.clone())));
        assert!(!claimed.can_become(&ClaimState::Claimed(p2)));
        assert!(!confirmed.can_become(&unclaimed));
        assert!(!claimed.can_become(&unclaimed));
        assert!(!unclaimed.can_become(&confirmed));
    }

    #[test]
    fn claim_state_serializes_with_payload_id() {
        let v = serde_json::to_value(ClaimState::Claimed(PayloadId::from("p1"))).unwrap();
        assert_eq!(v, json!({"state": "CLAIMED", "payload_id": "p1"}));
        let v = serde_json::to_value(ClaimState::Unclaimed).unwrap();
        assert_eq!(v, json!({"state": "UNCLAIMED"}));
    }

    #[test]
    fn terminal_statuses() {
        assert!(OutcomeStatus::Applied.is_terminal());
        assert!(OutcomeStatus::Rejected.is_terminal());
        assert!(!OutcomeStatus::Validated.is_terminal());
        assert!(!OutcomeStatus::Sent.is_terminal());
    }
}
