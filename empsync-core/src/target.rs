//! Target-side state: Payroll records, the payloads received so far, and the
//! target Sync Ledger. Persisted as one document so a record mutation and the
//! outcome row describing it always commit together.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync_ledger::SyncLedger;
use crate::types::{EntityId, PayloadId, SyncPayload, TargetRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    /// Keyed by entity id; tombstoned records stay here.
    #[serde(default)]
    pub records: BTreeMap<EntityId, TargetRecord>,
    #[serde(default)]
    pub received: BTreeMap<PayloadId, SyncPayload>,
    #[serde(default)]
    pub outcomes: SyncLedger,
    /// Delivered payloads that failed the integrity check and were never stored.
    #[serde(default)]
    pub refused: BTreeMap<PayloadId, RefusedPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefusedPayload {
    pub reason: String,
    pub refused_at: DateTime<Utc>,
}

impl TargetState {
    /// The record for `entity_id` if it exists and is not tombstoned.
    pub fn live(&self, entity_id: &EntityId) -> Option<&TargetRecord> {
        self.records.get(entity_id).filter(|r| r.is_live())
    }

    pub fn is_live(&self, entity_id: &EntityId) -> bool {
        self.live(entity_id).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.records.values().filter(|r| r.is_live()).count()
    }
}
