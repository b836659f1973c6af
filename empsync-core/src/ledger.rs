//! Source-side state: the Change Ledger, the payloads built from it, and the
//! source Sync Ledger, persisted together as one document so a claim and the
//! payload it names always commit in the same write.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::sync_ledger::SyncLedger;
use crate::types::{ChangeEntry, ClaimState, EntityId, FieldMap, Operation, PayloadId, SyncPayload};

/// Why a claim transition was refused. Nothing is modified when this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimConflict {
    /// These entries are no longer UNCLAIMED.
    AlreadyClaimed(Vec<u64>),
    /// These entry ids do not exist in the ledger.
    UnknownEntries(Vec<u64>),
    /// A different payload with the same id is already stored.
    PayloadExists(PayloadId),
}

/// Result of confirming a payload on the source side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Confirmation {
    /// Entries moved CLAIMED → CONFIRMED by this call.
    pub confirmed: Vec<u64>,
    /// Entries that were already CONFIRMED by this payload.
    pub already_confirmed: Vec<u64>,
    pub cursor: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    /// Highest entry id handed out so far.
    #[serde(default)]
    pub last_id: u64,
    /// Every entry with `id <= cursor` is CONFIRMED.
    #[serde(default)]
    pub cursor: u64,
    /// Append-only, ascending by `id`.
    #[serde(default)]
    pub entries: Vec<ChangeEntry>,
    #[serde(default)]
    pub payloads: BTreeMap<PayloadId, SyncPayload>,
    #[serde(default)]
    pub outcomes: SyncLedger,
}

impl SourceState {
    /// Append a mutation observed on the source entity table.
    pub fn observe(
        &mut self,
        entity_id: EntityId,
        operation: Operation,
        changed_fields: FieldMap,
        observed_at: DateTime<Utc>,
    ) -> Result<ChangeEntry, StoreError> {
        check_mutation(&entity_id, &operation, &changed_fields)?;
        let id = self.last_id + 1;
        let entry = ChangeEntry {
            id,
            entity_id,
            operation,
            changed_fields,
            observed_at,
            claim_state: ClaimState::Unclaimed,
            claimed_at: None,
            confirmed_at: None,
        };
        self.entries.push(entry.clone());
        self.last_id = id;
        Ok(entry)
    }

    pub fn entry(&self, id: u64) -> Option<&ChangeEntry> {
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// UNCLAIMED entries with `id > since`, ascending.
    pub fn unclaimed_after(&self, since: Option<u64>) -> Vec<ChangeEntry> {
        let floor = since.unwrap_or(0);
        self.entries
            .iter()
            .filter(|e| e.id > floor && e.claim_state.is_unclaimed())
            .cloned()
            .collect()
    }

    /// Entries currently CLAIMED, grouped by the payload holding them.
    pub fn open_claims(&self) -> BTreeMap<PayloadId, Vec<&ChangeEntry>> {
        let mut groups: BTreeMap<PayloadId, Vec<&ChangeEntry>> = BTreeMap::new();
        for entry in &self.entries {
            if let ClaimState::Claimed(pid) = &entry.claim_state {
                groups.entry(pid.clone()).or_default().push(entry);
            }
        }
        groups
    }

    /// Claim `entry_ids` for `payload` and store the payload, all or nothing.
    pub fn claim(
        &mut self,
        entry_ids: &[u64],
        payload: SyncPayload,
        now: DateTime<Utc>,
    ) -> Result<(), ClaimConflict> {
        if self.payloads.contains_key(&payload.payload_id) {
            return Err(ClaimConflict::PayloadExists(payload.payload_id));
        }

        let mut unknown = Vec::new();
        let mut taken = Vec::new();
        let mut positions = Vec::with_capacity(entry_ids.len());
        for id in entry_ids {
            match self.entries.binary_search_by_key(id, |e| e.id) {
                Ok(idx) if self.entries[idx].claim_state.is_unclaimed() => positions.push(idx),
                Ok(_) => taken.push(*id),
                Err(_) => unknown.push(*id),
            }
        }
        if !unknown.is_empty() {
            return Err(ClaimConflict::UnknownEntries(unknown));
        }
        if !taken.is_empty() {
            return Err(ClaimConflict::AlreadyClaimed(taken));
        }

        for idx in positions {
            let entry = &mut self.entries[idx];
            entry.claim_state = ClaimState::Claimed(payload.payload_id.clone());
            entry.claimed_at = Some(now);
        }
        self.payloads.insert(payload.payload_id.clone(), payload);
        Ok(())
    }

    /// Move every entry claimed by `payload_id` to CONFIRMED and advance the cursor.
    pub fn confirm(&mut self, payload_id: &PayloadId, now: DateTime<Utc>) -> Confirmation {
        let mut result = Confirmation::default();
        let confirmed_state = ClaimState::Confirmed(payload_id.clone());
        for entry in &mut self.entries {
            if entry.claim_state.can_become(&confirmed_state) {
                entry.claim_state = confirmed_state.clone();
                entry.confirmed_at = Some(now);
                result.confirmed.push(entry.id);
            } else if entry.claim_state == confirmed_state {
                result.already_confirmed.push(entry.id);
            }
        }
        self.advance_cursor();
        result.cursor = self.cursor;
        result
    }

    fn advance_cursor(&mut self) {
        let start = self.entries.partition_point(|e| e.id <= self.cursor);
        for entry in &self.entries[start..] {
            if !matches!(entry.claim_state, ClaimState::Confirmed(_)) {
                break;
            }
            self.cursor = entry.id;
        }
    }
}

fn check_mutation(
    entity_id: &EntityId,
    operation: &Operation,
    changed_fields: &FieldMap,
) -> Result<(), StoreError> {
    if !entity_id.is_well_formed() {
        return Err(StoreError::InvalidMutation(format!(
            "malformed entity id '{entity_id}'"
        )));
    }
    match operation {
        Operation::Update if changed_fields.is_empty() => Err(StoreError::InvalidMutation(
            format!("UPDATE of '{entity_id}' carries no changed fields"),
        )),
        Operation::Delete if !changed_fields.is_empty() => Err(StoreError::InvalidMutation(
            format!("DELETE of '{entity_id}' must not carry changed fields"),
        )),
        Operation::Unrecognized(name) => Err(StoreError::InvalidMutation(format!(
            "unrecognized operation '{name}' for '{entity_id}'"
        ))),
        _ => Ok(()),
    }
}
