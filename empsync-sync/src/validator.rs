//! Payload validation against the current target store.
//!
//! Validation is total and non-mutating: bad data produces problems, never
//! errors. Existence is simulated across the payload, so an UPDATE may follow a
//! CREATE of the same entity and nothing may follow its DELETE.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use empsync_core::{
    store, EntityId, Operation, OutcomeStatus, PayloadEntry, PayloadId, Side, SyncOutcome,
    SyncPayload, TargetState,
};

use crate::SyncError;

/// One data-quality problem, tied to the entry that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub entry_id: u64,
    pub entity_id: EntityId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub payload_id: PayloadId,
    pub ok: bool,
    pub problems: Vec<Problem>,
}

impl ValidationResult {
    /// `Err(ValidationFailed)` unless ok.
    pub fn into_result(self) -> Result<Self, SyncError> {
        if self.ok {
            Ok(self)
        } else {
            Err(SyncError::ValidationFailed {
                payload_id: self.payload_id,
                problems: self.problems,
            })
        }
    }
}

/// Shape checks that need no target state.
pub(crate) fn shape_problem(entry: &PayloadEntry) -> Option<String> {
    if !entry.entity_id.is_well_formed() {
        return Some(format!("malformed entity id '{}'", entry.entity_id));
    }
    match &entry.operation {
        Operation::Unrecognized(name) => Some(format!("unrecognized operation '{name}'")),
        Operation::Update if entry.changed_fields.is_empty() => {
            Some("UPDATE carries no changed fields".into())
        }
        Operation::Delete if !entry.changed_fields.is_empty() => {
            Some("DELETE must not carry changed fields".into())
        }
        _ => None,
    }
}

/// Validate every entry of `payload` against `target`.
pub fn validate(payload: &SyncPayload, target: &TargetState) -> ValidationResult {
    // Entity → exists after the entries seen so far.
    let mut exists: HashMap<&EntityId, bool> = HashMap::new();
    let mut problems = Vec::new();

    for entry in &payload.entries {
        let problem = |reason: String| Problem {
            entry_id: entry.id,
            entity_id: entry.entity_id.clone(),
            reason,
        };

        if let Some(reason) = shape_problem(entry) {
            problems.push(problem(reason));
            continue;
        }

        let record = target.records.get(&entry.entity_id);
        let replay = record.is_some_and(|r| entry.id <= r.last_applied_entry_id);
        let present = *exists
            .entry(&entry.entity_id)
            .or_insert_with(|| record.is_some_and(|r| r.is_live()));

        match &entry.operation {
            Operation::Create => {
                exists.insert(&entry.entity_id, true);
            }
            Operation::Update if present || replay => {}
            Operation::Delete if present || replay => {
                exists.insert(&entry.entity_id, false);
            }
            Operation::Update | Operation::Delete => {
                problems.push(problem(format!(
                    "{} references '{}', which is not present in the target",
                    entry.operation, entry.entity_id
                )));
            }
            Operation::Unrecognized(_) => {}
        }
    }

    ValidationResult {
        payload_id: payload.payload_id.clone(),
        ok: problems.is_empty(),
        problems,
    }
}

/// Validate a received payload and advance its target row to `VALIDATED` when ok.
///
/// A failed validation writes nothing; the applier records the rejection.
pub fn validate_sync_data_at(
    home: &Path,
    payload_id: &PayloadId,
) -> Result<ValidationResult, SyncError> {
    let state = store::load_target_at(home)?;
    let payload = state
        .received
        .get(payload_id)
        .ok_or_else(|| SyncError::UnknownPayload(payload_id.clone()))?;
    let result = validate(payload, &state);

    if !result.ok {
        tracing::warn!(
            "payload {} failed validation with {} problem(s)",
            payload_id.short(),
            result.problems.len()
        );
        return Ok(result);
    }

    if state.outcomes.status(payload_id) == Some(OutcomeStatus::Received) {
        let lock = store::lock_side_at(home, Side::Target)?;
        let mut state = store::load_target_at(home)?;
        let row = SyncOutcome::new(payload_id.clone(), Side::Target, OutcomeStatus::Validated);
        if state.outcomes.record(row) == empsync_core::RecordOutcome::Written {
            store::save_target_at(home, &lock, &state)?;
            tracing::info!("validated payload {}", payload_id.short());
        }
    }
    Ok(result)
}
