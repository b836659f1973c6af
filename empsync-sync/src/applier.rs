//! Applier: mutates target records from a received payload.
//!
//! ## `apply_at`: 6-step protocol
//!
//! 1. Take the target writer lock (skipped for dry runs).
//! 2. Idempotency short-circuit: a terminal row for the payload is returned as is.
//! 3. Validate, unless the payload is already `VALIDATED`.
//! 4. Problems without `allow_partial` → reject wholesale, touch nothing.
//! 5. Otherwise walk the entries in id order, rejecting and continuing per entry.
//! 6. Records and the outcome row commit in one atomic save.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use empsync_core::{
    store, EntityId, FieldMap, Operation, OutcomeStatus, PayloadEntry, PayloadId, RecordOutcome,
    Side, SyncOutcome, SyncPayload, TargetRecord, TargetState,
};

use crate::validator::{self, shape_problem, Problem};
use crate::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOptions {
    /// Reject problem entries individually instead of the whole payload.
    pub allow_partial: bool,
    /// Compute the result without writing anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub payload_id: PayloadId,
    pub status: OutcomeStatus,
    pub applied: BTreeSet<EntityId>,
    pub rejected: BTreeMap<EntityId, String>,
    /// Entries at or below their record's watermark, counted as applied.
    #[serde(default)]
    pub replayed_entries: Vec<u64>,
    /// Taken from the Sync Ledger; nothing was applied by this call.
    #[serde(default)]
    pub recorded: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub attempts: u32,
}

impl ApplyResult {
    fn new(payload_id: PayloadId) -> Self {
        Self {
            payload_id,
            status: OutcomeStatus::Applied,
            applied: BTreeSet::new(),
            rejected: BTreeMap::new(),
            replayed_entries: Vec::new(),
            recorded: false,
            dry_run: false,
            attempts: 1,
        }
    }

    pub(crate) fn from_recorded(row: &SyncOutcome) -> Self {
        Self {
            payload_id: row.payload_id.clone(),
            status: row.status,
            applied: row.applied_entity_ids.clone(),
            rejected: row.rejected.clone(),
            replayed_entries: Vec::new(),
            recorded: true,
            dry_run: false,
            attempts: row.attempts,
        }
    }

    /// `; `-joined per-entity reasons, or `None` when nothing was rejected.
    pub fn error_detail(&self) -> Option<String> {
        if self.rejected.is_empty() {
            return None;
        }
        Some(
            self.rejected
                .iter()
                .map(|(entity, reason)| format!("{entity}: {reason}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// `Err(PartialApplyFailure)` when any entity was rejected.
    pub fn into_strict(self) -> Result<Self, SyncError> {
        if self.rejected.is_empty() {
            Ok(self)
        } else {
            Err(SyncError::PartialApplyFailure {
                payload_id: self.payload_id,
                rejected: self.rejected,
            })
        }
    }

    fn to_outcome(&self, now: DateTime<Utc>) -> SyncOutcome {
        let mut row = SyncOutcome::new(self.payload_id.clone(), Side::Target, self.status);
        row.error_detail = self.error_detail();
        row.applied_entity_ids = self.applied.clone();
        row.rejected = self.rejected.clone();
        row.attempts = self.attempts;
        row.recorded_at = now;
        row
    }
}

// ---------------------------------------------------------------------------
// Per-entry application
// ---------------------------------------------------------------------------

enum Effect {
    Applied,
    Replayed,
}

/// Last-writer-wins on fields; CREATE requires absence, UPDATE and DELETE presence.
fn apply_entry(
    state: &mut TargetState,
    payload_id: &PayloadId,
    entry: &PayloadEntry,
    now: DateTime<Utc>,
) -> Result<Effect, String> {
    if let Some(reason) = shape_problem(entry) {
        return Err(reason);
    }

    let existing = state.records.get(&entry.entity_id);
    if existing.is_some_and(|r| entry.id <= r.last_applied_entry_id) {
        return Ok(Effect::Replayed);
    }
    let live = existing.map(TargetRecord::is_live);

    let record = match (&entry.operation, live) {
        (Operation::Create, Some(true)) => {
            return Err(format!(
                "CREATE requires '{}' to be absent from the target",
                entry.entity_id
            ));
        }
        (Operation::Create, _) => {
            let record = state
                .records
                .entry(entry.entity_id.clone())
                .or_insert_with(|| TargetRecord::new(entry.entity_id.clone(), FieldMap::new()));
            record.fields = entry.changed_fields.clone();
            record.created_at = now;
            record.deleted_at = None;
            record
        }
        (Operation::Update | Operation::Delete, Some(true)) => {
            let Some(record) = state.records.get_mut(&entry.entity_id) else {
                return Err(format!("'{}' vanished from the target", entry.entity_id));
            };
            if entry.operation == Operation::Update {
                record
                    .fields
                    .extend(entry.changed_fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            } else {
                record.deleted_at = Some(now);
            }
            record
        }
        (operation, _) => {
            return Err(format!(
                "{operation} requires '{}' to be present in the target",
                entry.entity_id
            ));
        }
    };

    record.last_applied_payload_id = Some(payload_id.clone());
    record.last_applied_entry_id = entry.id;
    record.updated_at = now;
    Ok(Effect::Applied)
}

/// Walk `payload` in entry order. Entries in `blocked` are rejected up front;
/// once an entity has a rejected entry its later entries are rejected too.
fn run_entries(
    state: &mut TargetState,
    payload: &SyncPayload,
    blocked: &BTreeMap<u64, String>,
    now: DateTime<Utc>,
) -> ApplyResult {
    let mut result = ApplyResult::new(payload.payload_id.clone());
    let mut failed_at: HashMap<EntityId, u64> = HashMap::new();

    for entry in &payload.entries {
        let outcome = if let Some(first) = failed_at.get(&entry.entity_id) {
            Err(format!("blocked by rejected entry {first}"))
        } else if let Some(reason) = blocked.get(&entry.id) {
            Err(reason.clone())
        } else {
            apply_entry(state, &payload.payload_id, entry, now)
        };

        match outcome {
            Ok(Effect::Applied) => {
                result.applied.insert(entry.entity_id.clone());
            }
            Ok(Effect::Replayed) => {
                tracing::debug!("entry {} already applied to {}", entry.id, entry.entity_id);
                result.applied.insert(entry.entity_id.clone());
                result.replayed_entries.push(entry.id);
            }
            Err(reason) => {
                failed_at.entry(entry.entity_id.clone()).or_insert(entry.id);
                result
                    .rejected
                    .entry(entry.entity_id.clone())
                    .or_insert_with(|| format!("entry {}: {reason}", entry.id));
            }
        }
    }

    if !result.rejected.is_empty() {
        result.status = OutcomeStatus::Rejected;
    }
    result
}

fn rejected_wholesale(payload_id: &PayloadId, problems: &[Problem]) -> ApplyResult {
    let mut result = ApplyResult::new(payload_id.clone());
    result.status = OutcomeStatus::Rejected;
    for problem in problems {
        result
            .rejected
            .entry(problem.entity_id.clone())
            .or_insert_with(|| format!("entry {}: {}", problem.entry_id, problem.reason));
    }
    result
}

/// Compute the result of applying `payload` to `state`, mutating `state` in memory.
pub(crate) fn compute(
    state: &mut TargetState,
    payload: &SyncPayload,
    allow_partial: bool,
    now: DateTime<Utc>,
) -> ApplyResult {
    let already_validated =
        state.outcomes.status(&payload.payload_id) == Some(OutcomeStatus::Validated);
    let problems = if already_validated {
        Vec::new()
    } else {
        validator::validate(payload, state).problems
    };

    if !problems.is_empty() && !allow_partial {
        return rejected_wholesale(&payload.payload_id, &problems);
    }
    let blocked: BTreeMap<u64, String> = problems
        .into_iter()
        .map(|p| (p.entry_id, p.reason))
        .collect();
    run_entries(state, payload, &blocked, now)
}

// ---------------------------------------------------------------------------
// apply_at / reapply_at
// ---------------------------------------------------------------------------

/// Apply a received payload to the target store.
pub fn apply_at(
    home: &Path,
    payload_id: &PayloadId,
    options: ApplyOptions,
) -> Result<ApplyResult, SyncError> {
    let lock = if options.dry_run {
        None
    } else {
        Some(store::lock_side_at(home, Side::Target)?)
    };
    let mut state = store::load_target_at(home)?;

    if let Some(row) = state
        .outcomes
        .get(payload_id)
        .filter(|row| row.status.is_terminal())
    {
        tracing::debug!(
            "payload {} already {}; returning recorded result",
            payload_id.short(),
            row.status
        );
        return Ok(ApplyResult::from_recorded(row));
    }

    let payload = state
        .received
        .get(payload_id)
        .cloned()
        .ok_or_else(|| SyncError::UnknownPayload(payload_id.clone()))?;

    let now = Utc::now();
    let mut result = compute(&mut state, &payload, options.allow_partial, now);

    let Some(lock) = lock else {
        result.dry_run = true;
        return Ok(result);
    };

    state.outcomes.record(result.to_outcome(now));
    store::save_target_at(home, &lock, &state)?;
    log_result(&result);
    Ok(result)
}

/// Explicitly re-apply a `REJECTED` payload against current target state.
///
/// Partial application is always allowed here. An `APPLIED` payload returns its
/// recorded result; a payload with no terminal row yet is applied normally.
pub fn reapply_at(home: &Path, payload_id: &PayloadId) -> Result<ApplyResult, SyncError> {
    let lock = store::lock_side_at(home, Side::Target)?;
    let mut state = store::load_target_at(home)?;

    match state.outcomes.status(payload_id) {
        Some(OutcomeStatus::Rejected) => {}
        Some(OutcomeStatus::Applied) => {
            if let Some(row) = state.outcomes.get(payload_id) {
                return Ok(ApplyResult::from_recorded(row));
            }
        }
        _ => {
            drop(lock);
            let options = ApplyOptions {
                allow_partial: true,
                dry_run: false,
            };
            return apply_at(home, payload_id, options);
        }
    }

    let payload = state
        .received
        .get(payload_id)
        .cloned()
        .ok_or_else(|| SyncError::UnknownPayload(payload_id.clone()))?;

    let now = Utc::now();
    let problems = validator::validate(&payload, &state).problems;
    let blocked: BTreeMap<u64, String> = problems
        .into_iter()
        .map(|p| (p.entry_id, p.reason))
        .collect();
    let mut result = run_entries(&mut state, &payload, &blocked, now);

    if state.outcomes.supersede_rejected(result.to_outcome(now)) == RecordOutcome::Written {
        if let Some(row) = state.outcomes.get(payload_id) {
            result.attempts = row.attempts;
        }
    }
    store::save_target_at(home, &lock, &state)?;
    log_result(&result);
    Ok(result)
}

fn log_result(result: &ApplyResult) {
    match result.status {
        OutcomeStatus::Applied => tracing::info!(
            "applied payload {} to {} entity(ies)",
            result.payload_id.short(),
            result.applied.len()
        ),
        _ => tracing::warn!(
            "payload {} rejected for {} entity(ies): {}",
            result.payload_id.short(),
            result.rejected.len(),
            result.error_detail().unwrap_or_default()
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
