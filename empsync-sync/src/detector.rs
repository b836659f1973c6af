//! Change detection over the source Change Ledger, and the change-source
//! entry point that feeds it.
//!
//! Detection is a pure read: it takes no lock and never writes. Only
//! [`observe_mutation_at`] appends to the ledger.

use std::path::Path;

use chrono::Utc;

use empsync_core::{store, ChangeEntry, EntityId, FieldMap, Operation, Side, SourceState};

use crate::SyncError;

/// UNCLAIMED entries with `id > since_cursor`, ascending by id.
///
/// An empty result means "nothing to sync".
pub fn detect(state: &SourceState, since_cursor: Option<u64>) -> Vec<ChangeEntry> {
    state.unclaimed_after(since_cursor)
}

/// Load the source ledger under `home` and [`detect`] against `since_cursor`.
pub fn detect_at(home: &Path, since_cursor: Option<u64>) -> Result<Vec<ChangeEntry>, SyncError> {
    let state = store::load_source_at(home)?;
    let entries = detect(&state, since_cursor);
    tracing::debug!("detected {} unclaimed change(s)", entries.len());
    Ok(entries)
}

/// [`detect_at`] from the ledger's own confirmed cursor.
pub fn detect_changes_at(home: &Path) -> Result<Vec<ChangeEntry>, SyncError> {
    let state = store::load_source_at(home)?;
    let cursor = (state.cursor > 0).then_some(state.cursor);
    let entries = detect(&state, cursor);
    tracing::debug!(
        "detected {} unclaimed change(s) past cursor {}",
        entries.len(),
        state.cursor
    );
    Ok(entries)
}

/// Record one committed mutation of the source entity table.
///
/// Must be called exactly once per committed mutation; the ledger assigns the
/// next monotonic id.
pub fn observe_mutation_at(
    home: &Path,
    entity_id: EntityId,
    operation: Operation,
    changed_fields: FieldMap,
) -> Result<ChangeEntry, SyncError> {
    let lock = store::lock_side_at(home, Side::Source)?;
    let mut state = store::load_source_at(home)?;
    let entry = state.observe(entity_id, operation, changed_fields, Utc::now())?;
    store::save_source_at(home, &lock, &state)?;
    tracing::info!(
        "observed {} of {} as change {}",
        entry.operation,
        entry.entity_id,
        entry.id
    );
    Ok(entry)
}
