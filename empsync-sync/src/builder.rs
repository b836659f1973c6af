//! Payload builder: claims detected entries and seals them into a payload.
//!
//! ## `build_at`: claim protocol
//!
//! 1. Take the source writer lock.
//! 2. Reload the ledger (the caller's entries are a detection-time snapshot).
//! 3. Seal the ledger's copies of the entries into a content-addressed payload.
//! 4. Optimistic check: every entry must still be UNCLAIMED, else `ConcurrentClaim`.
//! 5. Mark the entries CLAIMED(payload_id) and store the payload in the same document.
//! 6. Atomic save; the lock drops on return.

use std::path::Path;

use chrono::Utc;

use empsync_core::{
    ledger::ClaimConflict, payload, store, ChangeEntry, Side, SyncPayload,
};

use crate::SyncError;

/// Build a payload from `entries` and claim them, all or nothing.
pub fn build_at(home: &Path, entries: &[ChangeEntry]) -> Result<SyncPayload, SyncError> {
    if entries.is_empty() {
        return Err(SyncError::EmptyBatch);
    }
    let mut ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
    ids.sort_unstable();
    ids.dedup();

    let lock = store::lock_side_at(home, Side::Source)?;
    let mut state = store::load_source_at(home)?;

    let mut snapshots = Vec::with_capacity(ids.len());
    let mut unknown = Vec::new();
    for id in &ids {
        match state.entry(*id) {
            Some(entry) => snapshots.push(entry.snapshot()),
            None => unknown.push(*id),
        }
    }
    if !unknown.is_empty() {
        return Err(SyncError::UnknownEntries(unknown));
    }

    let now = Utc::now();
    let sealed = payload::seal(snapshots, now);
    match state.claim(&ids, sealed.clone(), now) {
        Ok(()) => {}
        Err(ClaimConflict::AlreadyClaimed(entry_ids)) => {
            tracing::warn!("claim conflict on entries {entry_ids:?}");
            return Err(SyncError::ConcurrentClaim { entry_ids });
        }
        Err(ClaimConflict::PayloadExists(_)) => {
            return Err(SyncError::ConcurrentClaim { entry_ids: ids });
        }
        Err(ClaimConflict::UnknownEntries(unknown)) => {
            return Err(SyncError::UnknownEntries(unknown));
        }
    }

    store::save_source_at(home, &lock, &state)?;
    tracing::info!(
        "built payload {} claiming {} entr(ies)",
        sealed.payload_id.short(),
        ids.len()
    );
    Ok(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{detect_changes_at, observe_mutation_at};
    use empsync_core::{ClaimState, FieldMap, Operation};
    use serde_json::json;
    use tempfile::TempDir;

    fn seed(home: &Path, n: i64) {
        for i in 0..n {
            let mut fields = FieldMap::new();
            fields.insert("salary".into(), json!(90000 + i));
            observe_mutation_at(home, format!("E{i}").as_str().into(), Operation::Update, fields)
                .unwrap();
        }
    }

    #[test]
    fn empty_batch_is_rejected() {
        let home = TempDir::new().unwrap();
        assert!(matches!(build_at(home.path(), &[]), Err(SyncError::EmptyBatch)));
    }

    #[test]
    fn build_claims_entries_with_payload_id() {
        let home = TempDir::new().unwrap();
        seed(home.path(), 2);
        let entries = detect_changes_at(home.path()).unwrap();
        let payload = build_at(home.path(), &entries).unwrap();

        assert_eq!(payload.entry_ids(), vec![1, 2]);
        let state = store::load_source_at(home.path()).unwrap();
        for id in [1, 2] {
            assert_eq!(
                state.entry(id).unwrap().claim_state,
                ClaimState::Claimed(payload.payload_id.clone())
            );
        }
        assert_eq!(state.payloads.get(&payload.payload_id), Some(&payload));
    }

    #[test]
    fn no_double_detection_after_build() {
        let home = TempDir::new().unwrap();
        seed(home.path(), 3);
        let entries = detect_changes_at(home.path()).unwrap();
        build_at(home.path(), &entries[..2]).unwrap();

        let remaining: Vec<u64> = detect_changes_at(home.path())
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(remaining, vec![3]);
    }

    #[test]
    fn stale_snapshot_yields_concurrent_claim_and_changes_nothing() {
        let home = TempDir::new().unwrap();
        seed(home.path(), 2);
        let snapshot = detect_changes_at(home.path()).unwrap();
        build_at(home.path(), &snapshot[..1]).unwrap();
        let before = store::load_source_at(home.path()).unwrap();

        let err = build_at(home.path(), &snapshot).unwrap_err();
        match err {
            SyncError::ConcurrentClaim { entry_ids } => assert_eq!(entry_ids, vec![1]),
            other => panic!("expected concurrent claim, got {other:?}"),
        }
        let after = store::load_source_at(home.path()).unwrap();
        assert_eq!(before, after);
        assert!(after.entry(2).unwrap().claim_state.is_unclaimed());
    }

    #[test]
    fn entries_missing_from_ledger_are_refused() {
        let home = TempDir::new().unwrap();
        seed(home.path(), 1);
        let mut entries = detect_changes_at(home.path()).unwrap();
        let mut ghost = entries[0].clone();
        ghost.id = 99;
        entries.push(ghost);
        assert!(matches!(
            build_at(home.path(), &entries),
            Err(SyncError::UnknownEntries(ids)) if ids == vec![99]
        ));
    }
}
