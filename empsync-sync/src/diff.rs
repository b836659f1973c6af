//! Dry-run unified diff support for `empsync apply --dry-run`.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use similar::TextDiff;

use empsync_core::{store, EntityId, FieldMap, PayloadId, TargetRecord};

use crate::applier::{compute, ApplyResult};
use crate::SyncError;

/// A single target record diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordDiff {
    pub entity_id: EntityId,
    pub unified_diff: String,
}

/// What applying a payload would do, without doing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preview {
    pub result: ApplyResult,
    pub diffs: Vec<RecordDiff>,
}

#[derive(Serialize)]
struct RecordView<'a> {
    fields: &'a FieldMap,
    deleted: bool,
}

/// Apply `payload_id` to an in-memory copy of the target store and diff every
/// affected record against its current content.
///
/// No files are written.
pub fn preview_at(
    home: &Path,
    payload_id: &PayloadId,
    allow_partial: bool,
) -> Result<Preview, SyncError> {
    let before = store::load_target_at(home)?;
    let payload = before
        .received
        .get(payload_id)
        .ok_or_else(|| SyncError::UnknownPayload(payload_id.clone()))?;

    let mut after = before.clone();
    let mut result = match before
        .outcomes
        .get(payload_id)
        .filter(|row| row.status.is_terminal())
    {
        // Already handled; applying again changes nothing.
        Some(row) => ApplyResult::from_recorded(row),
        None => compute(&mut after, payload, allow_partial, Utc::now()),
    };
    result.dry_run = true;

    let mut diffs = Vec::new();
    for entity_id in payload.entity_ids() {
        let old = render(before.records.get(&entity_id))?;
        let new = render(after.records.get(&entity_id))?;
        if old == new {
            continue;
        }
        let old_header = format!("a/{entity_id}");
        let new_header = format!("b/{entity_id}");
        let unified = TextDiff::from_lines(&old, &new)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string();
        diffs.push(RecordDiff {
            entity_id,
            unified_diff: unified,
        });
    }

    Ok(Preview { result, diffs })
}

fn render(record: Option<&TargetRecord>) -> Result<String, SyncError> {
    let Some(record) = record else {
        return Ok(String::new());
    };
    let view = RecordView {
        fields: &record.fields,
        deleted: !record.is_live(),
    };
    Ok(format!("{}\n", serde_json::to_string_pretty(&view)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use empsync_core::{payload, Operation, OutcomeStatus, PayloadEntry, Side};
    use serde_json::json;
    use tempfile::TempDir;

    use crate::applier::{apply_at, ApplyOptions};
    use crate::receiver::receive_payload_at;

    fn setup(home: &Path) -> PayloadId {
        let lock = store::lock_side_at(home, Side::Target).unwrap();
        let mut state = store::load_target_at(home).unwrap();
        let mut fields = FieldMap::new();
        fields.insert("salary".into(), json!(50000));
        let id = EntityId::from("E42");
        state
            .records
            .insert(id.clone(), TargetRecord::new(id, fields));
        store::save_target_at(home, &lock, &state).unwrap();
        drop(lock);

        let mut changed = FieldMap::new();
        changed.insert("salary".into(), json!(98000));
        let sealed = payload::seal(
            vec![PayloadEntry {
                id: 1,
                entity_id: EntityId::from("E42"),
                operation: Operation::Update,
                changed_fields: changed,
                observed_at: Utc::now(),
            }],
            Utc::now(),
        );
        receive_payload_at(home, &sealed).unwrap();
        sealed.payload_id
    }

    #[test]
    fn pending_payload_produces_unified_diff() {
        let home = TempDir::new().expect("home");
        let pid = setup(home.path());
        let before = std::fs::read(store::target_path_at(home.path())).unwrap();

        let preview = preview_at(home.path(), &pid, false).expect("preview");
        assert_eq!(preview.result.status, OutcomeStatus::Applied);
        assert!(preview.result.dry_run);
        assert_eq!(preview.diffs.len(), 1);

        let diff = &preview.diffs[0].unified_diff;
        assert!(diff.contains("--- a/E42"));
        assert!(diff.contains("+++ b/E42"));
        assert!(diff.contains("@@"));
        assert!(diff.contains("-    \"salary\": 50000"));
        assert!(diff.contains("+    \"salary\": 98000"));

        let after = std::fs::read(store::target_path_at(home.path())).unwrap();
        assert_eq!(before, after, "preview must not write");
    }

    #[test]
    fn no_diffs_after_apply() {
        let home = TempDir::new().expect("home");
        let pid = setup(home.path());
        apply_at(home.path(), &pid, ApplyOptions::default()).expect("apply");

        let preview = preview_at(home.path(), &pid, false).expect("preview");
        assert!(preview.diffs.is_empty());
        assert!(preview.result.recorded);
    }
}
