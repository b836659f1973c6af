//! Source-side closure: turning a target's terminal outcome into confirmed
//! change entries and an advanced cursor.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use empsync_core::{store, OutcomeStatus, PayloadId, RecordOutcome, Side, SyncOutcome};

use crate::transport::Transport;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmReport {
    pub payload_id: PayloadId,
    /// Terminal status mirrored from the target.
    pub status: OutcomeStatus,
    /// Entries moved CLAIMED → CONFIRMED by this call.
    pub confirmed: Vec<u64>,
    pub already_confirmed: Vec<u64>,
    pub cursor: u64,
}

/// Confirm the entries of a payload the target has finished with.
///
/// Only a TARGET-side terminal outcome confirms anything; calling again with the
/// same outcome changes nothing. The outcome of a re-application replaces a
/// mirrored `REJECTED` row.
pub fn confirm_at(home: &Path, outcome: &SyncOutcome) -> Result<ConfirmReport, SyncError> {
    if outcome.side != Side::Target || !outcome.status.is_terminal() {
        return Err(SyncError::NotConfirmable {
            payload_id: outcome.payload_id.clone(),
            side: outcome.side,
            status: outcome.status,
        });
    }

    let lock = store::lock_side_at(home, Side::Source)?;
    let mut state = store::load_source_at(home)?;
    if !state.payloads.contains_key(&outcome.payload_id) {
        return Err(SyncError::UnknownPayload(outcome.payload_id.clone()));
    }

    let confirmation = state.confirm(&outcome.payload_id, Utc::now());

    let mut mirror = outcome.clone();
    mirror.side = Side::Source;
    let mirrored = state.outcomes.mirror(mirror) == RecordOutcome::Written;

    if !confirmation.confirmed.is_empty() || mirrored {
        store::save_source_at(home, &lock, &state)?;
        tracing::info!(
            "confirmed {} entr(ies) of payload {} ({}); cursor at {}",
            confirmation.confirmed.len(),
            outcome.payload_id.short(),
            outcome.status,
            confirmation.cursor
        );
    } else {
        tracing::debug!("payload {} already confirmed", outcome.payload_id.short());
    }

    Ok(ConfirmReport {
        payload_id: outcome.payload_id.clone(),
        status: outcome.status,
        confirmed: confirmation.confirmed,
        already_confirmed: confirmation.already_confirmed,
        cursor: confirmation.cursor,
    })
}

/// Confirm every acknowledgement waiting on `transport`, settling each one.
///
/// Acknowledgements for payloads this source never built are settled and
/// skipped with a warning.
pub fn confirm_pending_at<T: Transport + ?Sized>(
    home: &Path,
    transport: &T,
) -> Result<Vec<ConfirmReport>, SyncError> {
    let mut reports = Vec::new();
    for ack in transport.acknowledgements()? {
        match confirm_at(home, &ack) {
            Ok(report) => reports.push(report),
            Err(SyncError::UnknownPayload(pid))
            | Err(SyncError::NotConfirmable { payload_id: pid, .. }) => {
                tracing::warn!("dropping acknowledgement for payload {}", pid.short());
            }
            Err(err) => return Err(err),
        }
        transport.settle_ack(&ack.payload_id)?;
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_at;
    use crate::detector::{detect_changes_at, observe_mutation_at};
    use crate::transport::DirTransport;
    use empsync_core::{ClaimState, FieldMap, Operation};
    use serde_json::json;
    use tempfile::TempDir;

    fn built(home: &Path, n: usize) -> Vec<PayloadId> {
        let mut ids = Vec::new();
        for i in 0..n {
            let mut fields = FieldMap::new();
            fields.insert("salary".into(), json!(1000 + i));
            observe_mutation_at(home, "E42".into(), Operation::Update, fields).unwrap();
            let entries = detect_changes_at(home).unwrap();
            ids.push(build_at(home, &entries).unwrap().payload_id);
        }
        ids
    }

    fn terminal(pid: &PayloadId, status: OutcomeStatus) -> SyncOutcome {
        let mut row = SyncOutcome::new(pid.clone(), Side::Target, status);
        row.attempts = 1;
        row
    }

    #[test]
    fn confirm_moves_claims_and_cursor() {
        let home = TempDir::new().unwrap();
        let pids = built(home.path(), 1);
        let report = confirm_at(home.path(), &terminal(&pids[0], OutcomeStatus::Applied)).unwrap();

        assert_eq!(report.confirmed, vec![1]);
        assert_eq!(report.cursor, 1);
        let state = store::load_source_at(home.path()).unwrap();
        assert_eq!(
            state.entry(1).unwrap().claim_state,
            ClaimState::Confirmed(pids[0].clone())
        );
        assert_eq!(
            state.outcomes.status(&pids[0]),
            Some(OutcomeStatus::Applied)
        );
    }

    #[test]
    fn rejected_outcome_also_closes_the_loop() {
        let home = TempDir::new().unwrap();
        let pids = built(home.path(), 1);
        let mut row = terminal(&pids[0], OutcomeStatus::Rejected);
        row.error_detail = Some("E42: entry 1: gone".into());
        confirm_at(home.path(), &row).unwrap();

        let state = store::load_source_at(home.path()).unwrap();
        let mirrored = state.outcomes.get(&pids[0]).unwrap();
        assert_eq!(mirrored.side, Side::Source);
        assert_eq!(mirrored.error_detail.as_deref(), Some("E42: entry 1: gone"));
    }

    #[test]
    fn reapplied_outcome_replaces_mirrored_rejection() {
        let home = TempDir::new().unwrap();
        let pids = built(home.path(), 1);
        confirm_at(home.path(), &terminal(&pids[0], OutcomeStatus::Rejected)).unwrap();

        let mut reapplied = terminal(&pids[0], OutcomeStatus::Applied);
        reapplied.attempts = 2;
        let report = confirm_at(home.path(), &reapplied).unwrap();
        assert!(report.confirmed.is_empty());
        assert_eq!(report.already_confirmed, vec![1]);

        let state = store::load_source_at(home.path()).unwrap();
        let mirrored = state.outcomes.get(&pids[0]).unwrap();
        assert_eq!(mirrored.status, OutcomeStatus::Applied);
        assert_eq!(mirrored.side, Side::Source);
        assert_eq!(mirrored.attempts, 2);
    }

    #[test]
    fn confirm_is_idempotent() {
        let home = TempDir::new().unwrap();
        let pids = built(home.path(), 1);
        let row = terminal(&pids[0], OutcomeStatus::Applied);
        confirm_at(home.path(), &row).unwrap();
        let before = store::load_source_at(home.path()).unwrap();

        let again = confirm_at(home.path(), &row).unwrap();
        assert!(again.confirmed.is_empty());
        assert_eq!(again.already_confirmed, vec![1]);
        assert_eq!(store::load_source_at(home.path()).unwrap(), before);
    }

    #[test]
    fn non_terminal_or_source_outcomes_are_refused() {
        let home = TempDir::new().unwrap();
        let pids = built(home.path(), 1);
        let validated = SyncOutcome::new(pids[0].clone(), Side::Target, OutcomeStatus::Validated);
        assert!(matches!(
            confirm_at(home.path(), &validated),
            Err(SyncError::NotConfirmable { .. })
        ));

        let source = SyncOutcome::new(pids[0].clone(), Side::Source, OutcomeStatus::Applied);
        assert!(confirm_at(home.path(), &source).is_err());

        let state = store::load_source_at(home.path()).unwrap();
        assert_eq!(state.cursor, 0);
    }

    #[test]
    fn cursor_waits_for_earlier_payloads() {
        let home = TempDir::new().unwrap();
        let pids = built(home.path(), 2);
        let report = confirm_at(home.path(), &terminal(&pids[1], OutcomeStatus::Applied)).unwrap();
        assert_eq!(report.cursor, 0);
        let report = confirm_at(home.path(), &terminal(&pids[0], OutcomeStatus::Applied)).unwrap();
        assert_eq!(report.cursor, 2);
    }

    #[test]
    fn pending_acknowledgements_are_confirmed_and_settled() {
        let home = TempDir::new().unwrap();
        let transport = DirTransport::new(home.path().join("transport"));
        let pids = built(home.path(), 1);
        transport
            .acknowledge(&terminal(&pids[0], OutcomeStatus::Applied))
            .unwrap();
        transport
            .acknowledge(&terminal(&PayloadId::from("abcdef"), OutcomeStatus::Applied))
            .unwrap();

        let reports = confirm_pending_at(home.path(), &transport).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].confirmed, vec![1]);
        assert!(transport.acknowledgements().unwrap().is_empty());
    }
}
