//! Target-side intake of delivered payloads.

use std::path::Path;

use chrono::Utc;
use empsync_core::{
    payload, store, OutcomeStatus, PayloadId, RefusedPayload, Side, SyncOutcome, SyncPayload,
};

use crate::transport::{Ack, Transport};
use crate::SyncError;

/// Verify a payload's structure and store it with a `RECEIVED` row.
///
/// Receiving a payload that is already stored is a no-op reported as a duplicate.
/// A payload failing the integrity check is not stored; the refusal itself is
/// kept in the target document.
pub fn receive_payload_at(home: &Path, payload: &SyncPayload) -> Result<Ack, SyncError> {
    if let Err(defect) = payload::check_integrity(payload) {
        tracing::warn!("refusing payload {}: {defect}", payload.payload_id.short());
        let reason = defect.to_string();
        record_refusal_at(home, &payload.payload_id, &reason)?;
        return Err(SyncError::MalformedPayload {
            payload_id: payload.payload_id.clone(),
            reason,
        });
    }

    let lock = store::lock_side_at(home, Side::Target)?;
    let mut state = store::load_target_at(home)?;
    if state.received.contains_key(&payload.payload_id) {
        tracing::debug!("payload {} already received", payload.payload_id.short());
        return Ok(Ack {
            payload_id: payload.payload_id.clone(),
            duplicate: true,
        });
    }

    state
        .received
        .insert(payload.payload_id.clone(), payload.clone());
    state.outcomes.record(SyncOutcome::new(
        payload.payload_id.clone(),
        Side::Target,
        OutcomeStatus::Received,
    ));
    store::save_target_at(home, &lock, &state)?;
    tracing::info!(
        "received payload {} with {} entr(ies)",
        payload.payload_id.short(),
        payload.entries.len()
    );
    Ok(Ack {
        payload_id: payload.payload_id.clone(),
        duplicate: false,
    })
}

fn record_refusal_at(home: &Path, payload_id: &PayloadId, reason: &str) -> Result<(), SyncError> {
    let lock = store::lock_side_at(home, Side::Target)?;
    let mut state = store::load_target_at(home)?;
    if state.refused.contains_key(payload_id) {
        return Ok(());
    }
    state.refused.insert(
        payload_id.clone(),
        RefusedPayload {
            reason: reason.to_string(),
            refused_at: Utc::now(),
        },
    );
    store::save_target_at(home, &lock, &state)?;
    Ok(())
}

/// Outcome of draining a transport into the target store.
#[derive(Debug, Default)]
pub struct Intake {
    pub received: Vec<Ack>,
    /// Payloads refused as malformed, with the reason.
    pub refused: Vec<SyncError>,
}

/// Receive every pending payload from `transport`.
///
/// Stored payloads are settled and malformed ones quarantined, so neither is
/// delivered again; storage errors abort and leave the rest pending.
pub fn receive_pending_at<T: Transport + ?Sized>(
    home: &Path,
    transport: &T,
) -> Result<Intake, SyncError> {
    let mut intake = Intake::default();
    for payload in transport.receive()? {
        match receive_payload_at(home, &payload) {
            Ok(ack) => {
                transport.settle_payload(&payload.payload_id)?;
                intake.received.push(ack);
            }
            Err(err @ SyncError::MalformedPayload { .. }) => {
                transport.quarantine_payload(&payload.payload_id)?;
                intake.refused.push(err);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(intake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use empsync_core::{EntityId, FieldMap, Operation, PayloadEntry};
    use serde_json::json;
    use tempfile::TempDir;

    use crate::transport::DirTransport;

    fn sealed() -> SyncPayload {
        sealed_with(Operation::Update)
    }

    fn sealed_with(operation: Operation) -> SyncPayload {
        let mut fields = FieldMap::new();
        fields.insert("salary".into(), json!(98000));
        payload::seal(
            vec![PayloadEntry {
                id: 1,
                entity_id: EntityId::from("E42"),
                operation,
                changed_fields: fields,
                observed_at: Utc::now(),
            }],
            Utc::now(),
        )
    }

    #[test]
    fn receive_stores_payload_and_received_row() {
        let home = TempDir::new().unwrap();
        let p = sealed();
        let ack = receive_payload_at(home.path(), &p).unwrap();
        assert!(!ack.duplicate);

        let state = store::load_target_at(home.path()).unwrap();
        assert_eq!(state.received.get(&p.payload_id), Some(&p));
        assert_eq!(
            state.outcomes.status(&p.payload_id),
            Some(OutcomeStatus::Received)
        );
    }

    #[test]
    fn second_receive_is_a_duplicate_no_op() {
        let home = TempDir::new().unwrap();
        let p = sealed();
        receive_payload_at(home.path(), &p).unwrap();
        let before = store::load_target_at(home.path()).unwrap();

        let ack = receive_payload_at(home.path(), &p).unwrap();
        assert!(ack.duplicate);
        assert_eq!(store::load_target_at(home.path()).unwrap(), before);
    }

    #[test]
    fn tampered_payload_is_malformed_and_not_stored() {
        let home = TempDir::new().unwrap();
        let mut p = sealed();
        p.entries[0].changed_fields.insert("salary".into(), json!(1));

        let err = receive_payload_at(home.path(), &p).unwrap_err();
        assert!(matches!(err, SyncError::MalformedPayload { .. }), "got: {err}");
        assert!(!err.is_retryable());
        let state = store::load_target_at(home.path()).unwrap();
        assert!(state.received.is_empty());
        assert!(state.outcomes.get(&p.payload_id).is_none());
        assert!(state.refused[&p.payload_id].reason.contains("content"));
    }

    #[test]
    fn unrecognized_operation_survives_the_wire_and_fails_validation() {
        let home = TempDir::new().unwrap();
        let p = sealed_with(Operation::Unrecognized("MERGE".into()));
        let wire = serde_json::to_string(&p).unwrap();
        assert!(wire.contains("\"MERGE\""));
        let delivered: SyncPayload = serde_json::from_str(&wire).unwrap();

        let ack = receive_payload_at(home.path(), &delivered).unwrap();
        assert!(!ack.duplicate);

        let report = crate::validator::validate_sync_data_at(home.path(), &p.payload_id).unwrap();
        assert!(!report.ok);
        assert!(
            report.problems.iter().any(|problem| problem.reason.contains("MERGE")),
            "got: {:?}",
            report.problems
        );
    }

    #[test]
    fn pending_intake_settles_good_and_bad_payloads() {
        let home = TempDir::new().unwrap();
        let transport = DirTransport::new(home.path().join("transport"));
        let good = sealed();
        transport.send(&good).unwrap();

        let mut bad = sealed();
        bad.payload_id = "0".repeat(64).into();
        transport.send(&bad).unwrap();

        let intake = receive_pending_at(home.path(), &transport).unwrap();
        assert_eq!(intake.received.len(), 1);
        assert_eq!(intake.refused.len(), 1);
        assert!(transport.receive().unwrap().is_empty());

        let quarantined = transport
            .outbox_dir()
            .join(format!("{}.json.bad", bad.payload_id.0));
        assert!(quarantined.exists());
        let state = store::load_target_at(home.path()).unwrap();
        assert!(state.refused.contains_key(&bad.payload_id));
        assert!(!state.refused.contains_key(&good.payload_id));
    }
}
