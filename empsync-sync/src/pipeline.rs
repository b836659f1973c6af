//! Shared pipeline entrypoint used by `empsync run` and the `tool` surface.
//!
//! One run walks the state machine end to end:
//! detect → build → send → receive → validate → apply → acknowledge → confirm.
//! Each stage is idempotent, so a run interrupted anywhere is finished by the
//! next one: payloads stored by an earlier intake are applied, and outcomes the
//! source has not mirrored are acknowledged again.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use empsync_core::{store, PayloadId, SyncConfig, SyncPayload};

use crate::applier::{apply_at, ApplyOptions, ApplyResult};
use crate::builder::build_at;
use crate::confirm::{confirm_pending_at, ConfirmReport};
use crate::detector::detect_changes_at;
use crate::receiver::receive_pending_at;
use crate::transport::{send_at, Ack, Transport};
use crate::validator::{validate_sync_data_at, ValidationResult};
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub allow_partial: bool,
    pub max_claim_retries: u32,
    pub retry_backoff: Duration,
}

impl PipelineOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            allow_partial: config.allow_partial_apply,
            max_claim_retries: config.max_claim_retries,
            retry_backoff: config.retry_backoff(),
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Payload built by this run; `None` means nothing to sync.
    pub built: Option<PayloadId>,
    pub entry_ids: Vec<u64>,
    /// Claim attempts spent, including the successful one.
    pub claim_attempts: u32,
    pub sent: Option<Ack>,
    pub received: Vec<Ack>,
    /// Payloads refused as malformed.
    pub refused: Vec<String>,
    pub validations: Vec<ValidationResult>,
    pub applied: Vec<ApplyResult>,
    pub confirmed: Vec<ConfirmReport>,
}

impl PipelineReport {
    pub fn nothing_to_sync(&self) -> bool {
        self.built.is_none()
            && self.received.is_empty()
            && self.applied.is_empty()
            && self.confirmed.is_empty()
    }
}

/// Retry `attempt` on `ConcurrentClaim` with linear backoff.
///
/// Returns the attempt's value and the number of attempts made.
pub(crate) fn retry_claim<T, F>(
    max_retries: u32,
    backoff: Duration,
    mut attempt: F,
) -> Result<(T, u32), SyncError>
where
    F: FnMut() -> Result<T, SyncError>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt() {
            Ok(value) => return Ok((value, tries)),
            Err(err @ SyncError::ConcurrentClaim { .. }) if tries <= max_retries => {
                tracing::warn!("{err}; retry {tries}/{max_retries}");
                std::thread::sleep(backoff * tries);
            }
            Err(err) => return Err(err),
        }
    }
}

fn detect_and_build(home: &Path) -> Result<Option<SyncPayload>, SyncError> {
    let entries = detect_changes_at(home)?;
    if entries.is_empty() {
        return Ok(None);
    }
    build_at(home, &entries).map(Some)
}

/// Run the pipeline once.
pub fn run<T: Transport + ?Sized>(
    home: &Path,
    transport: &T,
    options: &PipelineOptions,
) -> Result<PipelineReport, SyncError> {
    let mut report = PipelineReport::default();

    let (built, attempts) = retry_claim(options.max_claim_retries, options.retry_backoff, || {
        detect_and_build(home)
    })?;
    report.claim_attempts = attempts;

    match built {
        Some(payload) => {
            report.entry_ids = payload.entry_ids();
            report.sent = Some(send_at(home, transport, &payload.payload_id)?);
            report.built = Some(payload.payload_id);
        }
        None => tracing::debug!("nothing to sync"),
    }

    let intake = receive_pending_at(home, transport)?;
    report.refused = intake.refused.iter().map(ToString::to_string).collect();
    report.received = intake.received;

    let apply_options = ApplyOptions {
        allow_partial: options.allow_partial,
        dry_run: false,
    };
    for payload_id in unsettled_at(home)? {
        let target = store::load_target_at(home)?;
        let handled = target
            .outcomes
            .get(&payload_id)
            .filter(|row| row.status.is_terminal())
            .cloned();

        let row = match handled {
            // Applied earlier; the acknowledgement may have been lost.
            Some(row) => row,
            None => {
                if !report.received.iter().any(|ack| ack.payload_id == payload_id) {
                    tracing::info!(
                        "finishing payload {} received by an earlier run",
                        payload_id.short()
                    );
                }
                report
                    .validations
                    .push(validate_sync_data_at(home, &payload_id)?);
                let result = apply_at(home, &payload_id, apply_options)?;
                report.applied.push(result);
                let target = store::load_target_at(home)?;
                match target.outcomes.get(&payload_id) {
                    Some(row) => row.clone(),
                    None => continue,
                }
            }
        };
        transport.acknowledge(&row)?;
    }

    report.confirmed = confirm_pending_at(home, transport)?;
    Ok(report)
}

/// Stored payloads the target has not settled, or has settled without the
/// source mirroring that outcome yet. Ordered by first entry id.
fn unsettled_at(home: &Path) -> Result<Vec<PayloadId>, SyncError> {
    let target = store::load_target_at(home)?;
    let source = store::load_source_at(home)?;
    let mut pending: Vec<&SyncPayload> = target
        .received
        .values()
        .filter(|payload| {
            let pid = &payload.payload_id;
            let settled = target.outcomes.get(pid).filter(|r| r.status.is_terminal());
            let Some(settled) = settled else {
                return true;
            };
            // Payloads the source never built cannot be confirmed.
            if !source.payloads.contains_key(pid) {
                return false;
            }
            source.outcomes.get(pid).map_or(true, |mirrored| {
                mirrored.status != settled.status || mirrored.attempts < settled.attempts
            })
        })
        .collect();
    pending.sort_by_key(|payload| payload.entry_ids().first().copied());
    Ok(pending.into_iter().map(|p| p.payload_id.clone()).collect())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::applier::reapply_at;
    use crate::detector::observe_mutation_at;
    use crate::transport::DirTransport;
    use empsync_core::{
        ClaimState, EntityId, FieldMap, Operation, OutcomeStatus, Side, TargetRecord,
    };
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn run_with_empty_ledger_is_nothing_to_sync() {
        let home = TempDir::new().expect("home");
        let transport = DirTransport::new(home.path().join("transport"));
        let report = run(home.path(), &transport, &PipelineOptions::default()).expect("run");
        assert!(report.nothing_to_sync());
        assert_eq!(report.claim_attempts, 1);
    }

    #[test]
    fn run_creates_applies_and_confirms() {
        let home = TempDir::new().expect("home");
        let transport = DirTransport::new(home.path().join("transport"));
        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!("Ada"));
        observe_mutation_at(home.path(), "E7".into(), Operation::Create, fields).unwrap();

        let report = run(home.path(), &transport, &PipelineOptions::default()).expect("run");
        let pid = report.built.clone().expect("payload built");
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].status, OutcomeStatus::Applied);
        assert_eq!(report.confirmed.len(), 1);

        let source = store::load_source_at(home.path()).unwrap();
        assert_eq!(source.entry(1).unwrap().claim_state, ClaimState::Confirmed(pid));
        assert_eq!(source.cursor, 1);
        let target = store::load_target_at(home.path()).unwrap();
        assert!(target.is_live(&EntityId::from("E7")));

        let second = run(home.path(), &transport, &PipelineOptions::default()).expect("rerun");
        assert!(second.nothing_to_sync());
    }

    #[test]
    fn run_finishes_a_payload_an_earlier_run_only_received() {
        let home = TempDir::new().expect("home");
        let transport = DirTransport::new(home.path().join("transport"));
        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!("Ada"));
        observe_mutation_at(home.path(), "E7".into(), Operation::Create, fields).unwrap();

        // Interrupted between intake and apply.
        let entries = detect_changes_at(home.path()).unwrap();
        let pid = build_at(home.path(), &entries).unwrap().payload_id;
        send_at(home.path(), &transport, &pid).unwrap();
        let intake = receive_pending_at(home.path(), &transport).unwrap();
        assert_eq!(intake.received.len(), 1);
        assert!(transport.receive().unwrap().is_empty());

        let report = run(home.path(), &transport, &PipelineOptions::default()).expect("run");
        assert!(!report.nothing_to_sync());
        assert!(report.built.is_none());
        assert!(report.received.is_empty());
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].payload_id, pid);
        assert_eq!(report.confirmed.len(), 1);

        let target = store::load_target_at(home.path()).unwrap();
        assert_eq!(target.outcomes.status(&pid), Some(OutcomeStatus::Applied));
        assert!(target.is_live(&EntityId::from("E7")));
        let source = store::load_source_at(home.path()).unwrap();
        assert_eq!(source.entry(1).unwrap().claim_state, ClaimState::Confirmed(pid));

        let second = run(home.path(), &transport, &PipelineOptions::default()).expect("rerun");
        assert!(second.nothing_to_sync());
    }

    #[test]
    fn run_mirrors_a_reapplied_payload_back_to_the_source() {
        let home = TempDir::new().expect("home");
        let transport = DirTransport::new(home.path().join("transport"));
        let mut fields = FieldMap::new();
        fields.insert("salary".into(), json!(98000));
        observe_mutation_at(home.path(), "E9".into(), Operation::Update, fields).unwrap();

        let first = run(home.path(), &transport, &PipelineOptions::default()).expect("run");
        let pid = first.built.clone().expect("payload built");
        assert_eq!(first.applied[0].status, OutcomeStatus::Rejected);
        let source = store::load_source_at(home.path()).unwrap();
        assert_eq!(source.outcomes.status(&pid), Some(OutcomeStatus::Rejected));

        {
            let lock = store::lock_side_at(home.path(), Side::Target).unwrap();
            let mut target = store::load_target_at(home.path()).unwrap();
            let id = EntityId::from("E9");
            target
                .records
                .insert(id.clone(), TargetRecord::new(id, FieldMap::new()));
            store::save_target_at(home.path(), &lock, &target).unwrap();
        }
        let again = reapply_at(home.path(), &pid).unwrap();
        assert_eq!(again.status, OutcomeStatus::Applied);

        let report = run(home.path(), &transport, &PipelineOptions::default()).expect("rerun");
        assert!(report.applied.is_empty());
        assert_eq!(report.confirmed.len(), 1);
        let source = store::load_source_at(home.path()).unwrap();
        let mirrored = source.outcomes.get(&pid).unwrap();
        assert_eq!(mirrored.status, OutcomeStatus::Applied);
        assert_eq!(mirrored.attempts, 2);

        let settled = run(home.path(), &transport, &PipelineOptions::default()).expect("settled");
        assert!(settled.nothing_to_sync());
    }

    #[test]
    fn concurrent_claims_are_retried() {
        let calls = Cell::new(0);
        let (value, tries) = retry_claim(3, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SyncError::ConcurrentClaim { entry_ids: vec![1] })
            } else {
                Ok("built")
            }
        })
        .expect("eventually succeeds");
        assert_eq!(value, "built");
        assert_eq!(tries, 3);
    }

    #[test]
    fn retries_are_bounded() {
        let calls = Cell::new(0);
        let err = retry_claim(2, Duration::from_millis(1), || -> Result<(), SyncError> {
            calls.set(calls.get() + 1);
            Err(SyncError::ConcurrentClaim { entry_ids: vec![1] })
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::ConcurrentClaim { .. }));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let err = retry_claim(5, Duration::from_millis(1), || -> Result<(), SyncError> {
            calls.set(calls.get() + 1);
            Err(SyncError::EmptyBatch)
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::EmptyBatch));
        assert_eq!(calls.get(), 1);
    }
}
