//! Status classification across both sides.
//!
//! Per-payload precedence:
//! 1. `Applied` / `Rejected` (terminal row on either side)
//! 2. `StaleClaim` (entries claimed longer than `stale_claim_after_secs`)
//! 3. `InFlight` (sent or received, not yet terminal)
//! 4. `Unsent` (built and claimed, never sent)

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use empsync_core::{
    store, ClaimState, OutcomeStatus, PayloadId, SourceState, SyncConfig, SyncOutcome,
    TargetState,
};

use crate::reconcile::age_secs;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PayloadState {
    Unsent,
    InFlight,
    StaleClaim,
    Applied,
    Rejected {
        /// Unresolved for longer than `rejected_alert_after_secs`.
        overdue: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadStatus {
    pub payload_id: PayloadId,
    pub entries: usize,
    pub state: PayloadState,
    pub created_at: DateTime<Utc>,
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub last_id: u64,
    pub cursor: u64,
    pub unclaimed: usize,
    pub claimed: usize,
    pub confirmed: usize,
    pub target_live: usize,
    pub target_tombstoned: usize,
    /// Delivered payloads refused as malformed.
    pub refused: usize,
    pub payloads: Vec<PayloadStatus>,
}

impl StatusReport {
    /// Anything an operator should look at.
    pub fn needs_attention(&self) -> bool {
        self.refused > 0
            || self.payloads.iter().any(|p| {
                matches!(
                    p.state,
                    PayloadState::StaleClaim | PayloadState::Rejected { overdue: true }
                )
            })
    }
}

/// Classify every payload known to either side.
pub fn classify(
    source: &SourceState,
    target: &TargetState,
    config: &SyncConfig,
    now: DateTime<Utc>,
) -> StatusReport {
    let mut report = StatusReport {
        last_id: source.last_id,
        cursor: source.cursor,
        target_live: target.live_count(),
        target_tombstoned: target.records.len() - target.live_count(),
        refused: target.refused.len(),
        ..StatusReport::default()
    };
    for entry in &source.entries {
        match entry.claim_state {
            ClaimState::Unclaimed => report.unclaimed += 1,
            ClaimState::Claimed(_) => report.claimed += 1,
            ClaimState::Confirmed(_) => report.confirmed += 1,
        }
    }

    let open_claims = source.open_claims();
    let stale_after = config.stale_claim_after().num_seconds().max(0) as u64;
    let alert_after = config.rejected_alert_after().num_seconds().max(0) as u64;

    let ids: BTreeSet<&PayloadId> = source.payloads.keys().chain(target.received.keys()).collect();
    for payload_id in ids {
        let Some(payload) = source
            .payloads
            .get(payload_id)
            .or_else(|| target.received.get(payload_id))
        else {
            continue;
        };

        let terminal: Option<&SyncOutcome> = target
            .outcomes
            .get(payload_id)
            .filter(|row| row.status.is_terminal())
            .or_else(|| {
                source
                    .outcomes
                    .get(payload_id)
                    .filter(|row| row.status.is_terminal())
            });

        let state = match terminal {
            Some(row) if row.status == OutcomeStatus::Applied => PayloadState::Applied,
            Some(row) => PayloadState::Rejected {
                overdue: age_secs(row.recorded_at, now) >= alert_after,
            },
            None => {
                let claimed_since = open_claims
                    .get(payload_id)
                    .and_then(|entries| entries.iter().filter_map(|e| e.claimed_at).min());
                let in_transit = source.outcomes.get(payload_id).is_some()
                    || target.outcomes.get(payload_id).is_some();
                match claimed_since {
                    Some(at) if age_secs(at, now) >= stale_after => PayloadState::StaleClaim,
                    _ if in_transit => PayloadState::InFlight,
                    _ => PayloadState::Unsent,
                }
            }
        };

        report.payloads.push(PayloadStatus {
            payload_id: payload_id.clone(),
            entries: payload.entries.len(),
            state,
            created_at: payload.created_at,
            error_detail: terminal.and_then(|row| row.error_detail.clone()),
        });
    }
    report
        .payloads
        .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.payload_id.cmp(&b.payload_id)));
    report
}

pub fn status_at(home: &Path, config: &SyncConfig, now: DateTime<Utc>) -> Result<StatusReport, SyncError> {
    let source = store::load_source_at(home)?;
    let target = store::load_target_at(home)?;
    Ok(classify(&source, &target, config, now))
}

/// Format age from a chrono timestamp.
pub fn format_datetime_age(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format_seconds(age_secs(timestamp, now))
}

/// Compact age: `42s`, `5m`, `3h`, `2d`.
pub fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use empsync_core::{payload, EntityId, FieldMap, Operation, Side};
    use serde_json::json;

    fn source_with_payload() -> (SourceState, PayloadId) {
        let mut source = SourceState::default();
        let mut fields = FieldMap::new();
        fields.insert("salary".into(), json!(98000));
        let entry = source
            .observe(EntityId::from("E42"), Operation::Update, fields, Utc::now())
            .unwrap();
        let sealed = payload::seal(vec![entry.snapshot()], Utc::now());
        let pid = sealed.payload_id.clone();
        source.claim(&[entry.id], sealed, Utc::now()).unwrap();
        (source, pid)
    }

    fn state_of(report: &StatusReport, pid: &PayloadId) -> PayloadState {
        report
            .payloads
            .iter()
            .find(|p| &p.payload_id == pid)
            .map(|p| p.state)
            .unwrap()
    }

    #[test]
    fn fresh_build_is_unsent_then_in_flight() {
        let (mut source, pid) = source_with_payload();
        let target = TargetState::default();
        let config = SyncConfig::default();

        let report = classify(&source, &target, &config, Utc::now());
        assert_eq!(state_of(&report, &pid), PayloadState::Unsent);
        assert_eq!(report.claimed, 1);
        assert_eq!(report.last_id, 1);

        source
            .outcomes
            .record(SyncOutcome::new(pid.clone(), Side::Source, OutcomeStatus::Sent));
        let report = classify(&source, &target, &config, Utc::now());
        assert_eq!(state_of(&report, &pid), PayloadState::InFlight);
        assert!(!report.needs_attention());
    }

    #[test]
    fn old_claim_is_stale() {
        let (source, pid) = source_with_payload();
        let later = Utc::now() + Duration::hours(2);
        let report = classify(&source, &TargetState::default(), &SyncConfig::default(), later);
        assert_eq!(state_of(&report, &pid), PayloadState::StaleClaim);
        assert!(report.needs_attention());
    }

    #[test]
    fn target_terminal_row_wins() {
        let (source, pid) = source_with_payload();
        let mut target = TargetState::default();
        let mut row = SyncOutcome::new(pid.clone(), Side::Target, OutcomeStatus::Rejected);
        row.error_detail = Some("E42: entry 1: gone".into());
        target.outcomes.record(row);

        let config = SyncConfig::default();
        let report = classify(&source, &target, &config, Utc::now());
        assert_eq!(
            state_of(&report, &pid),
            PayloadState::Rejected { overdue: false }
        );
        assert_eq!(
            report.payloads[0].error_detail.as_deref(),
            Some("E42: entry 1: gone")
        );

        let report = classify(&source, &target, &config, Utc::now() + Duration::days(3));
        assert_eq!(
            state_of(&report, &pid),
            PayloadState::Rejected { overdue: true }
        );
    }

    #[test]
    fn seconds_formatting() {
        assert_eq!(format_seconds(0), "0s");
        assert_eq!(format_seconds(59), "59s");
        assert_eq!(format_seconds(60), "1m");
        assert_eq!(format_seconds(3_599), "59m");
        assert_eq!(format_seconds(3_600), "1h");
        assert_eq!(format_seconds(86_399), "23h");
        assert_eq!(format_seconds(86_400), "1d");
    }

    #[test]
    fn datetime_age_never_negative() {
        let now = Utc::now();
        assert_eq!(format_datetime_age(now + Duration::minutes(5), now), "0s");
        assert_eq!(format_datetime_age(now - Duration::minutes(5), now), "5m");
    }
}
