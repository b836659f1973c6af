//! Reconciliation sweep: claims that were never confirmed, and REJECTED
//! payloads nobody has re-applied.
//!
//! Claims stay invisible to `detect`; this is the audit query that surfaces
//! them so a crashed build (payload built, never delivered) can be re-sent.
//! Unresolved rejections are flagged once they pass the configured age and are
//! never expired or allowed to block later payloads.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use empsync_core::{
    store, EntityId, OutcomeStatus, PayloadId, SourceState, SyncConfig, TargetState,
};

use crate::transport::{send_at, Ack, Transport};
use crate::SyncError;

/// A payload whose entries are still CLAIMED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedClaim {
    pub payload_id: PayloadId,
    pub entry_ids: Vec<u64>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// A source `SENT` row exists.
    pub sent: bool,
    pub age_secs: u64,
    pub stale: bool,
}

/// A target `REJECTED` row that has not been superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPayload {
    pub payload_id: PayloadId,
    pub rejected: BTreeMap<EntityId, String>,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
    pub age_secs: u64,
    /// Older than `rejected_alert_after_secs`.
    pub overdue: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub claims: Vec<UnconfirmedClaim>,
    pub rejected: Vec<RejectedPayload>,
    pub resent: Vec<Ack>,
}

pub(crate) fn age_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    now.signed_duration_since(since).num_seconds().max(0) as u64
}

/// Every payload holding CLAIMED entries, oldest claim first.
pub fn unconfirmed_claims(
    state: &SourceState,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Vec<UnconfirmedClaim> {
    let mut claims: Vec<UnconfirmedClaim> = state
        .open_claims()
        .into_iter()
        .map(|(payload_id, entries)| {
            let claimed_at = entries.iter().filter_map(|e| e.claimed_at).min();
            let age = claimed_at.map(|at| age_secs(at, now)).unwrap_or(0);
            UnconfirmedClaim {
                sent: state.outcomes.get(&payload_id).is_some(),
                entry_ids: entries.iter().map(|e| e.id).collect(),
                claimed_at,
                age_secs: age,
                stale: age >= stale_after.num_seconds().max(0) as u64,
                payload_id,
            }
        })
        .collect();
    claims.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then(a.entry_ids.cmp(&b.entry_ids)));
    claims
}

pub fn unconfirmed_claims_at(
    home: &Path,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<Vec<UnconfirmedClaim>, SyncError> {
    let state = store::load_source_at(home)?;
    Ok(unconfirmed_claims(&state, now, stale_after))
}

/// Target payloads currently REJECTED.
pub fn rejected_payloads(
    state: &TargetState,
    now: DateTime<Utc>,
    alert_after: Duration,
) -> Vec<RejectedPayload> {
    state
        .outcomes
        .iter()
        .filter(|row| row.status == OutcomeStatus::Rejected)
        .map(|row| {
            let age = age_secs(row.recorded_at, now);
            RejectedPayload {
                payload_id: row.payload_id.clone(),
                rejected: row.rejected.clone(),
                attempts: row.attempts,
                recorded_at: row.recorded_at,
                age_secs: age,
                overdue: age >= alert_after.num_seconds().max(0) as u64,
            }
        })
        .collect()
}

/// Send a built payload again. Duplicates are harmless on the receiving side.
pub fn resend_at<T: Transport + ?Sized>(
    home: &Path,
    transport: &T,
    payload_id: &PayloadId,
) -> Result<Ack, SyncError> {
    let ack = send_at(home, transport, payload_id)?;
    tracing::info!(
        "re-sent payload {}{}",
        payload_id.short(),
        if ack.duplicate { " (already in transport)" } else { "" }
    );
    Ok(ack)
}

/// Run the sweep. With `resend`, every stale or never-sent claim is sent again.
pub fn reconcile_at<T: Transport + ?Sized>(
    home: &Path,
    transport: &T,
    config: &SyncConfig,
    now: DateTime<Utc>,
    resend: bool,
) -> Result<ReconcileReport, SyncError> {
    let source = store::load_source_at(home)?;
    let target = store::load_target_at(home)?;

    let claims = unconfirmed_claims(&source, now, config.stale_claim_after());
    for claim in claims.iter().filter(|c| c.stale) {
        tracing::warn!(
            "payload {} has held entries {:?} unconfirmed for {}",
            claim.payload_id.short(),
            claim.entry_ids,
            crate::status::format_seconds(claim.age_secs)
        );
    }

    let rejected = rejected_payloads(&target, now, config.rejected_alert_after());
    for alert in rejected.iter().filter(|r| r.overdue) {
        tracing::warn!(
            "payload {} has been REJECTED for {} without re-application ({} entity(ies))",
            alert.payload_id.short(),
            crate::status::format_seconds(alert.age_secs),
            alert.rejected.len()
        );
    }

    let mut resent = Vec::new();
    if resend {
        for claim in claims.iter().filter(|c| c.stale || !c.sent) {
            resent.push(resend_at(home, transport, &claim.payload_id)?);
        }
    }

    Ok(ReconcileReport {
        claims,
        rejected,
        resent,
    })
}
