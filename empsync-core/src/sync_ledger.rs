//! Sync Ledger: one outcome row per payload for one side.
//!
//! Rows only move forward (`SENT`/`RECEIVED` → `VALIDATED` → `APPLIED | REJECTED`).
//! Once a row is `APPLIED` every further write for that payload is a no-op.
//! A `REJECTED` row is only replaced through [`SyncLedger::supersede_rejected`],
//! the explicit operator re-application path, or by mirroring the row such a
//! re-application produced on the other side ([`SyncLedger::mirror`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{OutcomeStatus, PayloadId, SyncOutcome};

/// What [`SyncLedger::record`] did with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Row created or advanced.
    Written,
    /// Existing row is already at or past this status; nothing changed.
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncLedger {
    rows: BTreeMap<PayloadId, SyncOutcome>,
}

impl SyncLedger {
    pub fn get(&self, payload_id: &PayloadId) -> Option<&SyncOutcome> {
        self.rows.get(payload_id)
    }

    pub fn status(&self, payload_id: &PayloadId) -> Option<OutcomeStatus> {
        self.rows.get(payload_id).map(|row| row.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncOutcome> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write `outcome` if it moves the payload's row forward.
    pub fn record(&mut self, outcome: SyncOutcome) -> RecordOutcome {
        if let Some(existing) = self.rows.get(&outcome.payload_id) {
            if existing.status.is_terminal() || rank(outcome.status) <= rank(existing.status) {
                return RecordOutcome::Unchanged;
            }
        }
        self.rows.insert(outcome.payload_id.clone(), outcome);
        RecordOutcome::Written
    }

    /// Replace a `REJECTED` row with the result of an explicit re-application.
    ///
    /// Returns `Unchanged` when the row is missing or not `REJECTED`.
    pub fn supersede_rejected(&mut self, mut outcome: SyncOutcome) -> RecordOutcome {
        let Some(existing) = self.rows.get(&outcome.payload_id) else {
            return RecordOutcome::Unchanged;
        };
        if existing.status != OutcomeStatus::Rejected || !outcome.status.is_terminal() {
            return RecordOutcome::Unchanged;
        }
        outcome.attempts = existing.attempts.saturating_add(1);
        self.rows.insert(outcome.payload_id.clone(), outcome);
        RecordOutcome::Written
    }

    /// Mirror a terminal row from the other side.
    ///
    /// Behaves like [`SyncLedger::record`], except that a `REJECTED` row gives
    /// way to a terminal row from a later attempt.
    pub fn mirror(&mut self, outcome: SyncOutcome) -> RecordOutcome {
        let supersedes = self.rows.get(&outcome.payload_id).is_some_and(|existing| {
            existing.status == OutcomeStatus::Rejected
                && outcome.status.is_terminal()
                && outcome.attempts > existing.attempts
        });
        if supersedes {
            self.rows.insert(outcome.payload_id.clone(), outcome);
            return RecordOutcome::Written;
        }
        self.record(outcome)
    }
}

fn rank(status: OutcomeStatus) -> u8 {
    match status {
        OutcomeStatus::Sent | OutcomeStatus::Received => 0,
        OutcomeStatus::Validated => 1,
        OutcomeStatus::Applied | OutcomeStatus::Rejected => 2,
    }
}
