//! Error types for empsync-sync.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use empsync_core::{EntityId, OutcomeStatus, PayloadId, Side, StoreError};

use crate::validator::Problem;

/// All errors that can arise from pipeline operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A ledger or state document could not be read, written, or locked.
    /// Retry with backoff.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    /// A mutation handed to `observe_mutation` has an impossible shape.
    #[error("{0}")]
    InvalidMutation(String),

    /// A transport file could not be read or written.
    #[error("transport I/O error at {path}: {source}")]
    Transport {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Entries were claimed by another build between detection and claim.
    /// Retry detection.
    #[error("entries {entry_ids:?} were claimed concurrently; detect again")]
    ConcurrentClaim { entry_ids: Vec<u64> },

    /// Schema/version mismatch, bad hash, or unparseable payload. Not retryable.
    #[error("malformed payload {payload_id}: {reason}")]
    MalformedPayload { payload_id: PayloadId, reason: String },

    /// Data-quality problems; the payload is held for correction.
    #[error("payload {payload_id} failed validation with {} problem(s)", problems.len())]
    ValidationFailed {
        payload_id: PayloadId,
        problems: Vec<Problem>,
    },

    /// Some entities were rejected during apply; the rest were applied.
    #[error("payload {payload_id} partially applied; {} entity(ies) rejected", rejected.len())]
    PartialApplyFailure {
        payload_id: PayloadId,
        rejected: BTreeMap<EntityId, String>,
    },

    /// Only a TARGET-side terminal outcome can confirm entries.
    #[error("a {side} {status} outcome for payload {payload_id} cannot confirm entries")]
    NotConfirmable {
        payload_id: PayloadId,
        side: Side,
        status: OutcomeStatus,
    },

    /// The payload id is not known on the side asked.
    #[error("unknown payload {0}")]
    UnknownPayload(PayloadId),

    /// `build` was called with no entries.
    #[error("cannot build a payload from an empty batch")]
    EmptyBatch,

    /// `build` was handed entries that are not in the change ledger.
    #[error("entries {0:?} are not in the change ledger")]
    UnknownEntries(Vec<u64>),

    /// A tool call named a tool that does not exist.
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    /// JSON error outside the state documents (transport files, tool calls).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidMutation(reason) => SyncError::InvalidMutation(reason),
            other => SyncError::StorageUnavailable(other),
        }
    }
}

impl SyncError {
    /// Infrastructure and contention errors; everything else needs an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StorageUnavailable(_)
                | SyncError::Transport { .. }
                | SyncError::ConcurrentClaim { .. }
        )
    }
}

/// Convenience constructor for [`SyncError::Transport`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Transport {
        path: path.into(),
        source,
    }
}
