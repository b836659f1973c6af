//! Content-addressed payload sealing.
//!
//! A payload's id is the lowercase hex SHA-256 of the canonical JSON of
//! `(schema_version, entries)`. The receiver recomputes it, so a payload that was
//! altered in transit (or hand-edited on disk) no longer matches its own id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{PayloadEntry, PayloadId, SyncPayload, SCHEMA_VERSION, SOURCE_SYSTEM, TARGET_SYSTEM};

/// Structural defects that make a payload unusable. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadDefect {
    #[error("payload carries no entries")]
    Empty,

    #[error("schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("entries are not strictly ascending by id (entry {id} follows {previous})")]
    OutOfOrder { previous: u64, id: u64 },

    #[error("content hash {actual} does not match payload id")]
    HashMismatch { actual: String },
}

#[derive(Serialize)]
struct HashInput<'a> {
    schema_version: u32,
    entries: &'a [PayloadEntry],
}

/// Compute the content address of `entries` under `schema_version`.
pub fn content_id(schema_version: u32, entries: &[PayloadEntry]) -> PayloadId {
    let input = HashInput {
        schema_version,
        entries,
    };
    // Serializing plain structs and BTreeMaps cannot fail.
    let bytes = serde_json::to_vec(&input).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    PayloadId(hex::encode(hasher.finalize()))
}

/// Build an immutable payload from entry snapshots, sorted by id.
pub fn seal(mut entries: Vec<PayloadEntry>, created_at: DateTime<Utc>) -> SyncPayload {
    entries.sort_by_key(|e| e.id);
    SyncPayload {
        payload_id: content_id(SCHEMA_VERSION, &entries),
        schema_version: SCHEMA_VERSION,
        created_at,
        source_system: SOURCE_SYSTEM.to_string(),
        target_system: TARGET_SYSTEM.to_string(),
        entries,
    }
}

/// Check that a received payload is well-formed and matches its own id.
pub fn check_integrity(payload: &SyncPayload) -> Result<(), PayloadDefect> {
    if payload.entries.is_empty() {
        return Err(PayloadDefect::Empty);
    }
    if payload.schema_version > SCHEMA_VERSION {
        return Err(PayloadDefect::UnsupportedVersion {
            found: payload.schema_version,
            supported: SCHEMA_VERSION,
        });
    }
    for pair in payload.entries.windows(2) {
        if pair[1].id <= pair[0].id {
            return Err(PayloadDefect::OutOfOrder {
                previous: pair[0].id,
                id: pair[1].id,
            });
        }
    }
    let actual = content_id(payload.schema_version, &payload.entries);
    if actual != payload.payload_id {
        return Err(PayloadDefect::HashMismatch { actual: actual.0 });
    }
    Ok(())
}
