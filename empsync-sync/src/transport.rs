//! Transport contract between the two sides, plus a directory-backed transport.
//!
//! Delivery is at-least-once: `receive` hands back every pending payload each
//! time until it is settled, and the receiver is idempotent per payload id.
//!
//! ## `DirTransport` write protocol
//!
//! 1. Serialize the document (pretty JSON).
//! 2. SHA-256 hash the bytes.
//! 3. Hash the file already at the destination, if any.
//! 4. Identical → skip, report a duplicate.
//! 5. Write to `<path>.tmp`.
//! 6. Rename to the final path (atomic on POSIX).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use empsync_core::{
    store, OutcomeStatus, PayloadId, Side, SyncConfig, SyncOutcome, SyncPayload,
};

use crate::error::{io_err, SyncError};

/// Receipt for a delivered payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Ack {
    pub payload_id: PayloadId,
    /// The same payload id had already been delivered.
    pub duplicate: bool,
}

/// Moves payloads source → target and terminal outcomes target → source.
pub trait Transport {
    fn send(&self, payload: &SyncPayload) -> Result<Ack, SyncError>;

    /// Every payload not yet settled, ordered by first entry id.
    fn receive(&self) -> Result<Vec<SyncPayload>, SyncError>;

    fn acknowledge(&self, outcome: &SyncOutcome) -> Result<(), SyncError>;

    /// Every acknowledgement not yet settled.
    fn acknowledgements(&self) -> Result<Vec<SyncOutcome>, SyncError>;

    /// Drop a payload once the target has stored it durably.
    fn settle_payload(&self, _payload_id: &PayloadId) -> Result<(), SyncError> {
        Ok(())
    }

    /// Take a refused payload out of delivery while keeping it for inspection.
    fn quarantine_payload(&self, payload_id: &PayloadId) -> Result<(), SyncError> {
        self.settle_payload(payload_id)
    }

    /// Drop an acknowledgement once the source has confirmed it.
    fn settle_ack(&self, _payload_id: &PayloadId) -> Result<(), SyncError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Write result
// ---------------------------------------------------------------------------

/// Outcome of an individual transport file write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Written { path: PathBuf },
    /// Content identical to the file already there.
    Unchanged { path: PathBuf },
}

// ---------------------------------------------------------------------------
// DirTransport
// ---------------------------------------------------------------------------

/// `transport/outbox/<payload_id>.json` and `transport/acks/<payload_id>.json`.
#[derive(Debug, Clone)]
pub struct DirTransport {
    root: PathBuf,
}

impl DirTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The transport configured for `home`.
    pub fn at(home: &Path, config: &SyncConfig) -> Self {
        Self::new(config.transport_dir_at(home))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.root.join("outbox")
    }

    pub fn acks_dir(&self) -> PathBuf {
        self.root.join("acks")
    }

    fn payload_path(&self, payload_id: &PayloadId) -> Result<PathBuf, SyncError> {
        Ok(self.outbox_dir().join(file_name(payload_id)?))
    }

    fn ack_path(&self, payload_id: &PayloadId) -> Result<PathBuf, SyncError> {
        Ok(self.acks_dir().join(file_name(payload_id)?))
    }
}

impl Transport for DirTransport {
    fn send(&self, payload: &SyncPayload) -> Result<Ack, SyncError> {
        let path = self.payload_path(&payload.payload_id)?;
        let content = serde_json::to_string_pretty(payload)?;
        let duplicate = matches!(
            atomic_write(&path, &content)?,
            WriteResult::Unchanged { .. }
        );
        Ok(Ack {
            payload_id: payload.payload_id.clone(),
            duplicate,
        })
    }

    fn receive(&self) -> Result<Vec<SyncPayload>, SyncError> {
        let mut payloads: Vec<SyncPayload> = read_documents(&self.outbox_dir())?;
        payloads.sort_by(|a, b| {
            let first = |p: &SyncPayload| p.entries.first().map(|e| e.id).unwrap_or(0);
            first(a)
                .cmp(&first(b))
                .then_with(|| a.payload_id.cmp(&b.payload_id))
        });
        Ok(payloads)
    }

    fn acknowledge(&self, outcome: &SyncOutcome) -> Result<(), SyncError> {
        let path = self.ack_path(&outcome.payload_id)?;
        let content = serde_json::to_string_pretty(outcome)?;
        atomic_write(&path, &content)?;
        Ok(())
    }

    fn acknowledgements(&self) -> Result<Vec<SyncOutcome>, SyncError> {
        let mut acks: Vec<SyncOutcome> = read_documents(&self.acks_dir())?;
        acks.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(acks)
    }

    fn settle_payload(&self, payload_id: &PayloadId) -> Result<(), SyncError> {
        remove_if_present(&self.payload_path(payload_id)?)
    }

    fn quarantine_payload(&self, payload_id: &PayloadId) -> Result<(), SyncError> {
        let path = self.payload_path(payload_id)?;
        match std::fs::rename(&path, path.with_extension("json.bad")) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    fn settle_ack(&self, payload_id: &PayloadId) -> Result<(), SyncError> {
        remove_if_present(&self.ack_path(payload_id)?)
    }
}

/// Payload ids become file names, so only plain hex is accepted.
fn file_name(payload_id: &PayloadId) -> Result<String, SyncError> {
    let id = &payload_id.0;
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SyncError::MalformedPayload {
            payload_id: payload_id.clone(),
            reason: "payload id is not a hex digest".into(),
        });
    }
    Ok(format!("{id}.json"))
}

pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<WriteResult, SyncError> {
    let tmp = store::tmp_path(path);
    atomic_write_with_tmp(path, content, &tmp)
}

fn atomic_write_with_tmp(path: &Path, content: &str, tmp: &Path) -> Result<WriteResult, SyncError> {
    let digest = sha256_hex(content.as_bytes());

    match std::fs::read(path) {
        Ok(existing) if sha256_hex(&existing) == digest => {
            tracing::debug!("unchanged: {}", path.display());
            return Ok(WriteResult::Unchanged {
                path: path.to_path_buf(),
            });
        }
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(io_err(path, err)),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    if let Some(tmp_parent) = tmp.parent() {
        std::fs::create_dir_all(tmp_parent).map_err(|e| io_err(tmp_parent, e))?;
    }
    std::fs::write(tmp, content).map_err(|e| io_err(tmp, e))?;

    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(io_err(path, e));
    }

    tracing::debug!("wrote: {}", path.display());
    Ok(WriteResult::Written {
        path: path.to_path_buf(),
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Parse every `*.json` document in `dir`. Unreadable documents are moved
/// aside as `<name>.bad` so they stop blocking delivery.
fn read_documents<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>, SyncError> {
    let listing = match std::fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(dir, err)),
    };

    let mut paths = Vec::new();
    for dirent in listing {
        let dirent = dirent.map_err(|e| io_err(dir, e))?;
        let path = dirent.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            // Settled by a concurrent reader.
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&path, err)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(doc) => documents.push(doc),
            Err(err) => {
                tracing::warn!("unparseable transport document {}: {err}", path.display());
                let aside = path.with_extension("json.bad");
                std::fs::rename(&path, &aside).map_err(|e| io_err(&path, e))?;
            }
        }
    }
    Ok(documents)
}

fn remove_if_present(path: &Path) -> Result<(), SyncError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

// ---------------------------------------------------------------------------
// send_at
// ---------------------------------------------------------------------------

/// Send a payload the source has built and record `SENT` on the source side.
pub fn send_at<T: Transport + ?Sized>(
    home: &Path,
    transport: &T,
    payload_id: &PayloadId,
) -> Result<Ack, SyncError> {
    let state = store::load_source_at(home)?;
    let payload = state
        .payloads
        .get(payload_id)
        .ok_or_else(|| SyncError::UnknownPayload(payload_id.clone()))?;
    let ack = transport.send(payload)?;

    let lock = store::lock_side_at(home, Side::Source)?;
    let mut state = store::load_source_at(home)?;
    let row = SyncOutcome::new(payload_id.clone(), Side::Source, OutcomeStatus::Sent);
    if state.outcomes.record(row) == empsync_core::RecordOutcome::Written {
        store::save_source_at(home, &lock, &state)?;
        tracing::info!("sent payload {}", payload_id.short());
    } else {
        tracing::debug!("payload {} already recorded as sent", payload_id.short());
    }
    Ok(ack)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
