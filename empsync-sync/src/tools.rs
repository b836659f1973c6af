//! Tool-call surface for orchestrating callers.
//!
//! Every call is independently idempotent, so a caller may retry any of them.
//! [`SyncTools::call`] accepts one JSON request and returns one JSON response,
//! suitable for a newline-delimited request/response stream.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use empsync_core::{store, ChangeEntry, ClaimState, PayloadId, SyncConfig, SyncPayload};

use crate::applier::{apply_at, ApplyOptions, ApplyResult};
use crate::builder::build_at;
use crate::confirm::{confirm_pending_at, ConfirmReport};
use crate::detector::detect_changes_at;
use crate::pipeline::{self, PipelineOptions, PipelineReport};
use crate::receiver::receive_payload_at;
use crate::status::{status_at, StatusReport};
use crate::transport::{send_at, Ack, Transport};
use crate::validator::{validate_sync_data_at, ValidationResult};
use crate::SyncError;

/// Names accepted by [`SyncTools::call`].
pub const TOOL_NAMES: &[&str] = &[
    "detect_changes",
    "create_sync_payload",
    "send_payload",
    "receive_payload",
    "validate_sync_data",
    "apply_changes",
    "confirm_pending",
    "run_pipeline",
    "status",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The caller may retry after a backoff.
    #[serde(default)]
    pub retryable: bool,
}

impl ToolResponse {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            retryable: false,
        }
    }

    fn failure(error: String, retryable: bool) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
            retryable,
        }
    }
}

#[derive(Deserialize)]
struct EntriesArgs {
    entries: Vec<ChangeEntry>,
}

#[derive(Deserialize)]
struct PayloadArgs {
    payload: SyncPayload,
}

#[derive(Deserialize)]
struct PayloadIdArgs {
    payload_id: PayloadId,
    #[serde(default)]
    allow_partial: Option<bool>,
    #[serde(default)]
    dry_run: bool,
}

pub struct SyncTools<T> {
    home: PathBuf,
    transport: T,
    config: SyncConfig,
}

impl<T: Transport> SyncTools<T> {
    pub fn new(home: impl Into<PathBuf>, transport: T, config: SyncConfig) -> Self {
        Self {
            home: home.into(),
            transport,
            config,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn detect_changes(&self) -> Result<Vec<ChangeEntry>, SyncError> {
        detect_changes_at(&self.home)
    }

    /// Build and claim. Retrying with entries already claimed together by one
    /// payload returns that payload's id.
    pub fn create_sync_payload(&self, entries: &[ChangeEntry]) -> Result<PayloadId, SyncError> {
        match build_at(&self.home, entries) {
            Ok(payload) => Ok(payload.payload_id),
            Err(err @ SyncError::ConcurrentClaim { .. }) => {
                self.existing_claim(entries).ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    fn existing_claim(&self, entries: &[ChangeEntry]) -> Option<PayloadId> {
        let state = store::load_source_at(&self.home).ok()?;
        let mut ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        ids.dedup();

        let first = state.entry(*ids.first()?)?;
        let pid = match &first.claim_state {
            ClaimState::Claimed(pid) | ClaimState::Confirmed(pid) => pid,
            ClaimState::Unclaimed => return None,
        };
        let payload = state.payloads.get(pid)?;
        (payload.entry_ids() == ids).then(|| pid.clone())
    }

    pub fn send_payload(&self, payload_id: &PayloadId) -> Result<Ack, SyncError> {
        send_at(&self.home, &self.transport, payload_id)
    }

    pub fn receive_payload(&self, payload: &SyncPayload) -> Result<Ack, SyncError> {
        receive_payload_at(&self.home, payload)
    }

    pub fn validate_sync_data(&self, payload_id: &PayloadId) -> Result<ValidationResult, SyncError> {
        validate_sync_data_at(&self.home, payload_id)
    }

    /// Apply and acknowledge the terminal outcome back to the source.
    pub fn apply_changes(
        &self,
        payload_id: &PayloadId,
        options: ApplyOptions,
    ) -> Result<ApplyResult, SyncError> {
        let result = apply_at(&self.home, payload_id, options)?;
        if !result.dry_run {
            let target = store::load_target_at(&self.home)?;
            if let Some(row) = target.outcomes.get(payload_id) {
                self.transport.acknowledge(row)?;
            }
        }
        Ok(result)
    }

    pub fn confirm_pending(&self) -> Result<Vec<ConfirmReport>, SyncError> {
        confirm_pending_at(&self.home, &self.transport)
    }

    pub fn run_pipeline(&self) -> Result<PipelineReport, SyncError> {
        pipeline::run(
            &self.home,
            &self.transport,
            &PipelineOptions::from_config(&self.config),
        )
    }

    pub fn status(&self) -> Result<StatusReport, SyncError> {
        status_at(&self.home, &self.config, Utc::now())
    }

    /// Dispatch one JSON tool request.
    pub fn call(&self, request: &ToolRequest) -> ToolResponse {
        tracing::debug!("tool call {}", request.tool);
        match self.dispatch(request) {
            Ok(data) => ToolResponse::success(data),
            Err(err) => {
                let retryable = err.is_retryable();
                ToolResponse::failure(err.to_string(), retryable)
            }
        }
    }

    /// Parse one request line and render one response line.
    pub fn call_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<ToolRequest>(line) {
            Ok(request) => self.call(&request),
            Err(err) => ToolResponse::failure(format!("invalid request: {err}"), false),
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"unserializable response"}"#.to_string())
    }

    fn dispatch(&self, request: &ToolRequest) -> Result<Value, SyncError> {
        let args = || request.args.clone();
        let value = match request.tool.as_str() {
            "detect_changes" => serde_json::to_value(self.detect_changes()?)?,
            "create_sync_payload" => {
                let args: EntriesArgs = serde_json::from_value(args())?;
                let payload_id = self.create_sync_payload(&args.entries)?;
                serde_json::json!({ "payload_id": payload_id })
            }
            "send_payload" => {
                let args: PayloadIdArgs = serde_json::from_value(args())?;
                serde_json::to_value(self.send_payload(&args.payload_id)?)?
            }
            "receive_payload" => {
                let args: PayloadArgs = serde_json::from_value(args())?;
                serde_json::to_value(self.receive_payload(&args.payload)?)?
            }
            "validate_sync_data" => {
                let args: PayloadIdArgs = serde_json::from_value(args())?;
                serde_json::to_value(self.validate_sync_data(&args.payload_id)?)?
            }
            "apply_changes" => {
                let args: PayloadIdArgs = serde_json::from_value(args())?;
                let options = ApplyOptions {
                    allow_partial: args
                        .allow_partial
                        .unwrap_or(self.config.allow_partial_apply),
                    dry_run: args.dry_run,
                };
                serde_json::to_value(self.apply_changes(&args.payload_id, options)?)?
            }
            "confirm_pending" => serde_json::to_value(self.confirm_pending()?)?,
            "run_pipeline" => serde_json::to_value(self.run_pipeline()?)?,
            "status" => serde_json::to_value(self.status()?)?,
            other => return Err(SyncError::UnknownTool(other.to_string())),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::observe_mutation_at;
    use crate::transport::DirTransport;
    use empsync_core::{FieldMap, Operation, OutcomeStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn tools(home: &Path) -> SyncTools<DirTransport> {
        SyncTools::new(
            home,
            DirTransport::new(home.join("transport")),
            SyncConfig::default(),
        )
    }

    fn observe_create(home: &Path, id: &str) {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!("Ada"));
        observe_mutation_at(home, id.into(), Operation::Create, fields).unwrap();
    }

    #[test]
    fn typed_calls_walk_the_pipeline() {
        let home = TempDir::new().unwrap();
        observe_create(home.path(), "E1");
        let tools = tools(home.path());

        let entries = tools.detect_changes().unwrap();
        let pid = tools.create_sync_payload(&entries).unwrap();
        assert_eq!(tools.create_sync_payload(&entries).unwrap(), pid, "retry is safe");

        let payload = store::load_source_at(home.path()).unwrap().payloads[&pid].clone();
        assert!(!tools.receive_payload(&payload).unwrap().duplicate);
        assert!(tools.receive_payload(&payload).unwrap().duplicate);
        assert!(tools.validate_sync_data(&pid).unwrap().ok);

        let result = tools.apply_changes(&pid, ApplyOptions::default()).unwrap();
        assert_eq!(result.status, OutcomeStatus::Applied);
        let again = tools.apply_changes(&pid, ApplyOptions::default()).unwrap();
        assert!(again.recorded);

        let confirmed = tools.confirm_pending().unwrap();
        assert_eq!(confirmed[0].confirmed, vec![1]);
    }

    #[test]
    fn json_dispatch_reports_data_and_errors() {
        let home = TempDir::new().unwrap();
        observe_create(home.path(), "E1");
        let tools = tools(home.path());

        let detected = tools.call(&ToolRequest {
            tool: "detect_changes".into(),
            args: Value::Null,
        });
        assert!(detected.ok);
        let entries = detected.data.unwrap();
        assert_eq!(entries.as_array().map(Vec::len), Some(1));

        let created = tools.call(&ToolRequest {
            tool: "create_sync_payload".into(),
            args: json!({ "entries": entries }),
        });
        assert!(created.ok, "{:?}", created.error);

        let unknown = tools.call(&ToolRequest {
            tool: "drop_tables".into(),
            args: Value::Null,
        });
        assert!(!unknown.ok);
        assert!(unknown.error.unwrap().contains("drop_tables"));

        let missing = tools.call(&ToolRequest {
            tool: "apply_changes".into(),
            args: json!({ "payload_id": "abc" }),
        });
        assert!(!missing.ok);
        assert!(!missing.retryable);
    }

    #[test]
    fn call_line_handles_bad_json() {
        let home = TempDir::new().unwrap();
        let line = tools(home.path()).call_line("not json");
        let response: ToolResponse = serde_json::from_str(&line).unwrap();
        assert!(!response.ok);
        assert!(response.error.unwrap().starts_with("invalid request"));
    }
}
