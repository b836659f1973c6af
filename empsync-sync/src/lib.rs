//! # empsync-sync
//!
//! The HR → Payroll pipeline stages, each callable on its own and each
//! idempotent:
//!
//! - [`detector`] finds unclaimed changes and records new ones
//! - [`builder`] claims them into a content-addressed payload
//! - [`transport`] moves payloads and acknowledgements between the sides
//! - [`receiver`] and [`validator`] admit payloads on the target
//! - [`applier`] mutates target records; [`diff`] previews it
//! - [`confirm`] closes the loop on the source
//! - [`reconcile`] and [`status`] audit what is stuck
//!
//! [`pipeline::run`] drives all of it once; [`tools::SyncTools`] exposes the
//! same operations as tool calls.

pub mod applier;
pub mod builder;
pub mod confirm;
pub mod detector;
pub mod diff;
pub mod error;
pub mod pipeline;
pub mod receiver;
pub mod reconcile;
pub mod status;
pub mod tools;
pub mod transport;
pub mod validator;

pub use applier::{apply_at, reapply_at, ApplyOptions, ApplyResult};
pub use builder::build_at;
pub use confirm::{confirm_at, confirm_pending_at, ConfirmReport};
pub use detector::{detect, detect_at, detect_changes_at, observe_mutation_at};
pub use diff::{preview_at, Preview, RecordDiff};
pub use error::SyncError;
pub use pipeline::{run, PipelineOptions, PipelineReport};
pub use receiver::{receive_payload_at, receive_pending_at, Intake};
pub use reconcile::{reconcile_at, resend_at, unconfirmed_claims_at, ReconcileReport};
pub use status::{status_at, PayloadState, StatusReport};
pub use tools::{SyncTools, ToolRequest, ToolResponse};
pub use transport::{send_at, Ack, DirTransport, Transport};
pub use validator::{validate, validate_sync_data_at, Problem, ValidationResult};
