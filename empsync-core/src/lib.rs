//! empsync core library: domain types, persisted state for both sides, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes and domain structs
//! - [`error`]: [`StoreError`]
//! - [`ledger`]: source-side Change Ledger document
//! - [`target`]: target-side record store document
//! - [`sync_ledger`]: per-side outcome rows
//! - [`payload`]: content-addressed payload sealing
//! - [`store`]: load / save / lock
//! - [`config`]: `config.yaml`

pub mod config;
pub mod error;
pub mod ledger;
pub mod payload;
pub mod store;
pub mod sync_ledger;
pub mod target;
pub mod types;

pub use config::SyncConfig;
pub use error::StoreError;
pub use ledger::{ClaimConflict, Confirmation, SourceState};
pub use payload::PayloadDefect;
pub use sync_ledger::{RecordOutcome, SyncLedger};
pub use target::{RefusedPayload, TargetState};
pub use types::{
    ChangeEntry, ClaimState, EntityId, FieldMap, Operation, OutcomeStatus, PayloadEntry,
    PayloadId, Side, SyncOutcome, SyncPayload, TargetRecord, SCHEMA_VERSION,
};
