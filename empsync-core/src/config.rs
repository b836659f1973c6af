//! `~/.empsync/config.yaml`: optional pipeline settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::store::{config_path_at, home, root_at};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Apply the valid entries of a payload that fails validation instead of
    /// rejecting it wholesale.
    pub allow_partial_apply: bool,
    pub max_claim_retries: u32,
    pub retry_backoff_ms: u64,
    /// Unconfirmed claims older than this are reported by the reconciliation sweep.
    pub stale_claim_after_secs: u64,
    /// REJECTED payloads older than this are flagged in status output.
    pub rejected_alert_after_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            allow_partial_apply: false,
            max_claim_retries: 3,
            retry_backoff_ms: 200,
            stale_claim_after_secs: 60 * 60,
            rejected_alert_after_secs: 24 * 60 * 60,
            transport_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn stale_claim_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamp_secs(self.stale_claim_after_secs))
    }

    pub fn rejected_alert_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamp_secs(self.rejected_alert_after_secs))
    }

    /// Transport root: the configured directory, else `<home>/.empsync/transport`.
    pub fn transport_dir_at(&self, home: &Path) -> PathBuf {
        self.transport_dir
            .clone()
            .unwrap_or_else(|| root_at(home).join("transport"))
    }
}

/// Largest whole-second span `chrono::Duration::seconds` accepts.
const MAX_DURATION_SECS: i64 = i64::MAX / 1000;

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs)
        .unwrap_or(MAX_DURATION_SECS)
        .min(MAX_DURATION_SECS)
}

/// Load `<home>/.empsync/config.yaml`, falling back to defaults when absent.
pub fn load_at(home: &Path) -> Result<SyncConfig, StoreError> {
    let path = config_path_at(home);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SyncConfig::default())
        }
        Err(err) => return Err(io_err(&path, err)),
    };
    if contents.trim().is_empty() {
        return Ok(SyncConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| StoreError::Config { path, source })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, StoreError> {
    load_at(&home()?)
}

/// Write `config` to `<home>/.empsync/config.yaml`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<(), StoreError> {
    let path = config_path_at(home);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&path, yaml).map_err(|e| io_err(&path, e))
}
