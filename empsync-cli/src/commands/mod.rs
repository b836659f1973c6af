pub mod observe;
pub mod run;
pub mod source;
pub mod status;
pub mod target;
pub mod tool;

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use empsync_core::{config, store, PayloadId, SyncConfig};
use empsync_sync::DirTransport;

/// Home directory, loaded config and the transport every command shares.
pub struct Workspace {
    pub home: PathBuf,
    pub config: SyncConfig,
    pub transport: DirTransport,
}

impl Workspace {
    pub fn open() -> Result<Self> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let config = config::load_at(&home).context("failed to load ~/.empsync/config.yaml")?;
        let transport = DirTransport::at(&home, &config);
        tracing::debug!("transport at {}", transport.root().display());
        Ok(Self {
            home,
            config,
            transport,
        })
    }

    /// Expand a payload id prefix against payloads known to either side.
    pub fn resolve_payload(&self, prefix: &str) -> Result<PayloadId> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() {
            bail!("empty payload id");
        }
        let source = store::load_source_at(&self.home).context("failed to load HR ledger")?;
        let target = store::load_target_at(&self.home).context("failed to load Payroll state")?;

        let matches: BTreeSet<&PayloadId> = source
            .payloads
            .keys()
            .chain(target.received.keys())
            .filter(|id| id.0.starts_with(&prefix))
            .collect();
        let mut candidates = matches.into_iter();
        match (candidates.next(), candidates.next()) {
            (Some(id), None) => Ok(id.clone()),
            (None, _) => bail!("no payload matches '{prefix}'"),
            (Some(_), Some(_)) => bail!("'{prefix}' is ambiguous"),
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON")?
    );
    Ok(())
}
