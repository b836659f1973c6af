//! HR-side stages: `detect`, `build`, `send`, `confirm`, `reconcile`.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;

use empsync_sync::{
    build_at, confirm_pending_at, detect_changes_at, reconcile_at, send_at, status,
};

use super::{print_json, Workspace};

/// Arguments for `empsync detect`.
#[derive(Args, Debug)]
pub struct DetectArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl DetectArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let entries = detect_changes_at(&workspace.home).context("detect failed")?;
        if self.json {
            return print_json(&entries);
        }
        if entries.is_empty() {
            println!("No unclaimed changes.");
            return Ok(());
        }
        for entry in &entries {
            let fields: Vec<&str> = entry.changed_fields.keys().map(String::as_str).collect();
            println!(
                "{:>6}  {:<6}  {}  {}",
                entry.id,
                entry.operation.to_string(),
                entry.entity_id.to_string().bold(),
                fields.join(", ").bright_black()
            );
        }
        Ok(())
    }
}

/// Arguments for `empsync build`.
#[derive(Args, Debug)]
pub struct BuildArgs {}

impl BuildArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let entries = detect_changes_at(&workspace.home).context("detect failed")?;
        if entries.is_empty() {
            println!("No unclaimed changes; nothing to build.");
            return Ok(());
        }
        let payload = build_at(&workspace.home, &entries).context("build failed")?;
        println!(
            "{} payload {} built ({} entries)",
            "✓".green(),
            payload.payload_id,
            payload.entries.len()
        );
        Ok(())
    }
}

/// Arguments for `empsync send`.
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Payload id or unambiguous prefix.
    pub payload: String,
}

impl SendArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let payload_id = workspace.resolve_payload(&self.payload)?;
        let ack = send_at(&workspace.home, &workspace.transport, &payload_id)
            .with_context(|| format!("send failed for {payload_id}"))?;
        if ack.duplicate {
            println!("✓ payload {} already in transport", payload_id.short());
        } else {
            println!("{} payload {} sent", "✓".green(), payload_id.short());
        }
        Ok(())
    }
}

/// Arguments for `empsync confirm`.
#[derive(Args, Debug)]
pub struct ConfirmArgs {}

impl ConfirmArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let reports = confirm_pending_at(&workspace.home, &workspace.transport)
            .context("confirm failed")?;
        if reports.is_empty() {
            println!("No acknowledgements waiting.");
            return Ok(());
        }
        for report in reports {
            println!(
                "{} payload {} {}: {} confirmed, {} already confirmed (cursor {})",
                "✓".green(),
                report.payload_id.short(),
                report.status,
                report.confirmed.len(),
                report.already_confirmed.len(),
                report.cursor
            );
        }
        Ok(())
    }
}

/// Arguments for `empsync reconcile`.
#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Send again every claim that is stale or was never sent.
    #[arg(long)]
    pub resend: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ReconcileArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let report = reconcile_at(
            &workspace.home,
            &workspace.transport,
            &workspace.config,
            Utc::now(),
            self.resend,
        )
        .context("reconcile failed")?;
        if self.json {
            return print_json(&report);
        }

        if report.claims.is_empty() && report.rejected.is_empty() {
            println!("{} nothing unconfirmed, nothing rejected", "✓".green());
            return Ok(());
        }
        for claim in &report.claims {
            let flag = if claim.stale {
                "STALE".yellow().bold().to_string()
            } else if !claim.sent {
                "UNSENT".bright_black().to_string()
            } else {
                "IN FLIGHT".cyan().to_string()
            };
            println!(
                "claim   {}  {:<10} entries {:?}, held {}",
                claim.payload_id.short(),
                flag,
                claim.entry_ids,
                status::format_seconds(claim.age_secs)
            );
        }
        for rejected in &report.rejected {
            let flag = if rejected.overdue {
                "OVERDUE".magenta().bold().to_string()
            } else {
                "REJECTED".red().to_string()
            };
            println!(
                "payload {}  {:<10} {} entity(ies), {} attempt(s), {} ago",
                rejected.payload_id.short(),
                flag,
                rejected.rejected.len(),
                rejected.attempts,
                status::format_seconds(rejected.age_secs)
            );
            for (entity, reason) in &rejected.rejected {
                println!("        {entity}: {reason}");
            }
        }
        for ack in &report.resent {
            println!("{} re-sent {}", "↻".cyan(), ack.payload_id.short());
        }
        Ok(())
    }
}
