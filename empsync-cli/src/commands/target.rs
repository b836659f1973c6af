//! Payroll-side stages: `receive`, `validate`, `apply`, `reapply`.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use empsync_core::{store, OutcomeStatus, PayloadId};
use empsync_sync::{
    apply_at, preview_at, reapply_at, receive_pending_at, validate_sync_data_at, ApplyOptions,
    ApplyResult, Transport,
};

use super::{print_json, Workspace};

/// Arguments for `empsync receive`.
#[derive(Args, Debug)]
pub struct ReceiveArgs {}

impl ReceiveArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let intake =
            receive_pending_at(&workspace.home, &workspace.transport).context("receive failed")?;

        if intake.received.is_empty() && intake.refused.is_empty() {
            println!("No payloads waiting.");
        }
        for ack in &intake.received {
            let note = if ack.duplicate { " (duplicate)" } else { "" };
            println!("{} received {}{note}", "✓".green(), ack.payload_id.short());
        }
        for err in &intake.refused {
            println!("{} refused: {err}", "✗".red());
        }
        Ok(())
    }
}

/// Arguments for `empsync validate`.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Payload id or unambiguous prefix.
    pub payload: String,
}

impl ValidateArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let payload_id = workspace.resolve_payload(&self.payload)?;
        let result = validate_sync_data_at(&workspace.home, &payload_id)
            .with_context(|| format!("validate failed for {payload_id}"))?;

        if result.ok {
            println!("{} payload {} is valid", "✓".green(), payload_id.short());
            return Ok(());
        }
        for problem in &result.problems {
            println!(
                "{} entry {} ({}): {}",
                "✗".red(),
                problem.entry_id,
                problem.entity_id,
                problem.reason
            );
        }
        bail!(
            "payload {} failed validation ({} problem(s))",
            payload_id.short(),
            result.problems.len()
        )
    }
}

/// Arguments for `empsync apply`.
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Payload id or unambiguous prefix.
    pub payload: String,

    /// Apply valid entities even when others fail.
    #[arg(long)]
    pub partial: bool,

    /// Show record diffs without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ApplyArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let payload_id = workspace.resolve_payload(&self.payload)?;
        let allow_partial = self.partial || workspace.config.allow_partial_apply;

        if self.dry_run {
            let preview = preview_at(&workspace.home, &payload_id, allow_partial)
                .with_context(|| format!("preview failed for {payload_id}"))?;
            if self.json {
                return print_json(&preview);
            }
            if preview.diffs.is_empty() {
                println!("No record changes for {}.", payload_id.short());
            }
            for diff in &preview.diffs {
                print!("{}", diff.unified_diff);
                if !diff.unified_diff.ends_with('\n') {
                    println!();
                }
            }
            print_result("[dry-run] ", &preview.result);
            return Ok(());
        }

        let options = ApplyOptions {
            allow_partial,
            dry_run: false,
        };
        let result = apply_at(&workspace.home, &payload_id, options)
            .with_context(|| format!("apply failed for {payload_id}"))?;
        acknowledge(&workspace, &payload_id)?;
        if self.json {
            print_json(&result)?;
        } else {
            print_result("", &result);
        }
        finish(&result)
    }
}

/// Arguments for `empsync reapply`.
#[derive(Args, Debug)]
pub struct ReapplyArgs {
    /// Payload id or unambiguous prefix.
    pub payload: String,
}

impl ReapplyArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let payload_id = workspace.resolve_payload(&self.payload)?;
        let result = reapply_at(&workspace.home, &payload_id)
            .with_context(|| format!("reapply failed for {payload_id}"))?;
        acknowledge(&workspace, &payload_id)?;
        print_result("", &result);
        finish(&result)
    }
}

/// Hand the target's terminal row back to HR.
fn acknowledge(workspace: &Workspace, payload_id: &PayloadId) -> Result<()> {
    let target = store::load_target_at(&workspace.home).context("failed to load Payroll state")?;
    if let Some(row) = target.outcomes.get(payload_id) {
        workspace
            .transport
            .acknowledge(row)
            .with_context(|| format!("failed to acknowledge {payload_id}"))?;
    }
    Ok(())
}

fn print_result(prefix: &str, result: &ApplyResult) {
    let marker = match result.status {
        OutcomeStatus::Applied => "✓".green(),
        _ => "✗".red(),
    };
    let recorded = if result.recorded { " (recorded)" } else { "" };
    println!(
        "{prefix}{marker} payload {} {}{recorded}: {} applied, {} rejected",
        result.payload_id.short(),
        result.status,
        result.applied.len(),
        result.rejected.len()
    );
    for (entity, reason) in &result.rejected {
        println!("{prefix}    {entity}: {reason}");
    }
}

fn finish(result: &ApplyResult) -> Result<()> {
    if result.status == OutcomeStatus::Rejected {
        bail!(
            "payload {} was rejected; fix Payroll state and run `empsync reapply`",
            result.payload_id.short()
        );
    }
    Ok(())
}
