//! `empsync run`: one pass of the whole pipeline.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use empsync_core::OutcomeStatus;
use empsync_sync::{pipeline, PipelineOptions, PipelineReport};

use super::{print_json, Workspace};

/// Arguments for `empsync run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Apply valid entities even when others fail.
    #[arg(long)]
    pub partial: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let mut options = PipelineOptions::from_config(&workspace.config);
        options.allow_partial |= self.partial;

        let report = pipeline::run(&workspace.home, &workspace.transport, &options)
            .context("pipeline run failed")?;
        if self.json {
            return print_json(&report);
        }
        print_report(&report);
        Ok(())
    }
}

fn print_report(report: &PipelineReport) {
    if report.nothing_to_sync() {
        println!("{} nothing to sync", "✓".green());
        return;
    }

    if let Some(payload_id) = &report.built {
        println!(
            "built    {} ({} entries, {} claim attempt(s))",
            payload_id.short(),
            report.entry_ids.len(),
            report.claim_attempts
        );
    }
    for ack in &report.received {
        let note = if ack.duplicate { " (duplicate)" } else { "" };
        println!("received {}{note}", ack.payload_id.short());
    }
    for refused in &report.refused {
        println!("{} refused: {refused}", "✗".red());
    }
    for result in &report.applied {
        let status = match result.status {
            OutcomeStatus::Applied => result.status.to_string().green(),
            _ => result.status.to_string().red(),
        };
        println!(
            "applied  {} {status}: {} applied, {} rejected",
            result.payload_id.short(),
            result.applied.len(),
            result.rejected.len()
        );
        for (entity, reason) in &result.rejected {
            println!("           {entity}: {reason}");
        }
    }
    for confirm in &report.confirmed {
        println!(
            "confirmed {} ({} entries, cursor {})",
            confirm.payload_id.short(),
            confirm.confirmed.len(),
            confirm.cursor
        );
    }
}
