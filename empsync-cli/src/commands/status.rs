//! `empsync status`: pipeline visibility across HR and Payroll.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use empsync_sync::{
    status::{format_datetime_age, PayloadStatus},
    status_at, PayloadState, StatusReport,
};

use super::{print_json, Workspace};

/// Arguments for `empsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let workspace = Workspace::open()?;
        let report = status_at(&workspace.home, &workspace.config, Utc::now())
            .context("failed to load sync state")?;
        if self.json {
            return print_json(&report);
        }
        print_table(&report);
        Ok(())
    }
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "payload")]
    payload: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "entries")]
    entries: usize,
    #[tabled(rename = "age")]
    age: String,
    #[tabled(rename = "detail")]
    detail: String,
}

fn print_table(report: &StatusReport) {
    println!(
        "empsync v{} | {} changes | cursor {} | {} unclaimed | {} claimed | {} confirmed",
        env!("CARGO_PKG_VERSION"),
        report.last_id,
        report.cursor,
        report.unclaimed,
        report.claimed,
        report.confirmed,
    );
    println!(
        "payroll: {} live | {} deleted | {} refused",
        report.target_live, report.target_tombstoned, report.refused
    );

    if report.payloads.is_empty() {
        println!("No payloads built.");
        return;
    }

    let separator = "■".repeat(67).bright_black().to_string();
    println!("{separator}");
    let counts: Vec<String> = ALL_STATES
        .iter()
        .filter_map(|state| {
            let n = report.payloads.iter().filter(|p| p.state == *state).count();
            (n > 0).then(|| format!("{} {n} {}", state_indicator(*state), state_label(*state)))
        })
        .collect();
    println!("{}", counts.join("  "));
    println!("{separator}");

    let now = Utc::now();
    let rows: Vec<StatusTableRow> = report
        .payloads
        .iter()
        .map(|p| StatusTableRow {
            payload: p.payload_id.short().to_string(),
            state: state_label(p.state).to_string(),
            entries: p.entries,
            age: format_datetime_age(p.created_at, now),
            detail: payload_detail(p),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!("{separator}");

    if report.needs_attention() {
        println!("Run 'empsync reconcile' to inspect stale claims and overdue rejections.");
        if report.refused > 0 {
            println!("Refused payloads are kept as *.json.bad in the transport outbox.");
        }
    }
}

const ALL_STATES: [PayloadState; 6] = [
    PayloadState::Applied,
    PayloadState::InFlight,
    PayloadState::Unsent,
    PayloadState::StaleClaim,
    PayloadState::Rejected { overdue: false },
    PayloadState::Rejected { overdue: true },
];

fn state_label(state: PayloadState) -> &'static str {
    match state {
        PayloadState::Unsent => "UNSENT",
        PayloadState::InFlight => "IN FLIGHT",
        PayloadState::StaleClaim => "STALE CLAIM",
        PayloadState::Applied => "APPLIED",
        PayloadState::Rejected { overdue: false } => "REJECTED",
        PayloadState::Rejected { overdue: true } => "OVERDUE",
    }
}

fn state_indicator(state: PayloadState) -> String {
    match state {
        PayloadState::Unsent => "■".bright_black().bold().to_string(),
        PayloadState::InFlight => "■".cyan().bold().to_string(),
        PayloadState::StaleClaim => "■".yellow().bold().to_string(),
        PayloadState::Applied => "■".green().bold().to_string(),
        PayloadState::Rejected { overdue: false } => "■".red().bold().to_string(),
        PayloadState::Rejected { overdue: true } => "■".magenta().bold().to_string(),
    }
}

fn payload_detail(payload: &PayloadStatus) -> String {
    match (&payload.state, &payload.error_detail) {
        (PayloadState::Rejected { .. }, Some(detail)) => truncate(detail, 48),
        (PayloadState::StaleClaim, _) => "claim unconfirmed".to_string(),
        (PayloadState::Unsent, _) => "built, not sent".to_string(),
        (PayloadState::InFlight, _) => "awaiting Payroll".to_string(),
        _ => String::new(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{head}…")
}
