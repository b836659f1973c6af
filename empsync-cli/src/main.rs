//! empsync: HR → Payroll employee-record sync.
//!
//! # Usage
//!
//! ```text
//! empsync observe create|update|delete <entity> [-f key=value]...
//! empsync detect [--json]
//! empsync build
//! empsync send <payload>
//! empsync receive
//! empsync validate <payload>
//! empsync apply <payload> [--partial] [--dry-run] [--json]
//! empsync reapply <payload>
//! empsync confirm
//! empsync reconcile [--resend] [--json]
//! empsync run [--partial] [--json]
//! empsync status [--json]
//! empsync tool [<name> [--args <json>]]
//! ```
//!
//! `<payload>` accepts a full payload id or any unambiguous prefix of one.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    observe::ObserveArgs,
    run::RunArgs,
    source::{BuildArgs, ConfirmArgs, DetectArgs, ReconcileArgs, SendArgs},
    status::StatusArgs,
    target::{ApplyArgs, ReapplyArgs, ReceiveArgs, ValidateArgs},
    tool::ToolArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "empsync",
    version,
    about = "Propagate employee-record changes from HR to Payroll exactly once",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record one committed mutation of an HR employee record.
    Observe(ObserveArgs),

    /// List change entries not yet claimed by any payload.
    Detect(DetectArgs),

    /// Claim every unclaimed change entry into a new payload.
    Build(BuildArgs),

    /// Hand a built payload to the transport.
    Send(SendArgs),

    /// Accept every payload waiting in the transport on the Payroll side.
    Receive(ReceiveArgs),

    /// Check a received payload against current Payroll state.
    Validate(ValidateArgs),

    /// Apply a received payload to Payroll.
    Apply(ApplyArgs),

    /// Re-apply a REJECTED payload against current Payroll state.
    Reapply(ReapplyArgs),

    /// Confirm HR entries from Payroll acknowledgements.
    Confirm(ConfirmArgs),

    /// Report unconfirmed claims and unresolved rejections.
    Reconcile(ReconcileArgs),

    /// Run the whole pipeline once.
    Run(RunArgs),

    /// Show pipeline state across both sides.
    Status(StatusArgs),

    /// Call the JSON tool surface, or serve it over stdin/stdout.
    Tool(ToolArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Observe(args) => args.run(),
        Commands::Detect(args) => args.run(),
        Commands::Build(args) => args.run(),
        Commands::Send(args) => args.run(),
        Commands::Receive(args) => args.run(),
        Commands::Validate(args) => args.run(),
        Commands::Apply(args) => args.run(),
        Commands::Reapply(args) => args.run(),
        Commands::Confirm(args) => args.run(),
        Commands::Reconcile(args) => args.run(),
        Commands::Run(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Tool(args) => args.run(),
    }
}
