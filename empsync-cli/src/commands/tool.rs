//! `empsync tool`: the JSON tool-call surface.
//!
//! With a tool name, one call is made and its response printed. Without one,
//! newline-delimited requests are read from stdin and one response line is
//! written per request.

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::Value;

use empsync_sync::{tools::TOOL_NAMES, SyncTools, ToolRequest};

use super::{print_json, Workspace};

/// Arguments for `empsync tool`.
#[derive(Args, Debug)]
pub struct ToolArgs {
    /// Tool to call; omit to serve requests from stdin.
    pub name: Option<String>,

    /// Tool arguments as a JSON object.
    #[arg(long, value_name = "JSON", requires = "name")]
    pub args: Option<String>,

    /// List the tool names and exit.
    #[arg(long, conflicts_with_all = ["name", "args"])]
    pub list: bool,
}

impl ToolArgs {
    pub fn run(self) -> Result<()> {
        if self.list {
            for name in TOOL_NAMES {
                println!("{name}");
            }
            return Ok(());
        }

        let workspace = Workspace::open()?;
        let tools = SyncTools::new(workspace.home, workspace.transport, workspace.config);

        let Some(name) = self.name else {
            return serve(&tools);
        };
        let args = match self.args.as_deref() {
            Some(raw) => serde_json::from_str(raw).context("--args is not valid JSON")?,
            None => Value::Null,
        };
        let response = tools.call(&ToolRequest { tool: name, args });
        print_json(&response)?;
        if !response.ok {
            bail!(
                "tool call failed{}",
                if response.retryable { " (retryable)" } else { "" }
            );
        }
        Ok(())
    }
}

fn serve<T: empsync_sync::Transport>(tools: &SyncTools<T>) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }
        writeln!(stdout, "{}", tools.call_line(&line)).context("failed to write response")?;
        stdout.flush().context("failed to write response")?;
    }
    Ok(())
}
