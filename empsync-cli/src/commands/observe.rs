//! `empsync observe`: feed a committed HR mutation into the change ledger.

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use serde_json::Value;

use empsync_core::{FieldMap, Operation};
use empsync_sync::observe_mutation_at;

use super::Workspace;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OperationArg {
    Create,
    Update,
    Delete,
}

impl From<OperationArg> for Operation {
    fn from(op: OperationArg) -> Self {
        match op {
            OperationArg::Create => Operation::Create,
            OperationArg::Update => Operation::Update,
            OperationArg::Delete => Operation::Delete,
        }
    }
}

/// Arguments for `empsync observe`.
#[derive(Args, Debug)]
pub struct ObserveArgs {
    pub operation: OperationArg,

    /// Employee id.
    pub entity: String,

    /// Changed field as `key=value`; the value is read as JSON when it parses.
    #[arg(short = 'f', long = "field", value_name = "KEY=VALUE")]
    pub fields: Vec<String>,
}

impl ObserveArgs {
    pub fn run(self) -> Result<()> {
        let fields = parse_fields(&self.fields)?;
        let workspace = Workspace::open()?;
        let entry = observe_mutation_at(
            &workspace.home,
            self.entity.as_str().into(),
            self.operation.into(),
            fields,
        )
        .with_context(|| format!("failed to record change for '{}'", self.entity))?;

        println!(
            "{} change {} recorded: {} {}",
            "✓".green(),
            entry.id,
            entry.operation,
            entry.entity_id
        );
        Ok(())
    }
}

fn parse_fields(raw: &[String]) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("field '{pair}' is not KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("field '{pair}' has an empty key");
        }
        fields.insert(key.to_string(), parse_value(value));
    }
    Ok(fields)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
