//! Quarry - read-only access to configured database targets.
//!
//! Results are printed to stdout as JSON. Failures print an error payload
//! and exit with status 1. Logs go to stderr.

use clap::{Parser, Subcommand};
use quarry_core::logging::{init_logging, LogConfig};
use quarry_core::{Quarry, QuarryError, QuarryResult, QueryRequest};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Read-only queries against MySQL and PostgreSQL targets, tunneled over SSH")]
#[command(version)]
struct Cli {
    /// Also append logs to quarry.log in this directory
    #[arg(long, global = true, env = "QUARRY_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log filter directive, e.g. "quarry_core=debug"
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured database targets
    Databases,

    /// List the tables of a target
    Tables {
        /// Target name
        target: String,
    },

    /// Describe the columns of a table
    Describe {
        /// Target name
        target: String,

        /// Table name
        table: String,
    },

    /// Run a read-only SQL query
    Query {
        /// Target name
        target: String,

        /// SQL text
        sql: String,

        /// Append LIMIT n unless the query already has one
        #[arg(short, long)]
        limit: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::stderr();
    if let Some(dir) = cli.log_dir.clone() {
        log_config = log_config.with_log_dir(dir);
    }
    if let Some(filter) = cli.log_filter.clone() {
        log_config = log_config.with_filter(filter);
    }
    let _logging_guard = init_logging(log_config);

    let quarry = Quarry::from_env();
    let outcome = run(&quarry, cli.command).await;
    quarry.close_all_pools().await;

    let (payload, code) = match outcome {
        Ok(value) => (value, ExitCode::SUCCESS),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            match serde_json::to_value(e.to_error_info()) {
                Ok(info) => (info, ExitCode::FAILURE),
                Err(e) => {
                    eprintln!("Failed to encode error: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    if let Err(e) = print_json(&payload) {
        eprintln!("Failed to write output: {e}");
        return ExitCode::FAILURE;
    }
    code
}

async fn run(quarry: &Quarry, command: Commands) -> QuarryResult<serde_json::Value> {
    match command {
        Commands::Databases => to_json(&quarry.list_databases()),
        Commands::Tables { target } => to_json(&quarry.list_tables(&target).await?),
        Commands::Describe { target, table } => {
            to_json(&quarry.describe_table(&target, &table).await?)
        }
        Commands::Query { target, sql, limit } => {
            let mut request = QueryRequest::new(target, sql);
            request.limit = limit;
            to_json(&quarry.execute(&request).await?)
        }
    }
}

fn to_json(value: &impl Serialize) -> QuarryResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| QuarryError::internal(format!("Failed to encode result: {e}")))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    println!("{text}");
    Ok(())
}
