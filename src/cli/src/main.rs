//! Conductor CLI - validate engine configuration and run seeded job workloads.
//!
//! Provides `config` commands for configuration files and `run` for executing
//! a seed file against an embedded engine.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{config, run};
use conductor_core::telemetry::{init_logging, LogFormat, LoggingConfig};
use output::OutputFormat;

/// Conductor - transactional job scheduling engine CLI
#[derive(Parser)]
#[command(
    name = "conductor",
    author = "Aezi <aezi.zhu@icloud.com>",
    version = "0.1.0",
    about = "Conductor - transactional job scheduling engine",
    long_about = "CLI tool for validating Conductor configuration and running seeded job workloads against an embedded engine.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file
    #[arg(short, long, global = true, env = "CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Log engine activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Run a seed file of jobs against an embedded engine
    Run(run::RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if cli.verbose {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Compact,
            include_location: false,
            ..Default::default()
        };
        if let Err(e) = init_logging(&logging, "cli") {
            output::print_error(&format!("Failed to initialize logging: {:#}", e));
        }
    }

    let format = cli.output;
    let source = config::resolve_source(cli.config);

    let result = match cli.command {
        Commands::Config(cmd) => config::execute(cmd, source, format).await,
        Commands::Run(args) => match config::load(&source) {
            Ok(cfg) => run::execute(args, cfg, format).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
