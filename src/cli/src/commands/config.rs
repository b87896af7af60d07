//! Configuration commands.
//!
//! Reads the engine configuration from `--config`, `CONDUCTOR_CONFIG`, or
//! `~/.conductor/conductor.toml`, falling back to `CONDUCTOR__*` environment
//! variables and defaults.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tabled::Tabled;

use conductor_core::config::{AcquisitionConfig, Config};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Check a configuration file for errors
    Validate,

    /// Show the effective configuration
    Show {
        /// Print the configuration as TOML
        #[arg(long)]
        toml: bool,
    },
}

/// Where the configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Environment => f.write_str("environment"),
        }
    }
}

#[derive(Tabled, Serialize)]
struct AcquisitionRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Strategy")]
    strategy: String,
    #[tabled(rename = "Lock (ms)")]
    lock_time_in_millis: u64,
    #[tabled(rename = "Wait (ms)")]
    wait_time_in_millis: u64,
    #[tabled(rename = "Max Wait (ms)")]
    max_wait_time_in_millis: u64,
    #[tabled(rename = "Batch")]
    max_jobs_per_acquisition: usize,
    #[tabled(rename = "Lock Owner")]
    lock_owner: String,
}

impl From<&AcquisitionConfig> for AcquisitionRow {
    fn from(a: &AcquisitionConfig) -> Self {
        Self {
            name: a.name.clone(),
            strategy: a.strategy.clone(),
            lock_time_in_millis: a.lock_time_in_millis,
            wait_time_in_millis: a.wait_time_in_millis,
            max_wait_time_in_millis: a.max_wait_time_in_millis,
            max_jobs_per_acquisition: a.max_jobs_per_acquisition,
            lock_owner: a.lock_owner.clone(),
        }
    }
}

/// Default configuration file (`~/.conductor/conductor.toml`), if present.
fn default_config_path() -> Option<PathBuf> {
    let path = dirs::home_dir()?.join(".conductor").join("conductor.toml");
    path.exists().then_some(path)
}

/// Resolve the configuration file: an explicit path wins over the default file.
pub fn resolve_source(explicit: Option<PathBuf>) -> ConfigSource {
    explicit
        .or_else(default_config_path)
        .map(ConfigSource::File)
        .unwrap_or(ConfigSource::Environment)
}

/// Load and validate the configuration from `source`.
pub fn load(source: &ConfigSource) -> Result<Config> {
    match source {
        ConfigSource::File(path) => load_file(path),
        ConfigSource::Environment => {
            Config::load().context("Failed to load configuration from the environment")
        }
    }
}

fn load_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        anyhow::bail!("Configuration file {} does not exist", path.display());
    }
    let path_str = path
        .to_str()
        .with_context(|| format!("Configuration path {} is not valid UTF-8", path.display()))?;
    Config::from_file(path_str).with_context(|| format!("Invalid configuration in {}", path.display()))
}

pub async fn execute(cmd: ConfigCommands, source: ConfigSource, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Validate => {
            let config = load(&source)?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!(
                        "Configuration from {} is valid ({} acquisition{})",
                        source,
                        config.scheduler.acquisitions.len(),
                        if config.scheduler.acquisitions.len() == 1 { "" } else { "s" }
                    ));
                }
                _ => output::print_item(
                    &serde_json::json!({
                        "source": source.to_string(),
                        "valid": true,
                        "acquisitions": config.scheduler.acquisitions.len(),
                    }),
                    format,
                )?,
            }
        }

        ConfigCommands::Show { toml } => {
            let config = load(&source)?;

            if toml {
                print!("{}", config.to_toml()?);
                return Ok(());
            }

            match format {
                OutputFormat::Table => {
                    output::print_header("Engine");
                    output::print_detail("Source", &source.to_string());
                    output::print_detail("Name", &config.engine.name);
                    output::print_detail("Retries", &config.engine.retry.retries.to_string());
                    output::print_detail("Backoff", &format!("{:?}", config.engine.retry.backoff));
                    output::print_detail(
                        "Max failure message",
                        &config.engine.max_failure_message_length.to_string(),
                    );

                    output::print_header("Scheduler");
                    output::print_detail("Worker pool", &config.scheduler.worker_pool_size.to_string());
                    output::print_detail(
                        "Permit timeout (ms)",
                        &config.scheduler.permit_timeout_millis.to_string(),
                    );

                    output::print_header("Acquisitions");
                    let rows: Vec<AcquisitionRow> =
                        config.scheduler.acquisitions.iter().map(AcquisitionRow::from).collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&config, format)?,
            }
        }
    }

    Ok(())
}
