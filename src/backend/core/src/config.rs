//! Configuration management.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ConductorError, Result};
use crate::jobs::{RetryPolicy, StrategyRegistry};
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Process engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Job scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging and metrics configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine name, unique among engines sharing an acquisition
    #[serde(default = "default_engine_name")]
    pub name: String,

    /// Retries and backoff applied to newly created jobs
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Failure details longer than this are truncated before they are stored
    #[serde(default = "default_max_failure_message_length")]
    pub max_failure_message_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            retry: RetryPolicy::default(),
            max_failure_message_length: default_max_failure_message_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of jobs executed concurrently across all acquisitions
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// How long an acquisition waits for a free worker before rejecting a job
    #[serde(default = "default_permit_timeout_millis")]
    pub permit_timeout_millis: u64,

    /// Named acquisition cycles
    #[serde(default = "default_acquisitions")]
    pub acquisitions: Vec<AcquisitionConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            permit_timeout_millis: default_permit_timeout_millis(),
            acquisitions: default_acquisitions(),
        }
    }
}

impl SchedulerConfig {
    pub fn permit_timeout(&self) -> Duration {
        Duration::from_millis(self.permit_timeout_millis)
    }

    /// Look up an acquisition by name.
    pub fn acquisition(&self, name: &str) -> Option<&AcquisitionConfig> {
        self.acquisitions.iter().find(|a| a.name == name)
    }
}

/// Settings for one named acquisition cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Acquisition name
    #[serde(default = "default_acquisition_name")]
    pub name: String,

    /// Name of a built-in acquisition strategy
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// How long an acquired job stays locked
    #[serde(default = "default_lock_time_in_millis")]
    pub lock_time_in_millis: u64,

    /// Idle wait between cycles that found no jobs
    #[serde(default = "default_wait_time_in_millis")]
    pub wait_time_in_millis: u64,

    /// Upper bound for strategies that grow the idle wait
    #[serde(default = "default_max_wait_time_in_millis")]
    pub max_wait_time_in_millis: u64,

    /// Batch size per cycle
    #[serde(default = "default_max_jobs_per_acquisition")]
    pub max_jobs_per_acquisition: usize,

    /// Lock owner written to acquired jobs
    #[serde(default = "default_lock_owner")]
    pub lock_owner: String,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            name: default_acquisition_name(),
            strategy: default_strategy(),
            lock_time_in_millis: default_lock_time_in_millis(),
            wait_time_in_millis: default_wait_time_in_millis(),
            max_wait_time_in_millis: default_max_wait_time_in_millis(),
            max_jobs_per_acquisition: default_max_jobs_per_acquisition(),
            lock_owner: default_lock_owner(),
        }
    }
}

impl AcquisitionConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_lock_time(mut self, millis: u64) -> Self {
        self.lock_time_in_millis = millis;
        self
    }

    pub fn with_wait_time(mut self, millis: u64) -> Self {
        self.wait_time_in_millis = millis;
        self
    }

    pub fn with_max_wait_time(mut self, millis: u64) -> Self {
        self.max_wait_time_in_millis = millis;
        self
    }

    pub fn with_max_jobs(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn lock_time(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_time_in_millis as i64)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_in_millis)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_in_millis)
    }
}

// Default value functions
fn default_engine_name() -> String { "default".to_string() }
fn default_max_failure_message_length() -> usize { 666 }
fn default_worker_pool_size() -> usize { 10 }
fn default_permit_timeout_millis() -> u64 { 1000 }
fn default_acquisitions() -> Vec<AcquisitionConfig> { vec![AcquisitionConfig::default()] }
fn default_acquisition_name() -> String { "default".to_string() }
fn default_strategy() -> String { "sequential".to_string() }
fn default_lock_time_in_millis() -> u64 { 300_000 }
fn default_wait_time_in_millis() -> u64 { 5_000 }
fn default_max_wait_time_in_millis() -> u64 { 60_000 }
fn default_max_jobs_per_acquisition() -> usize { 3 }
fn default_lock_owner() -> String { uuid::Uuid::new_v4().to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CONDUCTOR").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from a file, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CONDUCTOR").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check values the type system cannot.
    pub fn validate(&self) -> Result<()> {
        if self.engine.name.trim().is_empty() {
            return Err(ConductorError::invalid_configuration("engine.name must not be empty"));
        }
        if self.scheduler.worker_pool_size == 0 {
            return Err(ConductorError::invalid_configuration(
                "scheduler.worker_pool_size must be greater than zero",
            ));
        }

        let strategies = StrategyRegistry::with_defaults();
        let mut names = HashSet::new();
        for acquisition in &self.scheduler.acquisitions {
            if !names.insert(acquisition.name.as_str()) {
                return Err(ConductorError::invalid_configuration(format!(
                    "duplicate acquisition name '{}'",
                    acquisition.name
                )));
            }
            if acquisition.lock_time_in_millis == 0 {
                return Err(ConductorError::invalid_configuration(format!(
                    "acquisition '{}': lock_time_in_millis must be greater than zero",
                    acquisition.name
                )));
            }
            if acquisition.max_jobs_per_acquisition == 0 {
                return Err(ConductorError::invalid_configuration(format!(
                    "acquisition '{}': max_jobs_per_acquisition must be greater than zero",
                    acquisition.name
                )));
            }
            if !strategies.contains(&acquisition.strategy) {
                return Err(ConductorError::invalid_configuration(format!(
                    "acquisition '{}': unknown strategy '{}'",
                    acquisition.name, acquisition.strategy
                )));
            }
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConductorError::configuration(format!("Failed to render configuration: {}", e)))
    }
}
