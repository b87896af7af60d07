//! Job scheduler: owns every named acquisition and the worker pool they share.
//!
//! Acquisitions are created from configuration on first use, start lazily when
//! the first engine registers and stop when the last engine unregisters.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use super::acquisition::{AcquisitionState, AcquisitionStats, JobAcquisition};
use super::strategy::StrategyRegistry;
use super::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::config::{AcquisitionConfig, SchedulerConfig};
use crate::engine::ProcessEngine;
use crate::error::{ConductorError, Result};

pub struct JobScheduler {
    config: SchedulerConfig,
    strategies: StrategyRegistry,
    pool: Arc<WorkerPool>,
    definitions: RwLock<HashMap<String, AcquisitionConfig>>,
    acquisitions: tokio::sync::Mutex<HashMap<String, Arc<JobAcquisition>>>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_strategies(config, StrategyRegistry::with_defaults())
    }

    /// Scheduler resolving acquisition strategies from `strategies`.
    pub fn with_strategies(config: SchedulerConfig, strategies: StrategyRegistry) -> Self {
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig::default()
                .with_max_workers(config.worker_pool_size)
                .with_name("jobs"),
        ));

        let definitions = config
            .acquisitions
            .iter()
            .map(|a| (a.name.clone(), a.clone()))
            .collect();

        Self {
            config,
            strategies,
            pool,
            definitions: RwLock::new(definitions),
            acquisitions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Add an acquisition definition at runtime.
    pub fn define_acquisition(&self, config: AcquisitionConfig) -> Result<()> {
        if !self.strategies.contains(&config.strategy) {
            return Err(ConductorError::invalid_configuration(format!(
                "acquisition '{}' uses unknown strategy '{}'",
                config.name, config.strategy
            )));
        }
        let mut definitions = self.definitions.write();
        if definitions.contains_key(&config.name) {
            return Err(ConductorError::invalid_input(format!(
                "acquisition '{}' is already defined",
                config.name
            )));
        }
        definitions.insert(config.name.clone(), config);
        Ok(())
    }

    /// Names of every defined acquisition, sorted.
    pub fn acquisition_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.definitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register `engine` with acquisition `name`, starting it if it is stopped.
    pub async fn register_engine(&self, name: &str, engine: Arc<ProcessEngine>) -> Result<()> {
        let mut acquisitions = self.acquisitions.lock().await;

        let acquisition = match acquisitions.get(name) {
            Some(acquisition) => acquisition.clone(),
            None => {
                let config = self
                    .definitions
                    .read()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConductorError::acquisition_not_found(name))?;
                let strategy = self.strategies.get(&config.strategy)?;
                let acquisition = Arc::new(JobAcquisition::new(
                    config,
                    strategy,
                    self.pool.clone(),
                    self.config.permit_timeout(),
                ));
                acquisitions.insert(name.to_string(), acquisition.clone());
                acquisition
            }
        };

        acquisition.register(engine)?;
        if acquisition.state() == AcquisitionState::Stopped {
            acquisition.start().await?;
        }
        Ok(())
    }

    /// Unregister an engine; the acquisition stops once no engine is left.
    ///
    /// Returns whether the engine was registered.
    pub async fn unregister_engine(&self, name: &str, engine_name: &str) -> Result<bool> {
        let acquisitions = self.acquisitions.lock().await;
        let acquisition = acquisitions
            .get(name)
            .ok_or_else(|| ConductorError::acquisition_not_found(name))?;

        let removed = acquisition.unregister(engine_name);
        if removed
            && acquisition.engine_count() == 0
            && acquisition.state() == AcquisitionState::Running
        {
            info!(acquisition = %name, "Last engine unregistered");
            acquisition.stop().await?;
        }
        Ok(removed)
    }

    pub async fn acquisition(&self, name: &str) -> Option<Arc<JobAcquisition>> {
        self.acquisitions.lock().await.get(name).cloned()
    }

    /// State of acquisition `name`; defined but never used acquisitions are stopped.
    pub async fn acquisition_state(&self, name: &str) -> Result<AcquisitionState> {
        match self.acquisition(name).await {
            Some(acquisition) => Ok(acquisition.state()),
            None if self.definitions.read().contains_key(name) => Ok(AcquisitionState::Stopped),
            None => Err(ConductorError::acquisition_not_found(name)),
        }
    }

    pub async fn acquisition_stats(&self, name: &str) -> Result<AcquisitionStats> {
        self.acquisition(name)
            .await
            .map(|a| a.stats())
            .ok_or_else(|| ConductorError::acquisition_not_found(name))
    }

    /// Stop every running acquisition, waiting for in-flight jobs.
    pub async fn shutdown(&self) {
        let acquisitions: Vec<_> = self.acquisitions.lock().await.values().cloned().collect();

        for acquisition in acquisitions {
            if acquisition.state() != AcquisitionState::Running {
                continue;
            }
            if let Err(e) = acquisition.stop().await {
                error!(acquisition = %acquisition.name(), error = %e, "Failed to stop acquisition");
            }
        }

        let pool = self.pool.stats();
        info!(
            pool_name = %pool.name,
            succeeded = pool.tasks_succeeded,
            failed = pool.tasks_failed,
            rejected = pool.acquire_timeouts,
            peak_workers = pool.peak_concurrent,
            "Job scheduler shut down"
        );
    }
}
