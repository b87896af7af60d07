//! Acquisition strategies.
//!
//! A strategy decides which due jobs an acquisition cycle tries to lock and how
//! long the acquisition sleeps before the next cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::JobEntity;
use crate::config::AcquisitionConfig;
use crate::context::UnitOfWork;
use crate::error::{ConductorError, Result};
use crate::persistence::{DueJobQuery, JobOrder};

pub const SEQUENTIAL_STRATEGY: &str = "sequential";
pub const BACKOFF_STRATEGY: &str = "backoff";

/// Policy for one acquisition.
#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Candidate jobs for the next cycle, at most `limit`.
    async fn select(&self, ctx: &UnitOfWork, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobEntity>>;

    /// How long to wait after a cycle that locked `found` jobs.
    fn next_wait(&self, found: usize, previous: Duration, config: &AcquisitionConfig) -> Duration;
}

/// Oldest due jobs first; waits the configured interval when idle and loops
/// immediately while there is work.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialStrategy;

#[async_trait]
impl AcquisitionStrategy for SequentialStrategy {
    fn name(&self) -> &str {
        SEQUENTIAL_STRATEGY
    }

    async fn select(&self, ctx: &UnitOfWork, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobEntity>> {
        ctx.store()
            .query_due_jobs(&DueJobQuery {
                now,
                limit,
                order: JobOrder::DueDate,
            })
            .await
    }

    fn next_wait(&self, found: usize, _previous: Duration, config: &AcquisitionConfig) -> Duration {
        if found == 0 {
            config.wait_time()
        } else {
            Duration::ZERO
        }
    }
}

/// Highest priority first; idle waits double up to the configured maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleBackoffStrategy;

#[async_trait]
impl AcquisitionStrategy for IdleBackoffStrategy {
    fn name(&self) -> &str {
        BACKOFF_STRATEGY
    }

    async fn select(&self, ctx: &UnitOfWork, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobEntity>> {
        ctx.store()
            .query_due_jobs(&DueJobQuery {
                now,
                limit,
                order: JobOrder::PriorityThenDueDate,
            })
            .await
    }

    fn next_wait(&self, found: usize, previous: Duration, config: &AcquisitionConfig) -> Duration {
        if found > 0 {
            return Duration::ZERO;
        }
        let max = config.max_wait_time().max(config.wait_time());
        if previous.is_zero() {
            config.wait_time().min(max)
        } else {
            previous.saturating_mul(2).min(max)
        }
    }
}

/// Strategies selectable by name from configuration.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn AcquisitionStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `sequential` and `backoff`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SequentialStrategy));
        registry.register(Arc::new(IdleBackoffStrategy));
        registry
    }

    /// Add a strategy, replacing any with the same name.
    pub fn register(&mut self, strategy: Arc<dyn AcquisitionStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AcquisitionStrategy>> {
        self.strategies.get(name).cloned().ok_or_else(|| {
            ConductorError::invalid_configuration(format!(
                "unknown acquisition strategy '{}', expected one of: {}",
                name,
                self.names().join(", ")
            ))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}
