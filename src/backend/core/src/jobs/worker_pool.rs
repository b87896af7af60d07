//! Worker pool for acquired jobs, bounded by a tokio Semaphore.
//!
//! The `WorkerPool` provides:
//! - A fixed number of execution permits shared by every acquisition
//! - Permit waits bounded by a timeout, so a saturated pool rejects instead of queueing forever
//! - Per-pool statistics and an active-worker gauge

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{ConductorError, ErrorCode, Result};
use crate::telemetry::JobMetrics;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of jobs executing at once
    pub max_workers: usize,
    /// Name for this pool (for logging/metrics)
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            name: "jobs".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// A held execution slot. Dropping it frees the slot.
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
    started_at: Instant,
    completed: bool,
}

impl WorkerPermit {
    /// Release the slot, counting the job as succeeded.
    pub fn mark_success(mut self) {
        self.completed = true;
        self.stats.record_success(self.started_at.elapsed());
    }

    /// Release the slot, counting the job as failed.
    pub fn mark_failure(mut self) {
        self.completed = true;
        self.stats.record_failure(self.started_at.elapsed());
    }
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        if !self.completed {
            self.stats.record_unknown();
        }
    }
}

struct PoolStats {
    name: String,
    tasks_submitted: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    /// Permits dropped without an outcome
    tasks_unknown: AtomicU64,
    total_wait_time_us: AtomicU64,
    total_exec_time_us: AtomicU64,
    peak_concurrent: AtomicUsize,
    current_concurrent: AtomicUsize,
    acquire_timeouts: AtomicU64,
}

impl PoolStats {
    fn new(name: String) -> Self {
        Self {
            name,
            tasks_submitted: AtomicU64::new(0),
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_unknown: AtomicU64::new(0),
            total_wait_time_us: AtomicU64::new(0),
            total_exec_time_us: AtomicU64::new(0),
            peak_concurrent: AtomicUsize::new(0),
            current_concurrent: AtomicUsize::new(0),
            acquire_timeouts: AtomicU64::new(0),
        }
    }

    fn record_submit(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquire(&self, wait_time: Duration) {
        self.total_wait_time_us
            .fetch_add(wait_time.as_micros() as u64, Ordering::Relaxed);
        let current = self.current_concurrent.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_concurrent.fetch_max(current, Ordering::Relaxed);
        JobMetrics::set_active_workers(&self.name, current);
    }

    fn record_release(&self) {
        let current = self.current_concurrent.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        JobMetrics::set_active_workers(&self.name, current);
    }

    fn record_success(&self, duration: Duration) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration);
        self.record_release();
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration);
        self.record_release();
    }

    fn record_unknown(&self) {
        self.tasks_unknown.fetch_add(1, Ordering::Relaxed);
        self.record_release();
    }

    fn record_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, duration: Duration) {
        self.total_exec_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Bounded set of execution slots shared by job acquisitions.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    created_at: Instant,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_workers));

        tracing::info!(
            pool_name = %config.name,
            max_workers = config.max_workers,
            "Worker pool created"
        );

        Self {
            stats: Arc::new(PoolStats::new(config.name.clone())),
            config,
            semaphore,
            created_at: Instant::now(),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active_workers(&self) -> usize {
        self.config.max_workers - self.semaphore.available_permits()
    }

    /// Wait for an execution slot, up to `timeout`.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<WorkerPermit> {
        self.stats.record_submit();
        let start = Instant::now();

        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| {
                self.stats.record_timeout();
                tracing::warn!(
                    pool_name = %self.config.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "No worker available, job rejected"
                );
                ConductorError::new(
                    ErrorCode::JobRejected,
                    format!(
                        "Worker pool '{}' has no free worker after {}ms",
                        self.config.name,
                        timeout.as_millis()
                    ),
                )
            })??;

        let wait_time = start.elapsed();
        self.stats.record_acquire(wait_time);

        tracing::debug!(
            pool_name = %self.config.name,
            wait_time_ms = wait_time.as_millis() as u64,
            available = self.semaphore.available_permits(),
            "Worker permit acquired"
        );

        Ok(self.permit(permit))
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> WorkerPermit {
        WorkerPermit {
            _permit: permit,
            stats: self.stats.clone(),
            started_at: Instant::now(),
            completed: false,
        }
    }

    /// Run `fut` on a new task that owns `permit`.
    ///
    /// The future reports whether the job succeeded; the slot is released when it ends.
    pub fn spawn_with_permit<Fut>(&self, permit: WorkerPermit, fut: Fut) -> JoinHandle<()>
    where
        Fut: Future<Output = bool> + Send + 'static,
    {
        tokio::spawn(async move {
            if fut.await {
                permit.mark_success();
            } else {
                permit.mark_failure();
            }
        })
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let stats = &self.stats;
        let tasks_submitted = stats.tasks_submitted.load(Ordering::Relaxed);
        let tasks_succeeded = stats.tasks_succeeded.load(Ordering::Relaxed);
        let tasks_failed = stats.tasks_failed.load(Ordering::Relaxed);
        let total_completed = tasks_succeeded + tasks_failed;

        let avg_wait_time_us = if tasks_submitted > 0 {
            stats.total_wait_time_us.load(Ordering::Relaxed) / tasks_submitted
        } else {
            0
        };

        let avg_exec_time_us = if total_completed > 0 {
            stats.total_exec_time_us.load(Ordering::Relaxed) / total_completed
        } else {
            0
        };

        WorkerPoolStats {
            name: self.config.name.clone(),
            max_workers: self.config.max_workers,
            available_permits: self.semaphore.available_permits(),
            active_workers: self.active_workers(),
            tasks_submitted,
            tasks_succeeded,
            tasks_failed,
            tasks_unknown: stats.tasks_unknown.load(Ordering::Relaxed),
            acquire_timeouts: stats.acquire_timeouts.load(Ordering::Relaxed),
            peak_concurrent: stats.peak_concurrent.load(Ordering::Relaxed),
            avg_wait_time_us,
            avg_exec_time_us,
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Snapshot of worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub name: String,
    pub max_workers: usize,
    pub available_permits: usize,
    pub active_workers: usize,
    pub tasks_submitted: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_unknown: u64,
    /// Permit waits that hit the timeout (rejected jobs)
    pub acquire_timeouts: u64,
    pub peak_concurrent: usize,
    pub avg_wait_time_us: u64,
    pub avg_exec_time_us: u64,
    pub uptime_secs: u64,
}
