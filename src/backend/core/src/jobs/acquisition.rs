//! Named job acquisitions.
//!
//! An acquisition runs one polling loop shared by every engine registered to
//! it. Each cycle locks a batch of due jobs per engine in a unit of work, then
//! hands the locked jobs to the shared worker pool, where each job executes in
//! its own unit of work. A job is only executed by the owner that locked it.
//!
//! State machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! Stopping halts new cycles immediately and waits for in-flight jobs.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::executor::{JobOutcome, UnlockJobCommand};
use super::strategy::AcquisitionStrategy;
use super::worker_pool::WorkerPool;
use super::JobId;
use crate::config::AcquisitionConfig;
use crate::context::TransactionOutcome;
use crate::engine::ProcessEngine;
use crate::error::{ConductorError, ErrorCode, Result};
use crate::persistence::LockResult;
use crate::telemetry::{JobMetrics, OperationTimer};

/// Lifecycle of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquisitionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

/// Identity of an acquisition, visible to the units of work it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionContext {
    pub name: String,
    /// Owner written to the jobs this acquisition locks
    pub lock_owner: String,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    acquired: AtomicU64,
    lock_conflicts: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Snapshot of an acquisition's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionStats {
    pub name: String,
    pub state: AcquisitionState,
    pub engines: usize,
    pub cycles: u64,
    pub acquired: u64,
    pub lock_conflicts: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub errors: u64,
}

struct RunHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    config: AcquisitionConfig,
    strategy: Arc<dyn AcquisitionStrategy>,
    context: Arc<AcquisitionContext>,
    engines: RwLock<Vec<Arc<ProcessEngine>>>,
    state: RwLock<AcquisitionState>,
    counters: Arc<Counters>,
    pool: Arc<WorkerPool>,
    permit_timeout: Duration,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

/// One named acquisition.
pub struct JobAcquisition {
    inner: Arc<Inner>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl JobAcquisition {
    pub fn new(
        config: AcquisitionConfig,
        strategy: Arc<dyn AcquisitionStrategy>,
        pool: Arc<WorkerPool>,
        permit_timeout: Duration,
    ) -> Self {
        let context = Arc::new(AcquisitionContext {
            name: config.name.clone(),
            lock_owner: config.lock_owner.clone(),
        });

        Self {
            inner: Arc::new(Inner {
                config,
                strategy,
                context,
                engines: RwLock::new(Vec::new()),
                state: RwLock::new(AcquisitionState::Stopped),
                counters: Arc::new(Counters::default()),
                pool,
                permit_timeout,
                in_flight: Mutex::new(Vec::new()),
            }),
            run: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &Arc<AcquisitionContext> {
        &self.inner.context
    }

    pub fn state(&self) -> AcquisitionState {
        *self.inner.state.read()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Engine Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach an engine. Engine names are unique per acquisition.
    pub fn register(&self, engine: Arc<ProcessEngine>) -> Result<()> {
        let mut engines = self.inner.engines.write();
        if engines.iter().any(|e| e.name() == engine.name()) {
            return Err(ConductorError::invalid_input(format!(
                "engine '{}' is already registered with acquisition '{}'",
                engine.name(),
                self.name()
            )));
        }
        info!(acquisition = %self.name(), engine = %engine.name(), "Engine registered");
        engines.push(engine);
        Ok(())
    }

    /// Detach an engine; returns whether it was registered.
    pub fn unregister(&self, engine_name: &str) -> bool {
        let mut engines = self.inner.engines.write();
        let before = engines.len();
        engines.retain(|e| e.name() != engine_name);
        let removed = engines.len() < before;
        if removed {
            info!(acquisition = %self.name(), engine = %engine_name, "Engine unregistered");
        }
        removed
    }

    pub fn engine_count(&self) -> usize {
        self.inner.engines.read().len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the acquisition loop. Only valid while stopped.
    pub async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        self.inner
            .transition(AcquisitionState::Stopped, AcquisitionState::Starting)?;

        let (shutdown, receiver) = watch::channel(false);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.run_loop(receiver).await });
        *run = Some(RunHandle { shutdown, task });

        self.inner
            .transition(AcquisitionState::Starting, AcquisitionState::Running)?;
        info!(
            acquisition = %self.name(),
            strategy = %self.inner.strategy.name(),
            lock_owner = %self.inner.context.lock_owner,
            "Job acquisition started"
        );
        Ok(())
    }

    /// Stop the loop and wait for every in-flight job. Only valid while running.
    pub async fn stop(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        self.inner
            .transition(AcquisitionState::Running, AcquisitionState::Stopping)?;
        info!(acquisition = %self.name(), "Stopping job acquisition");

        if let Some(handle) = run.take() {
            let _ = handle.shutdown.send(true);
            if let Err(e) = handle.task.await {
                error!(acquisition = %self.name(), error = %e, "Acquisition loop ended abnormally");
            }
        }

        self.inner.wait_in_flight().await;
        self.inner
            .transition(AcquisitionState::Stopping, AcquisitionState::Stopped)?;
        info!(acquisition = %self.name(), "Job acquisition stopped");
        Ok(())
    }

    /// Run a single cycle now; returns the number of jobs locked.
    ///
    /// Dispatched jobs run on the worker pool; use [`Self::wait_idle`] to wait for them.
    pub async fn run_cycle(&self) -> usize {
        self.inner.run_cycle().await
    }

    /// Wait until no job dispatched by this acquisition is executing.
    pub async fn wait_idle(&self) {
        self.inner.wait_in_flight().await;
    }

    pub fn stats(&self) -> AcquisitionStats {
        let c = &self.inner.counters;
        AcquisitionStats {
            name: self.name().to_string(),
            state: self.state(),
            engines: self.engine_count(),
            cycles: c.cycles.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            lock_conflicts: c.lock_conflicts.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn transition(&self, from: AcquisitionState, to: AcquisitionState) -> Result<()> {
        let mut state = self.state.write();
        if *state != from {
            return Err(ConductorError::invalid_state_transition(
                format!("job acquisition '{}'", self.config.name),
                *state,
                to,
            ));
        }
        debug!(acquisition = %self.config.name, from = %from, to = %to, "Acquisition state changed");
        *state = to;
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut wait = Duration::ZERO;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let found = self.run_cycle().await;
            wait = self.strategy.next_wait(found, wait, &self.config);

            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            debug!(
                acquisition = %self.config.name,
                wait_ms = wait.as_millis() as u64,
                "No jobs acquired, waiting"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(acquisition = %self.config.name, "Acquisition loop exited");
    }

    /// Lock and dispatch one batch per engine. Failures are logged and count as
    /// an empty cycle; they never end the loop.
    async fn run_cycle(&self) -> usize {
        let engines = self.engines.read().clone();
        let mut remaining = self.config.max_jobs_per_acquisition;
        let mut found = 0;

        for engine in engines {
            if remaining == 0 {
                break;
            }

            match self.lock_batch(&engine, remaining).await {
                Ok(locked) => {
                    found += locked.len();
                    remaining = remaining.saturating_sub(locked.len());
                    Counters::bump(&self.counters.acquired, locked.len() as u64);
                    JobMetrics::record_acquired(&self.config.name, engine.name(), locked.len());
                    self.dispatch(&engine, locked).await;
                }
                Err(e) => {
                    Counters::bump(&self.counters.errors, 1);
                    error!(
                        acquisition = %self.config.name,
                        engine = %engine.name(),
                        error_code = %e.code(),
                        error = %e.failure_detail(),
                        "Acquisition cycle failed, retrying after the wait interval"
                    );
                }
            }
        }

        Counters::bump(&self.counters.cycles, 1);
        found
    }

    async fn lock_batch(&self, engine: &Arc<ProcessEngine>, limit: usize) -> Result<Vec<JobId>> {
        let timer = OperationTimer::start("lock_batch");
        let ctx = engine.executor().open().with_acquisition(&self.context);
        let now = Utc::now();

        let candidates = match self.strategy.select(&ctx, limit, now).await {
            Ok(candidates) => candidates,
            Err(e) => {
                let _ = ctx.close(TransactionOutcome::RolledBack).await;
                return Err(ConductorError::unit_of_work_failed(format!(
                    "acquisition '{}' could not select jobs of engine '{}'",
                    self.config.name,
                    engine.name()
                ))
                .with_source(e));
            }
        };

        let expires_at = now + self.config.lock_time();
        let mut locked = Vec::with_capacity(candidates.len());

        for job in candidates {
            match ctx
                .store()
                .lock_job(job.id, &self.context.lock_owner, expires_at, now)
                .await
            {
                Ok(LockResult::Locked(job)) => locked.push(job.id),
                Ok(LockResult::AlreadyLocked) => {
                    Counters::bump(&self.counters.lock_conflicts, 1);
                    JobMetrics::record_lock_conflict(&self.config.name);
                    debug!(job_id = %job.id, "Job locked by another owner, skipping");
                }
                Ok(LockResult::NotFound) => {
                    debug!(job_id = %job.id, "Job disappeared before locking");
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to lock job");
                }
            }
        }

        ctx.close(TransactionOutcome::Committed).await.map_err(|e| {
            ConductorError::unit_of_work_failed(format!(
                "acquisition '{}' could not commit its locks",
                self.config.name
            ))
            .with_source(e)
        })?;
        timer.finish();
        Ok(locked)
    }

    async fn dispatch(&self, engine: &Arc<ProcessEngine>, jobs: Vec<JobId>) {
        for job_id in jobs {
            match self.pool.acquire_within(self.permit_timeout).await {
                Ok(permit) => {
                    let engine = engine.clone();
                    let context = self.context.clone();
                    let counters = self.counters.clone();

                    let handle = self.pool.spawn_with_permit(permit, async move {
                        match engine.execute_acquired_job(job_id, &context).await {
                            Ok(JobOutcome::Executed { .. }) => {
                                Counters::bump(&counters.executed, 1);
                                true
                            }
                            Ok(JobOutcome::Failed { .. }) => {
                                Counters::bump(&counters.failed, 1);
                                false
                            }
                            Ok(JobOutcome::Skipped) => {
                                Counters::bump(&counters.skipped, 1);
                                true
                            }
                            Err(e) if e.code() == ErrorCode::JobLockLost => {
                                Counters::bump(&counters.skipped, 1);
                                warn!(
                                    acquisition = %context.name,
                                    job_id = %job_id,
                                    "Job lock lost during execution, discarding its effects"
                                );
                                true
                            }
                            Err(e) => {
                                Counters::bump(&counters.errors, 1);
                                error!(
                                    acquisition = %context.name,
                                    job_id = %job_id,
                                    error = %e,
                                    "Job execution did not commit"
                                );
                                false
                            }
                        }
                    });

                    let mut in_flight = self.in_flight.lock();
                    in_flight.retain(|h| !h.is_finished());
                    in_flight.push(handle);
                }
                Err(e) => {
                    Counters::bump(&self.counters.rejected, 1);
                    JobMetrics::record_rejected(&self.config.name);
                    warn!(
                        acquisition = %self.config.name,
                        job_id = %job_id,
                        error = %e,
                        "Job rejected, releasing lock"
                    );
                    let unlock = UnlockJobCommand {
                        job_id,
                        owner: self.context.lock_owner.clone(),
                    };
                    if let Err(e) = engine.executor().execute(&unlock).await {
                        warn!(job_id = %job_id, error = %e, "Failed to release lock of rejected job");
                    }
                }
            }
        }
    }

    async fn wait_in_flight(&self) {
        loop {
            let handles: Vec<_> = self.in_flight.lock().drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(acquisition = %self.config.name, error = %e, "Job task ended abnormally");
                }
            }
        }
    }
}
