//! Integration tests for job acquisition and the job scheduler.
//!
//! Tests cover:
//! - Mutual exclusion of concurrent acquisitions on a shared store
//! - Retry exhaustion and failure records, including effects that fail to commit
//! - Takeover of jobs whose lock expired mid-execution
//! - Commit listener failures after a job committed
//! - Stopping while jobs are executing
//! - Lazy start and stop on engine registration
//! - Defining acquisitions at runtime

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conductor_core::config::{AcquisitionConfig, SchedulerConfig};
use conductor_core::context::UnitOfWork;
use conductor_core::engine::ProcessEngine;
use conductor_core::error::{ConductorError, ErrorCode, Result};
use conductor_core::execution::{ExecutionId, ExecutionNode};
use conductor_core::jobs::{
    AcquisitionState, BackoffStrategy, JobAcquisition, JobEntity, JobHandler, JobId, JobScheduler,
    RetryPolicy, StrategyRegistry, WorkerPool, WorkerPoolConfig, BACKOFF_STRATEGY, SEQUENTIAL_STRATEGY,
};
use conductor_core::persistence::{EngineStore, InMemoryStore, Mutation};

// ============================================================================
// Test Handlers
// ============================================================================

/// Records how often each job ran and whether two runs ever overlapped.
#[derive(Default)]
struct ExclusiveHandler {
    running: DashMap<JobId, ()>,
    runs: DashMap<JobId, usize>,
    overlapped: AtomicBool,
}

#[async_trait]
impl JobHandler for ExclusiveHandler {
    fn handler_type(&self) -> &str {
        "exclusive"
    }

    async fn execute(&self, job: &JobEntity, _ctx: &mut UnitOfWork, _engine: &ProcessEngine) -> Result<()> {
        if self.running.insert(job.id, ()).is_some() {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        *self.runs.entry(job.id).or_insert(0) += 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.running.remove(&job.id);
        Ok(())
    }
}

#[derive(Default)]
struct FailingHandler {
    attempts: AtomicUsize,
}

#[async_trait]
impl JobHandler for FailingHandler {
    fn handler_type(&self) -> &str {
        "always-fails"
    }

    async fn execute(&self, _job: &JobEntity, _ctx: &mut UnitOfWork, _engine: &ProcessEngine) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ConductorError::internal("downstream unavailable"))
    }
}

/// Sleeps, then fails when the job configuration says so.
#[derive(Default)]
struct SlowHandler {
    started: AtomicUsize,
}

#[async_trait]
impl JobHandler for SlowHandler {
    fn handler_type(&self) -> &str {
        "slow"
    }

    async fn execute(&self, job: &JobEntity, _ctx: &mut UnitOfWork, _engine: &ProcessEngine) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        if job.configuration["fail"].as_bool().unwrap_or(false) {
            return Err(ConductorError::internal("slow job failed"));
        }
        Ok(())
    }
}

/// Succeeds, but stages a delete of an execution that does not exist.
#[derive(Default)]
struct UncommittableHandler {
    attempts: AtomicUsize,
}

#[async_trait]
impl JobHandler for UncommittableHandler {
    fn handler_type(&self) -> &str {
        "uncommittable"
    }

    async fn execute(&self, _job: &JobEntity, ctx: &mut UnitOfWork, _engine: &ProcessEngine) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        ctx.stage(Mutation::DeleteExecution(ExecutionId::from("missing")));
        Ok(())
    }
}

/// First run is slow and leaves "first-effect"; later runs are fast and leave "next-effect".
#[derive(Default)]
struct StragglerHandler {
    started: AtomicUsize,
}

#[async_trait]
impl JobHandler for StragglerHandler {
    fn handler_type(&self) -> &str {
        "straggler"
    }

    async fn execute(&self, _job: &JobEntity, ctx: &mut UnitOfWork, _engine: &ProcessEngine) -> Result<()> {
        let effect = if self.started.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(400)).await;
            "first-effect"
        } else {
            "next-effect"
        };
        ctx.stage(Mutation::InsertExecution(ExecutionNode::process_instance(effect)));
        Ok(())
    }
}

/// Succeeds and registers a commit listener that fails.
struct FailingListenerHandler;

#[async_trait]
impl JobHandler for FailingListenerHandler {
    fn handler_type(&self) -> &str {
        "failing-listener"
    }

    async fn execute(&self, _job: &JobEntity, ctx: &mut UnitOfWork, _engine: &ProcessEngine) -> Result<()> {
        ctx.on_commit("notify", || Err(ConductorError::internal("notifier down")));
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn scheduler_config(owner: &str) -> SchedulerConfig {
    SchedulerConfig {
        worker_pool_size: 8,
        permit_timeout_millis: 1000,
        acquisitions: vec![AcquisitionConfig::named("default")
            .with_lock_owner(owner)
            .with_wait_time(10)
            .with_max_wait_time(40)
            .with_max_jobs(5)],
    }
}

fn engine(name: &str, store: &Arc<InMemoryStore>, handler: Arc<dyn JobHandler>) -> Arc<ProcessEngine> {
    ProcessEngine::builder(name)
        .with_store(store.clone())
        .with_retry_policy(RetryPolicy::with_retries(3).with_backoff(BackoffStrategy::immediate()))
        .with_handler(handler)
        .build()
        .unwrap()
}

/// Acquisition driven by hand through `run_cycle`.
fn manual_acquisition(owner: &str, lock_time_millis: u64) -> JobAcquisition {
    JobAcquisition::new(
        AcquisitionConfig::named("manual")
            .with_lock_owner(owner)
            .with_lock_time(lock_time_millis),
        StrategyRegistry::with_defaults().get(SEQUENTIAL_STRATEGY).unwrap(),
        Arc::new(WorkerPool::new(WorkerPoolConfig::default().with_max_workers(2))),
        Duration::from_secs(1),
    )
}

async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Mutual Exclusion Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_schedulers_never_run_a_job_twice() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(ExclusiveHandler::default());

    let engine_a = engine("engine-a", &store, handler.clone());
    let engine_b = engine("engine-b", &store, handler.clone());

    let mut job_ids = Vec::new();
    for _ in 0..30 {
        job_ids.push(engine_a.create_job(engine_a.new_job("exclusive")).await.unwrap());
    }

    let node_a = JobScheduler::new(scheduler_config("node-a"));
    let node_b = JobScheduler::new(scheduler_config("node-b"));
    node_a.register_engine("default", engine_a).await.unwrap();
    node_b.register_engine("default", engine_b).await.unwrap();

    eventually(|| store.job_count() == 0).await;

    node_a.shutdown().await;
    node_b.shutdown().await;

    assert!(!handler.overlapped.load(Ordering::SeqCst));
    for job_id in &job_ids {
        assert_eq!(handler.runs.get(job_id).map(|r| *r), Some(1));
    }

    let a = node_a.acquisition_stats("default").await.unwrap();
    let b = node_b.acquisition_stats("default").await.unwrap();
    assert_eq!(a.executed + b.executed, 30);
}

// ============================================================================
// Retry Tests
// ============================================================================

#[tokio::test]
async fn test_retries_exhausted_after_exactly_n_attempts() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FailingHandler::default());
    let engine = engine("engine", &store, handler.clone());

    let job_id = engine.create_job(engine.new_job("always-fails")).await.unwrap();

    let scheduler = JobScheduler::new(scheduler_config("node"));
    scheduler.register_engine("default", engine.clone()).await.unwrap();

    eventually(|| handler.attempts.load(Ordering::SeqCst) >= 3).await;
    // give the loop room to run a fourth time if it wrongly would
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.shutdown().await;

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);

    let job = engine.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.retries, 0);
    assert_eq!(job.failed_attempts, 3);
    assert!(job.is_failed());
    assert!(job.lock_owner.is_none());
    assert!(!job.is_in_inconsistent_lock_state());
    assert!(job
        .exception_message
        .as_deref()
        .unwrap_or_default()
        .contains("downstream unavailable"));

    let stats = scheduler.acquisition_stats("default").await.unwrap();
    assert_eq!(stats.failed, 3);
}

#[tokio::test]
async fn test_effects_that_never_commit_exhaust_retries() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(UncommittableHandler::default());
    let engine = engine("engine", &store, handler.clone());
    let job_id = engine.create_job(engine.new_job("uncommittable")).await.unwrap();

    let acquisition = manual_acquisition("node", 300_000);
    acquisition.register(engine.clone()).unwrap();

    for _ in 0..3 {
        assert_eq!(acquisition.run_cycle().await, 1);
        acquisition.wait_idle().await;
    }
    assert_eq!(acquisition.run_cycle().await, 0);

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    let job = engine.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.retries, 0);
    assert_eq!(job.failed_attempts, 3);
    assert!(job.lock_owner.is_none());
    assert!(job
        .exception_message
        .as_deref()
        .unwrap_or_default()
        .contains("updated by another unit of work"));

    let stats = acquisition.stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.errors, 0);
}

#[tokio::test]
async fn test_set_retries_makes_failed_job_acquirable_again() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(FailingHandler::default());
    let engine = engine("engine", &store, handler.clone());

    let job_id = engine
        .create_job(engine.new_job("always-fails").with_retries(1))
        .await
        .unwrap();
    let err = engine.execute_job(job_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobExecutionFailed);

    let failed = engine.find_job(job_id).await.unwrap().unwrap();
    assert!(failed.is_failed());
    assert!(!failed.is_acquirable(chrono::Utc::now()));

    let reset = engine.set_job_retries(job_id, 2).await.unwrap();
    assert_eq!(reset.retries, 2);
    assert!(reset.exception_message.is_none());
    assert!(reset.is_acquirable(chrono::Utc::now()));
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_waits_for_executing_jobs() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(SlowHandler::default());
    let engine = engine("engine", &store, handler.clone());

    let ok = engine.create_job(engine.new_job("slow")).await.unwrap();
    let failing = engine
        .create_job(
            engine
                .new_job("slow")
                .with_configuration(serde_json::json!({"fail": true})),
        )
        .await
        .unwrap();

    let scheduler = JobScheduler::new(scheduler_config("node"));
    scheduler.register_engine("default", engine.clone()).await.unwrap();

    eventually(|| handler.started.load(Ordering::SeqCst) >= 2).await;
    scheduler.shutdown().await;

    assert_eq!(
        scheduler.acquisition_state("default").await.unwrap(),
        AcquisitionState::Stopped
    );

    // every job either committed its success or its failure record
    assert!(engine.find_job(ok).await.unwrap().is_none());
    let job = engine.find_job(failing).await.unwrap().unwrap();
    assert_eq!(job.retries, 2);
    assert!(job.lock_owner.is_none());
    assert!(job.lock_expiration_time.is_none());
}

#[tokio::test]
async fn test_acquisition_starts_and_stops_with_engines() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(ExclusiveHandler::default());
    let first = engine("first", &store, handler.clone());
    let second = engine("second", &store, handler);

    let scheduler = JobScheduler::new(scheduler_config("node"));
    assert_eq!(
        scheduler.acquisition_state("default").await.unwrap(),
        AcquisitionState::Stopped
    );

    scheduler.register_engine("default", first).await.unwrap();
    scheduler.register_engine("default", second).await.unwrap();
    assert_eq!(
        scheduler.acquisition_state("default").await.unwrap(),
        AcquisitionState::Running
    );

    assert!(scheduler.unregister_engine("default", "first").await.unwrap());
    assert_eq!(
        scheduler.acquisition_state("default").await.unwrap(),
        AcquisitionState::Running
    );

    assert!(scheduler.unregister_engine("default", "second").await.unwrap());
    assert_eq!(
        scheduler.acquisition_state("default").await.unwrap(),
        AcquisitionState::Stopped
    );
    assert!(!scheduler.unregister_engine("default", "second").await.unwrap());
}

#[tokio::test]
async fn test_unknown_acquisition() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine("engine", &store, Arc::new(ExclusiveHandler::default()));
    let scheduler = JobScheduler::new(scheduler_config("node"));

    let err = scheduler.register_engine("batch", engine).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AcquisitionNotFound);
    assert_eq!(
        scheduler.acquisition_state("batch").await.unwrap_err().code(),
        ErrorCode::AcquisitionNotFound
    );
}

#[tokio::test]
async fn test_define_acquisition_at_runtime() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine("engine", &store, Arc::new(ExclusiveHandler::default()));
    let scheduler = JobScheduler::new(scheduler_config("node"));

    let err = scheduler
        .define_acquisition(AcquisitionConfig::named("batch").with_strategy("round-robin"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidConfiguration);

    let err = scheduler
        .define_acquisition(AcquisitionConfig::named("default"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInput);

    scheduler
        .define_acquisition(
            AcquisitionConfig::named("batch")
                .with_strategy(BACKOFF_STRATEGY)
                .with_lock_owner("node"),
        )
        .unwrap();
    assert_eq!(scheduler.acquisition_names(), vec!["batch", "default"]);

    scheduler.register_engine("batch", engine).await.unwrap();
    assert_eq!(
        scheduler.acquisition_state("batch").await.unwrap(),
        AcquisitionState::Running
    );
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_run_cycle_respects_due_dates() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(ExclusiveHandler::default());
    let engine = engine("engine", &store, handler.clone());

    let due = engine.create_job(engine.new_job("exclusive")).await.unwrap();
    let later = engine
        .create_job(
            engine
                .new_job("exclusive")
                .with_due_date(chrono::Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    engine
        .create_job(engine.new_job("exclusive").suspended())
        .await
        .unwrap();

    let acquisition = manual_acquisition("node", 300_000);
    acquisition.register(engine.clone()).unwrap();
    assert_eq!(acquisition.state(), AcquisitionState::Stopped);

    assert_eq!(acquisition.run_cycle().await, 1);
    acquisition.wait_idle().await;
    assert_eq!(acquisition.run_cycle().await, 0);

    assert!(store.find_job(due).await.unwrap().is_none());
    assert!(store.find_job(later).await.unwrap().is_some());
    assert_eq!(handler.runs.get(&due).map(|r| *r), Some(1));
    assert_eq!(acquisition.stats().executed, 1);
}

// ============================================================================
// Lock Expiry Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_lock_is_taken_over_and_straggler_effects_discarded() {
    let store = Arc::new(InMemoryStore::new());
    let handler = Arc::new(StragglerHandler::default());
    let engine_a = engine("engine-a", &store, handler.clone());
    let engine_b = engine("engine-b", &store, handler.clone());
    engine_a.create_job(engine_a.new_job("straggler")).await.unwrap();

    let node_a = manual_acquisition("node-a", 50);
    let node_b = manual_acquisition("node-b", 300_000);
    node_a.register(engine_a).unwrap();
    node_b.register(engine_b).unwrap();

    assert_eq!(node_a.run_cycle().await, 1);
    eventually(|| handler.started.load(Ordering::SeqCst) == 1).await;

    // node-a's lock expires while its handler is still running
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node_b.run_cycle().await, 1);
    node_b.wait_idle().await;
    node_a.wait_idle().await;

    assert_eq!(handler.started.load(Ordering::SeqCst), 2);
    assert_eq!(store.job_count(), 0);
    assert!(store
        .find_execution(&ExecutionId::from("next-effect"))
        .await
        .unwrap()
        .is_some());
    assert!(store
        .find_execution(&ExecutionId::from("first-effect"))
        .await
        .unwrap()
        .is_none());

    let a = node_a.stats();
    assert_eq!(a.skipped, 1);
    assert_eq!(a.executed, 0);
    assert_eq!(a.errors, 0);
    assert_eq!(node_b.stats().executed, 1);
}

// ============================================================================
// Listener Tests
// ============================================================================

#[tokio::test]
async fn test_commit_listener_failure_still_counts_as_executed() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine("engine", &store, Arc::new(FailingListenerHandler));
    engine.create_job(engine.new_job("failing-listener")).await.unwrap();

    let acquisition = manual_acquisition("node", 300_000);
    acquisition.register(engine).unwrap();

    assert_eq!(acquisition.run_cycle().await, 1);
    acquisition.wait_idle().await;

    assert_eq!(store.job_count(), 0);
    let stats = acquisition.stats();
    assert_eq!(stats.executed, 1);
    assert_eq!(stats.errors, 0);
}
