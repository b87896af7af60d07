//! Integration tests for units of work and the command executor.
//!
//! Tests cover:
//! - All-or-nothing flushes
//! - Listener firing on commit, rollback and flush failure
//! - Savepoints
//! - Nested commands sharing one unit of work

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use conductor_core::context::{Command, CommandExecutor, TransactionOutcome, UnitOfWork};
use conductor_core::error::{ConductorError, ErrorCode, Result};
use conductor_core::execution::{ExecutionId, ExecutionNode};
use conductor_core::jobs::{CreateJobCommand, JobEntity, JobId};
use conductor_core::persistence::{EngineStore, InMemoryStore, Mutation};

fn setup() -> (Arc<InMemoryStore>, CommandExecutor) {
    let store = Arc::new(InMemoryStore::new());
    let executor = CommandExecutor::new(store.clone());
    (store, executor)
}

async fn seed_job(executor: &CommandExecutor) -> JobId {
    executor
        .execute(&CreateJobCommand {
            job: JobEntity::new("noop"),
        })
        .await
        .unwrap()
}

// ============================================================================
// Flush Tests
// ============================================================================

#[tokio::test]
async fn test_commit_flushes_all_mutations() {
    let (store, executor) = setup();

    let mut ctx = executor.open();
    ctx.stage(Mutation::InsertExecution(ExecutionNode::process_instance("pi-1")));
    ctx.stage(Mutation::InsertJob(JobEntity::new("noop")));
    ctx.stage(Mutation::InsertJob(JobEntity::new("noop")));
    ctx.close(TransactionOutcome::Committed).await.unwrap();

    assert_eq!(store.execution_count(), 1);
    assert_eq!(store.job_count(), 2);
}

#[tokio::test]
async fn test_rollback_discards_mutations() {
    let (store, executor) = setup();

    let mut ctx = executor.open();
    ctx.stage(Mutation::InsertJob(JobEntity::new("noop")));
    ctx.close(TransactionOutcome::RolledBack).await.unwrap();

    assert_eq!(store.job_count(), 0);
}

#[tokio::test]
async fn test_failed_flush_applies_nothing() {
    let (store, executor) = setup();
    let job_id = seed_job(&executor).await;

    let mut ctx = executor.open();
    ctx.stage(Mutation::InsertExecution(ExecutionNode::process_instance("pi-1")));
    ctx.stage(Mutation::DeleteJob {
        id: job_id,
        revision: 99,
    });
    let err = ctx.close(TransactionOutcome::Committed).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::OptimisticLockConflict);
    assert_eq!(store.execution_count(), 0);
    assert!(store.find_job(job_id).await.unwrap().is_some());
}

// ============================================================================
// Listener Tests
// ============================================================================

#[tokio::test]
async fn test_flush_failure_fires_rollback_listeners_and_keeps_error() {
    let (store, executor) = setup();
    let job_id = seed_job(&executor).await;

    let rolled_back = Arc::new(AtomicUsize::new(0));
    let committed = Arc::new(AtomicUsize::new(0));

    let mut ctx = executor.open();
    ctx.stage(Mutation::DeleteJob {
        id: job_id,
        revision: 99,
    });

    let counter = rolled_back.clone();
    ctx.on_rollback("failing-cleanup", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(ConductorError::internal("cleanup failed"))
    });
    let counter = rolled_back.clone();
    ctx.on_rollback("cleanup", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let counter = committed.clone();
    ctx.on_commit("notify", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let err = ctx.close(TransactionOutcome::Committed).await.unwrap_err();

    // the flush error wins over the failing rollback listener
    assert_eq!(err.code(), ErrorCode::OptimisticLockConflict);
    assert_eq!(rolled_back.load(Ordering::SeqCst), 2);
    assert_eq!(committed.load(Ordering::SeqCst), 0);
    assert!(store.find_job(job_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_commit_listeners_fire_in_order() {
    let (_store, executor) = setup();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut ctx = executor.open();
    for name in ["first", "second", "third"] {
        let order = order.clone();
        ctx.on_commit(name, move || {
            order.lock().push(name);
            Ok(())
        });
    }
    let rolled_back = Arc::new(AtomicUsize::new(0));
    let counter = rolled_back.clone();
    ctx.on_rollback("never", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    ctx.close(TransactionOutcome::Committed).await.unwrap();

    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    assert_eq!(rolled_back.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failing_commit_listener_does_not_stop_the_rest() {
    let (_store, executor) = setup();
    let fired = Arc::new(AtomicUsize::new(0));
    let rolled_back = Arc::new(AtomicUsize::new(0));

    let mut ctx = executor.open();
    ctx.on_commit("broken", || Err(ConductorError::internal("boom")));
    let counter = fired.clone();
    ctx.on_commit("after-broken", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let counter = rolled_back.clone();
    ctx.on_rollback("compensate", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let err = ctx.close(TransactionOutcome::Committed).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::ListenerFailed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rollback_listener_failure_is_not_raised() {
    let (_store, executor) = setup();

    let mut ctx = executor.open();
    ctx.on_rollback("broken", || Err(ConductorError::internal("boom")));

    assert!(ctx.close(TransactionOutcome::RolledBack).await.is_ok());
}

// ============================================================================
// Savepoint Tests
// ============================================================================

#[tokio::test]
async fn test_rollback_to_savepoint() {
    let (store, executor) = setup();
    let compensated = Arc::new(AtomicUsize::new(0));
    let committed = Arc::new(AtomicUsize::new(0));

    let mut ctx = executor.open();
    ctx.stage(Mutation::InsertJob(JobEntity::new("kept")));
    let savepoint = ctx.savepoint();

    ctx.stage(Mutation::InsertJob(JobEntity::new("discarded")));
    let counter = compensated.clone();
    ctx.on_rollback("compensate", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let counter = committed.clone();
    ctx.on_commit("notify", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    ctx.rollback_to(savepoint).await;
    assert_eq!(ctx.mutations().len(), 1);
    assert_eq!(compensated.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.listener_count(TransactionOutcome::Committed), 0);

    ctx.close(TransactionOutcome::Committed).await.unwrap();

    let jobs = store.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].handler_type, "kept");
    assert_eq!(committed.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Command Tests
// ============================================================================

struct InsertInstance(&'static str);

#[async_trait]
impl Command for InsertInstance {
    type Output = ();

    fn name(&self) -> &'static str {
        "insert_instance"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<()> {
        ctx.stage(Mutation::InsertExecution(ExecutionNode::process_instance(self.0)));
        Ok(())
    }
}

struct InsertThenFail {
    executor: CommandExecutor,
}

#[async_trait]
impl Command for InsertThenFail {
    type Output = ();

    fn name(&self) -> &'static str {
        "insert_then_fail"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<()> {
        self.executor
            .execute_nested(ctx, &InsertInstance("inner"))
            .await?;
        Err(ConductorError::validation("outer command rejected"))
    }
}

struct InsertTwice {
    executor: CommandExecutor,
}

#[async_trait]
impl Command for InsertTwice {
    type Output = usize;

    fn name(&self) -> &'static str {
        "insert_twice"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<usize> {
        self.executor.execute_nested(ctx, &InsertInstance("a")).await?;
        self.executor.execute_nested(ctx, &InsertInstance("b")).await?;
        Ok(ctx.mutations().len())
    }
}

#[tokio::test]
async fn test_nested_commands_share_unit_of_work() {
    let (store, executor) = setup();
    let outer = InsertTwice {
        executor: CommandExecutor::new(store.clone()),
    };

    let staged = executor.execute(&outer).await.unwrap();

    assert_eq!(staged, 2);
    assert!(store.find_execution(&ExecutionId::from("a")).await.unwrap().is_some());
    assert!(store.find_execution(&ExecutionId::from("b")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failing_outer_command_discards_nested_work() {
    let (store, executor) = setup();
    let outer = InsertThenFail {
        executor: CommandExecutor::new(store.clone()),
    };

    let err = executor.execute(&outer).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert_eq!(store.execution_count(), 0);
}
