//! Commands and the executor that wraps them in a unit of work.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug_span, Instrument};

use super::{TransactionOutcome, UnitOfWork};
use crate::error::{ConductorError, ErrorCode, Result};
use crate::persistence::EngineStore;

/// An operation that runs inside a unit of work.
#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    /// Name used for the command span.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<Self::Output>;
}

/// How closing the unit of work of a successful command ended.
#[derive(Debug)]
pub enum CommitOutcome<T> {
    /// Mutations flushed and every commit listener succeeded.
    Committed(T),
    /// Mutations flushed, then a commit listener failed.
    ListenerFailed { output: T, error: ConductorError },
    /// The flush failed; nothing the command staged reached the store.
    NotCommitted { output: T, error: ConductorError },
}

impl<T> CommitOutcome<T> {
    fn from_close(output: T, closed: Result<()>) -> Self {
        match closed {
            Ok(()) => Self::Committed(output),
            Err(error) if error.code() == ErrorCode::ListenerFailed => {
                Self::ListenerFailed { output, error }
            }
            Err(error) => Self::NotCommitted { output, error },
        }
    }

    /// The output of a clean commit, otherwise the close error.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Committed(output) => Ok(output),
            Self::ListenerFailed { error, .. } | Self::NotCommitted { error, .. } => Err(error),
        }
    }
}

/// Runs commands, each in its own unit of work unless one is supplied.
#[derive(Clone)]
pub struct CommandExecutor {
    store: Arc<dyn EngineStore>,
}

impl CommandExecutor {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    /// Open a unit of work on this executor's store.
    pub fn open(&self) -> UnitOfWork {
        UnitOfWork::open(self.store.clone())
    }

    /// Run `command` in a fresh unit of work.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output> {
        self.execute_in(self.open(), command).await
    }

    /// Run `command` in `ctx` and close it: committed on success, rolled back on
    /// error. A command error is returned unchanged.
    pub async fn execute_in<C: Command>(&self, ctx: UnitOfWork, command: &C) -> Result<C::Output> {
        self.execute_with_commit(ctx, command).await?.into_result()
    }

    /// Like [`Self::execute_in`], but a failed close keeps the command output.
    ///
    /// `Err` is only returned when the command itself failed.
    pub async fn execute_with_commit<C: Command>(
        &self,
        mut ctx: UnitOfWork,
        command: &C,
    ) -> Result<CommitOutcome<C::Output>> {
        let span = debug_span!("command", command = command.name(), unit_of_work = %ctx.id());

        async move {
            match command.execute(&mut ctx).await {
                Ok(output) => {
                    let closed = ctx.close(TransactionOutcome::Committed).await;
                    Ok(CommitOutcome::from_close(output, closed))
                }
                Err(err) => {
                    err.log();
                    // rollback listener failures are logged inside close
                    let _ = ctx.close(TransactionOutcome::RolledBack).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Run `command` inside an enclosing unit of work without closing it.
    pub async fn execute_nested<C: Command>(&self, ctx: &mut UnitOfWork, command: &C) -> Result<C::Output> {
        command.execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobEntity;
    use crate::persistence::{InMemoryStore, Mutation};
    use parking_lot::Mutex;

    struct InsertJob {
        job: JobEntity,
        fail: bool,
    }

    #[async_trait]
    impl Command for InsertJob {
        type Output = ();

        async fn execute(&self, ctx: &mut UnitOfWork) -> Result<()> {
            ctx.stage(Mutation::InsertJob(self.job.clone()));
            if self.fail {
                return Err(ConductorError::invalid_input("rejected"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_execute_commits() {
        let store = Arc::new(InMemoryStore::new());
        let executor = CommandExecutor::new(store.clone());
        let job = JobEntity::new("x");
        let id = job.id;

        executor.execute(&InsertJob { job, fail: false }).await.unwrap();
        assert!(store.find_job(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_execute_rolls_back_and_returns_original_error() {
        let store = Arc::new(InMemoryStore::new());
        let executor = CommandExecutor::new(store.clone());
        let rolled_back = Arc::new(Mutex::new(false));

        let mut ctx = executor.open();
        let flag = rolled_back.clone();
        ctx.on_rollback("flag", move || {
            *flag.lock() = true;
            Ok(())
        });

        let err = executor
            .execute_in(ctx, &InsertJob { job: JobEntity::new("x"), fail: true })
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert!(*rolled_back.lock());
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_nested_commands_share_one_outcome() {
        let store = Arc::new(InMemoryStore::new());
        let executor = CommandExecutor::new(store.clone());

        let mut ctx = executor.open();
        executor
            .execute_nested(&mut ctx, &InsertJob { job: JobEntity::new("a"), fail: false })
            .await
            .unwrap();
        executor
            .execute_nested(&mut ctx, &InsertJob { job: JobEntity::new("b"), fail: false })
            .await
            .unwrap();
        assert_eq!(store.job_count(), 0);

        ctx.close(TransactionOutcome::Committed).await.unwrap();
        assert_eq!(store.job_count(), 2);
    }

    #[tokio::test]
    async fn test_commit_outcome_separates_flush_and_listener_failures() {
        let store = Arc::new(InMemoryStore::new());
        let executor = CommandExecutor::new(store.clone());
        let job = JobEntity::new("x");
        executor
            .execute(&InsertJob { job: job.clone(), fail: false })
            .await
            .unwrap();

        // same id again: the flush fails and the output is kept
        let outcome = executor
            .execute_with_commit(executor.open(), &InsertJob { job, fail: false })
            .await
            .unwrap();
        match outcome {
            CommitOutcome::NotCommitted { error, .. } => {
                assert_eq!(error.code(), ErrorCode::DuplicateRecord)
            }
            other => panic!("expected NotCommitted, got {:?}", other),
        }

        let mut ctx = executor.open();
        ctx.on_commit("audit", || Err(ConductorError::internal("audit sink down")));
        let outcome = executor
            .execute_with_commit(ctx, &InsertJob { job: JobEntity::new("y"), fail: false })
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::ListenerFailed { .. }));
        assert_eq!(store.job_count(), 2);

        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ListenerFailed);
    }
}
