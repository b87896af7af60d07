//! Job commands.
//!
//! A job runs inside one unit of work. The handler's effects and the job's
//! deletion commit together on success. On failure the handler's effects are
//! rolled back to a savepoint and the failure record (one retry fewer, pushed
//! back due date, failure detail) commits in their place, so a job is never
//! left half-updated. If the commit itself fails, the failure is recorded in a
//! fresh unit of work by [`RecordJobFailureCommand`].

use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{JobEntity, JobId};
use crate::context::{Command, UnitOfWork};
use crate::engine::ProcessEngine;
use crate::error::{ConductorError, Result};
use crate::persistence::Mutation;
use crate::telemetry::JobMetrics;

/// How one job execution ended.
#[derive(Debug)]
pub enum JobOutcome {
    /// Handler succeeded; the job is deleted.
    Executed { duration: Duration },
    /// Handler failed; the job was rescheduled or, at zero retries, left failed.
    Failed { retries_left: u32, error: ConductorError },
    /// The job vanished or its lock moved to another owner.
    Skipped,
}

/// Execute one job.
pub struct ExecuteJobCommand<'a> {
    pub engine: &'a ProcessEngine,
    pub job_id: JobId,
    /// Report a missing job as an error instead of skipping it
    pub require_exists: bool,
}

#[async_trait]
impl Command for ExecuteJobCommand<'_> {
    type Output = JobOutcome;

    fn name(&self) -> &'static str {
        "execute_job"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<JobOutcome> {
        let Some(mut job) = ctx.store().find_job(self.job_id).await? else {
            if self.require_exists {
                return Err(ConductorError::job_not_found(self.job_id));
            }
            debug!(job_id = %self.job_id, "Job no longer exists, skipping");
            return Ok(JobOutcome::Skipped);
        };

        if let Some(acquisition) = ctx.acquisition() {
            if !job.is_locked_by(&acquisition.lock_owner) {
                warn!(
                    job_id = %job.id,
                    lock_owner = %acquisition.lock_owner,
                    current_owner = ?job.lock_owner,
                    "Job lock lost before execution, skipping"
                );
                return Ok(JobOutcome::Skipped);
            }
        }

        let engine = self.engine;
        let savepoint = ctx.savepoint();
        let start = Instant::now();

        let result = match engine.handlers().get(&job.handler_type) {
            Ok(handler) => handler.execute(&job, ctx, engine).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                let duration = start.elapsed();
                ctx.stage(Mutation::DeleteJob {
                    id: job.id,
                    revision: job.revision,
                });
                JobMetrics::record_executed(engine.name(), &job.handler_type, duration);
                debug!(
                    job_id = %job.id,
                    handler_type = %job.handler_type,
                    duration_ms = duration.as_millis() as u64,
                    "Job executed"
                );
                Ok(JobOutcome::Executed { duration })
            }
            Err(error) => {
                ctx.rollback_to(savepoint).await;
                let retries_left = record_failure(engine, &mut job, &error);
                ctx.stage(Mutation::UpdateJob(job));
                Ok(JobOutcome::Failed { retries_left, error })
            }
        }
    }
}

/// Record a failed attempt on a job whose execution did not commit.
///
/// Runs in a fresh unit of work after the execution's own was discarded.
/// Returns the retries left, or `None` when the job is gone or, with a
/// `lock_owner`, is no longer locked by it.
pub struct RecordJobFailureCommand<'a> {
    pub engine: &'a ProcessEngine,
    pub job_id: JobId,
    pub lock_owner: Option<&'a str>,
    pub error: &'a ConductorError,
}

#[async_trait]
impl Command for RecordJobFailureCommand<'_> {
    type Output = Option<u32>;

    fn name(&self) -> &'static str {
        "record_job_failure"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<Option<u32>> {
        let Some(mut job) = ctx.store().find_job(self.job_id).await? else {
            return Ok(None);
        };
        if let Some(owner) = self.lock_owner {
            if !job.is_locked_by(owner) {
                return Ok(None);
            }
        }

        let retries_left = record_failure(self.engine, &mut job, self.error);
        ctx.stage(Mutation::UpdateJob(job));
        Ok(Some(retries_left))
    }
}

/// Apply one failed attempt to `job`: one retry fewer, due date pushed back,
/// lock released. Returns the retries left.
fn record_failure(engine: &ProcessEngine, job: &mut JobEntity, error: &ConductorError) -> u32 {
    let config = engine.config();
    job.record_failure(
        &error.failure_detail(),
        &config.retry.backoff,
        Utc::now(),
        config.max_failure_message_length,
    );
    JobMetrics::record_failed(engine.name(), &job.handler_type, job.retries as i32);

    if job.is_failed() {
        warn!(
            job_id = %job.id,
            handler_type = %job.handler_type,
            error = %error,
            "Job failed with no retries left"
        );
    } else {
        info!(
            job_id = %job.id,
            handler_type = %job.handler_type,
            retries_left = job.retries,
            due_date = ?job.due_date,
            error = %error,
            "Job failed, rescheduled"
        );
    }

    job.retries
}

/// Persist a new job.
pub struct CreateJobCommand {
    pub job: JobEntity,
}

#[async_trait]
impl Command for CreateJobCommand {
    type Output = JobId;

    fn name(&self) -> &'static str {
        "create_job"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<JobId> {
        if self.job.handler_type.trim().is_empty() {
            return Err(ConductorError::validation("job handler type must not be empty"));
        }
        ctx.stage(Mutation::InsertJob(self.job.clone()));
        Ok(self.job.id)
    }
}

/// Set a job's remaining retries. Negative values clamp to zero.
pub struct SetJobRetriesCommand {
    pub job_id: JobId,
    pub retries: i32,
}

#[async_trait]
impl Command for SetJobRetriesCommand {
    type Output = JobEntity;

    fn name(&self) -> &'static str {
        "set_job_retries"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<JobEntity> {
        let mut job = ctx
            .store()
            .find_job(self.job_id)
            .await?
            .ok_or_else(|| ConductorError::job_not_found(self.job_id))?;

        job.set_retries(self.retries);
        info!(job_id = %job.id, retries = job.retries, "Job retries set");
        ctx.stage(Mutation::UpdateJob(job.clone()));
        Ok(job)
    }
}

/// Release a lock held by `owner`, making the job acquirable again.
pub struct UnlockJobCommand {
    pub job_id: JobId,
    pub owner: String,
}

#[async_trait]
impl Command for UnlockJobCommand {
    type Output = bool;

    fn name(&self) -> &'static str {
        "unlock_job"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<bool> {
        let Some(mut job) = ctx.store().find_job(self.job_id).await? else {
            return Ok(false);
        };
        if !job.is_locked_by(&self.owner) {
            return Ok(false);
        }
        job.unlock();
        ctx.stage(Mutation::UpdateJob(job));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CommandExecutor;
    use crate::error::ErrorCode;
    use crate::persistence::{EngineStore, InMemoryStore, LockResult};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_retries_unknown_job() {
        let executor = CommandExecutor::new(Arc::new(InMemoryStore::new()));
        let err = executor
            .execute(&SetJobRetriesCommand {
                job_id: JobId::new(),
                retries: 3,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_set_retries_clamps_negative() {
        let store = Arc::new(InMemoryStore::new());
        let executor = CommandExecutor::new(store.clone());
        let id = executor
            .execute(&CreateJobCommand {
                job: JobEntity::new("async-continuation"),
            })
            .await
            .unwrap();

        let job = executor
            .execute(&SetJobRetriesCommand { job_id: id, retries: -4 })
            .await
            .unwrap();

        assert_eq!(job.retries, 0);
        assert!(store.find_job(id).await.unwrap().unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_unlock_only_by_owner() {
        let store = Arc::new(InMemoryStore::new());
        let executor = CommandExecutor::new(store.clone());
        let id = executor
            .execute(&CreateJobCommand {
                job: JobEntity::new("async-continuation"),
            })
            .await
            .unwrap();

        let now = Utc::now();
        let locked = store
            .lock_job(id, "node-a", now + chrono::Duration::minutes(5), now)
            .await
            .unwrap();
        assert!(matches!(locked, LockResult::Locked(_)));

        let by_other = executor
            .execute(&UnlockJobCommand { job_id: id, owner: "node-b".into() })
            .await
            .unwrap();
        assert!(!by_other);

        let by_owner = executor
            .execute(&UnlockJobCommand { job_id: id, owner: "node-a".into() })
            .await
            .unwrap();
        assert!(by_owner);
        assert!(store.find_job(id).await.unwrap().unwrap().lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_create_job_requires_handler_type() {
        let executor = CommandExecutor::new(Arc::new(InMemoryStore::new()));
        let err = executor
            .execute(&CreateJobCommand { job: JobEntity::new(" ") })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
}
