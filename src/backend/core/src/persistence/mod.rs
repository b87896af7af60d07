//! Persistence boundary.
//!
//! The engine never writes entities directly: commands stage [`Mutation`]s on
//! their unit of work, and the store applies them in one all-or-nothing
//! [`EngineStore::flush`] with revision checks. Locking a job is the single
//! exception. It is an atomic compare-and-set so that concurrent acquisition
//! cycles never both own a job.

pub mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::{EventSubscription, EventType, SubscriptionId};
use crate::execution::{ExecutionId, ExecutionNode};
use crate::jobs::{JobEntity, JobId};

/// A staged entity change.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    InsertJob(JobEntity),
    /// Replace a job; fails if the stored revision differs from the entity's.
    UpdateJob(JobEntity),
    /// Delete a job at the given revision.
    DeleteJob { id: JobId, revision: u64 },
    InsertSubscription(EventSubscription),
    DeleteSubscription(SubscriptionId),
    InsertExecution(ExecutionNode),
    DeleteExecution(ExecutionId),
}

impl Mutation {
    /// Entity kind, for logs and errors.
    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::InsertJob(_) | Self::UpdateJob(_) | Self::DeleteJob { .. } => "job",
            Self::InsertSubscription(_) | Self::DeleteSubscription(_) => "event_subscription",
            Self::InsertExecution(_) | Self::DeleteExecution(_) => "execution",
        }
    }
}

/// Result of an atomic lock attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LockResult {
    /// The job is now locked by the caller; carries the updated entity.
    Locked(JobEntity),
    /// The job is not acquirable: locked by someone else, not due, or failed.
    AlreadyLocked,
    /// The job no longer exists.
    NotFound,
}

/// Ordering of due-job queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrder {
    /// Oldest due date first
    #[default]
    DueDate,
    /// Highest priority first, then oldest due date
    PriorityThenDueDate,
}

/// Query for jobs an acquisition cycle may lock.
#[derive(Debug, Clone)]
pub struct DueJobQuery {
    pub now: DateTime<Utc>,
    pub limit: usize,
    pub order: JobOrder,
}

/// Storage used by the engine.
#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Apply `mutations` atomically: either all are applied or none.
    async fn flush(&self, mutations: Vec<Mutation>) -> Result<()>;

    /// Lock `id` for `owner` until `expires_at` if it is acquirable at `now`.
    async fn lock_job(
        &self,
        id: JobId,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<LockResult>;

    async fn find_job(&self, id: JobId) -> Result<Option<JobEntity>>;

    /// Acquirable jobs at `query.now`, ordered and limited.
    async fn query_due_jobs(&self, query: &DueJobQuery) -> Result<Vec<JobEntity>>;

    async fn find_jobs_by_execution(&self, execution_id: &ExecutionId) -> Result<Vec<JobEntity>>;

    /// Every job, oldest first.
    async fn list_jobs(&self) -> Result<Vec<JobEntity>>;

    /// Subscriptions matching exactly `(event_type, event_name, execution_id)`, oldest first.
    async fn find_subscriptions(
        &self,
        event_type: EventType,
        event_name: &str,
        execution_id: &ExecutionId,
    ) -> Result<Vec<EventSubscription>>;

    async fn find_subscriptions_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<EventSubscription>>;

    async fn find_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionNode>>;

    /// Direct children of `parent_id`, oldest first.
    async fn find_child_executions(&self, parent_id: &ExecutionId) -> Result<Vec<ExecutionNode>>;

    /// Root of the process instance called from `super_execution_id`, if any.
    async fn find_called_process_instance(
        &self,
        super_execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionNode>>;
}
