//! In-memory engine store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

use super::{DueJobQuery, EngineStore, JobOrder, LockResult, Mutation};
use crate::error::{ConductorError, ErrorCode, Result};
use crate::events::{EventSubscription, EventType, SubscriptionId};
use crate::execution::{ExecutionId, ExecutionNode};
use crate::jobs::{JobEntity, JobId};

/// A stored entity plus its insertion sequence, used for stable ordering.
#[derive(Debug, Clone)]
struct Stored<T> {
    seq: u64,
    entity: T,
}

#[derive(Debug, Clone, Default)]
struct State {
    next_seq: u64,
    jobs: HashMap<JobId, Stored<JobEntity>>,
    subscriptions: HashMap<SubscriptionId, Stored<EventSubscription>>,
    executions: HashMap<ExecutionId, Stored<ExecutionNode>>,
}

impl State {
    fn insert<K, T>(map: &mut HashMap<K, Stored<T>>, seq: &mut u64, key: K, entity: T, kind: &str) -> Result<()>
    where
        K: Eq + Hash + std::fmt::Display,
    {
        if map.contains_key(&key) {
            return Err(ConductorError::new(
                ErrorCode::DuplicateRecord,
                format!("{} {} already exists", kind, key),
            ));
        }
        *seq += 1;
        map.insert(key, Stored { seq: *seq, entity });
        Ok(())
    }

    fn apply(&mut self, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::InsertJob(job) => {
                Self::insert(&mut self.jobs, &mut self.next_seq, job.id, job, "job")
            }
            Mutation::UpdateJob(mut job) => match self.jobs.get_mut(&job.id) {
                Some(stored) if stored.entity.revision == job.revision => {
                    job.revision += 1;
                    stored.entity = job;
                    Ok(())
                }
                _ => Err(ConductorError::optimistic_lock("job", job.id)),
            },
            Mutation::DeleteJob { id, revision } => match self.jobs.get(&id) {
                Some(stored) if stored.entity.revision == revision => {
                    self.jobs.remove(&id);
                    Ok(())
                }
                _ => Err(ConductorError::optimistic_lock("job", id)),
            },
            Mutation::InsertSubscription(subscription) => {
                // one subscription per (event type, event name, execution)
                let taken = self.subscriptions.values().any(|s| {
                    s.entity.event_type == subscription.event_type
                        && s.entity.event_name == subscription.event_name
                        && s.entity.execution_id == subscription.execution_id
                });
                if taken {
                    return Err(ConductorError::duplicate_subscription(
                        subscription.event_type,
                        subscription.event_name,
                        &subscription.execution_id,
                    ));
                }
                Self::insert(
                    &mut self.subscriptions,
                    &mut self.next_seq,
                    subscription.id,
                    subscription,
                    "event subscription",
                )
            }
            Mutation::DeleteSubscription(id) => match self.subscriptions.remove(&id) {
                Some(_) => Ok(()),
                None => Err(ConductorError::optimistic_lock("event subscription", id)),
            },
            Mutation::InsertExecution(node) => Self::insert(
                &mut self.executions,
                &mut self.next_seq,
                node.id.clone(),
                node,
                "execution",
            ),
            Mutation::DeleteExecution(id) => match self.executions.remove(&id) {
                Some(_) => Ok(()),
                None => Err(ConductorError::optimistic_lock("execution", &id)),
            },
        }
    }
}

fn ordered<T: Clone>(mut items: Vec<&Stored<T>>) -> Vec<T> {
    items.sort_by_key(|s| s.seq);
    items.into_iter().map(|s| s.entity.clone()).collect()
}

/// Engine store kept in process memory.
///
/// Flushes are applied to a copy of the state and swapped in only when every
/// mutation succeeded, so a failed flush leaves no trace.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn execution_count(&self) -> usize {
        self.state.lock().executions.len()
    }
}

#[async_trait]
impl EngineStore for InMemoryStore {
    async fn flush(&self, mutations: Vec<Mutation>) -> Result<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        for mutation in mutations {
            next.apply(mutation)?;
        }
        *state = next;
        Ok(())
    }

    async fn lock_job(
        &self,
        id: JobId,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<LockResult> {
        let mut state = self.state.lock();
        let Some(stored) = state.jobs.get_mut(&id) else {
            return Ok(LockResult::NotFound);
        };
        if !stored.entity.is_acquirable(now) {
            return Ok(LockResult::AlreadyLocked);
        }
        stored.entity.lock(owner, expires_at);
        stored.entity.revision += 1;
        Ok(LockResult::Locked(stored.entity.clone()))
    }

    async fn find_job(&self, id: JobId) -> Result<Option<JobEntity>> {
        Ok(self.state.lock().jobs.get(&id).map(|s| s.entity.clone()))
    }

    async fn query_due_jobs(&self, query: &DueJobQuery) -> Result<Vec<JobEntity>> {
        let state = self.state.lock();
        let mut due: Vec<&Stored<JobEntity>> = state
            .jobs
            .values()
            .filter(|s| s.entity.is_acquirable(query.now))
            .collect();

        let due_key = |s: &Stored<JobEntity>| (s.entity.due_date.unwrap_or(s.entity.created_at), s.seq);
        match query.order {
            JobOrder::DueDate => due.sort_by_key(|s| due_key(*s)),
            JobOrder::PriorityThenDueDate => due.sort_by(|a, b| {
                b.entity
                    .priority
                    .cmp(&a.entity.priority)
                    .then_with(|| due_key(*a).cmp(&due_key(*b)))
            }),
        }

        Ok(due
            .into_iter()
            .take(query.limit)
            .map(|s| s.entity.clone())
            .collect())
    }

    async fn find_jobs_by_execution(&self, execution_id: &ExecutionId) -> Result<Vec<JobEntity>> {
        let state = self.state.lock();
        Ok(ordered(
            state
                .jobs
                .values()
                .filter(|s| s.entity.execution_id.as_ref() == Some(execution_id))
                .collect(),
        ))
    }

    async fn list_jobs(&self) -> Result<Vec<JobEntity>> {
        let state = self.state.lock();
        Ok(ordered(state.jobs.values().collect()))
    }

    async fn find_subscriptions(
        &self,
        event_type: EventType,
        event_name: &str,
        execution_id: &ExecutionId,
    ) -> Result<Vec<EventSubscription>> {
        let state = self.state.lock();
        Ok(ordered(
            state
                .subscriptions
                .values()
                .filter(|s| s.entity.matches(event_type, event_name, execution_id))
                .collect(),
        ))
    }

    async fn find_subscriptions_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<EventSubscription>> {
        let state = self.state.lock();
        Ok(ordered(
            state
                .subscriptions
                .values()
                .filter(|s| &s.entity.execution_id == execution_id)
                .collect(),
        ))
    }

    async fn find_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionNode>> {
        Ok(self.state.lock().executions.get(id).map(|s| s.entity.clone()))
    }

    async fn find_child_executions(&self, parent_id: &ExecutionId) -> Result<Vec<ExecutionNode>> {
        let state = self.state.lock();
        Ok(ordered(
            state
                .executions
                .values()
                .filter(|s| s.entity.parent_id.as_ref() == Some(parent_id))
                .collect(),
        ))
    }

    async fn find_called_process_instance(
        &self,
        super_execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionNode>> {
        let state = self.state.lock();
        Ok(ordered(
            state
                .executions
                .values()
                .filter(|s| s.entity.super_execution_id.as_ref() == Some(super_execution_id))
                .collect(),
        )
        .into_iter()
        .next())
    }
}
