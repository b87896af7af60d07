//! Event correlation.
//!
//! Delivery looks up subscriptions by the exact `(type, name, execution)` key,
//! consumes the first match and resumes its execution in the caller's unit of
//! work. Subscribing twice to the same key is rejected, so at most one
//! subscription is ever a delivery target.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{EventSubscription, EventType, SubscriptionId};
use crate::context::{Command, UnitOfWork};
use crate::error::{ConductorError, Result};
use crate::execution::{ExecutionId, ExecutionRuntime, ResumeTrigger};
use crate::jobs::{handler::EVENT_DELIVERY_HANDLER, JobEntity, JobId};
use crate::persistence::Mutation;
use crate::telemetry::EngineMetrics;

/// Configuration of an `event-delivery` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDelivery {
    pub event_type: EventType,
    pub event_name: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Matches incoming events to waiting executions.
#[derive(Clone)]
pub struct EventCorrelator {
    runtime: Arc<dyn ExecutionRuntime>,
}

impl EventCorrelator {
    pub fn new(runtime: Arc<dyn ExecutionRuntime>) -> Self {
        Self { runtime }
    }

    /// Subscriptions for the key as seen from inside `ctx`: stored ones not yet
    /// consumed by `ctx`, followed by ones `ctx` created.
    pub async fn find_subscriptions(
        &self,
        ctx: &UnitOfWork,
        event_type: EventType,
        event_name: &str,
        execution_id: &ExecutionId,
    ) -> Result<Vec<EventSubscription>> {
        let stored = ctx
            .store()
            .find_subscriptions(event_type, event_name, execution_id)
            .await?;

        let consumed: Vec<SubscriptionId> = ctx
            .mutations()
            .iter()
            .filter_map(|m| match m {
                Mutation::DeleteSubscription(id) => Some(*id),
                _ => None,
            })
            .collect();

        let staged = ctx.mutations().iter().filter_map(|m| match m {
            Mutation::InsertSubscription(s) if s.matches(event_type, event_name, execution_id) => {
                Some(s.clone())
            }
            _ => None,
        });

        Ok(stored
            .into_iter()
            .chain(staged)
            .filter(|s| !consumed.contains(&s.id))
            .collect())
    }

    /// Create a subscription. A second subscription for the same key is rejected,
    /// here when it is visible and otherwise by the store when the unit of work commits.
    pub async fn subscribe(
        &self,
        ctx: &mut UnitOfWork,
        subscription: EventSubscription,
    ) -> Result<SubscriptionId> {
        let existing = self
            .find_subscriptions(
                ctx,
                subscription.event_type,
                &subscription.event_name,
                &subscription.execution_id,
            )
            .await?;

        if !existing.is_empty() {
            return Err(ConductorError::duplicate_subscription(
                subscription.event_type,
                subscription.event_name.clone(),
                &subscription.execution_id,
            ));
        }

        let id = subscription.id;
        debug!(
            unit_of_work = %ctx.id(),
            subscription_id = %id,
            event_type = %subscription.event_type,
            event_name = %subscription.event_name,
            execution_id = %subscription.execution_id,
            "Event subscription created"
        );
        ctx.stage(Mutation::InsertSubscription(subscription));
        Ok(id)
    }

    /// Deliver an event to the subscription with the given key and resume its
    /// execution inside `ctx`.
    ///
    /// No matching subscription is a client error.
    pub async fn deliver(
        &self,
        ctx: &mut UnitOfWork,
        event_type: EventType,
        event_name: &str,
        execution_id: &ExecutionId,
        payload: Option<Value>,
    ) -> Result<SubscriptionId> {
        let matches = self
            .find_subscriptions(ctx, event_type, event_name, execution_id)
            .await?;

        let Some(target) = matches.first() else {
            return Err(ConductorError::subscription_not_found(
                event_type,
                event_name,
                execution_id,
            ));
        };

        if matches.len() > 1 {
            warn!(
                event_type = %event_type,
                event_name = %event_name,
                execution_id = %execution_id,
                count = matches.len(),
                "Duplicate event subscriptions for one correlation key, delivering to the oldest"
            );
        }

        let id = target.id;
        ctx.stage(Mutation::DeleteSubscription(id));
        self.runtime
            .resume(
                ctx,
                execution_id,
                ResumeTrigger::Event {
                    event_type,
                    event_name: event_name.to_string(),
                },
                payload,
            )
            .await?;

        EngineMetrics::record_event_delivered(event_type.as_str());
        info!(
            unit_of_work = %ctx.id(),
            subscription_id = %id,
            event_type = %event_type,
            event_name = %event_name,
            execution_id = %execution_id,
            "Event delivered"
        );
        Ok(id)
    }

    /// Check the subscription exists now and schedule the delivery as an
    /// `event-delivery` job.
    pub async fn deliver_async(
        &self,
        ctx: &mut UnitOfWork,
        event_type: EventType,
        event_name: &str,
        execution_id: &ExecutionId,
        payload: Option<Value>,
        retries: u32,
    ) -> Result<JobId> {
        let matches = self
            .find_subscriptions(ctx, event_type, event_name, execution_id)
            .await?;
        let Some(target) = matches.first() else {
            return Err(ConductorError::subscription_not_found(
                event_type,
                event_name,
                execution_id,
            ));
        };

        let delivery = EventDelivery {
            event_type,
            event_name: event_name.to_string(),
            payload,
        };

        let mut job = JobEntity::new(EVENT_DELIVERY_HANDLER)
            .with_execution(execution_id)
            .with_configuration(serde_json::to_value(&delivery).map_err(ConductorError::serialization)?)
            .with_retries(retries);
        job.process_instance_id = target.process_instance_id.clone();

        let job_id = job.id;
        debug!(
            unit_of_work = %ctx.id(),
            job_id = %job_id,
            event_name = %event_name,
            execution_id = %execution_id,
            "Event delivery scheduled"
        );
        ctx.stage(Mutation::InsertJob(job));
        Ok(job_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Commands
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SubscribeCommand<'a> {
    pub correlator: &'a EventCorrelator,
    pub subscription: EventSubscription,
}

#[async_trait]
impl Command for SubscribeCommand<'_> {
    type Output = SubscriptionId;

    fn name(&self) -> &'static str {
        "subscribe"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<SubscriptionId> {
        self.correlator.subscribe(ctx, self.subscription.clone()).await
    }
}

pub struct DeliverEventCommand<'a> {
    pub correlator: &'a EventCorrelator,
    pub event_type: EventType,
    pub event_name: String,
    pub execution_id: ExecutionId,
    pub payload: Option<Value>,
}

#[async_trait]
impl Command for DeliverEventCommand<'_> {
    type Output = SubscriptionId;

    fn name(&self) -> &'static str {
        "deliver_event"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<SubscriptionId> {
        self.correlator
            .deliver(
                ctx,
                self.event_type,
                &self.event_name,
                &self.execution_id,
                self.payload.clone(),
            )
            .await
    }
}

pub struct DeliverEventAsyncCommand<'a> {
    pub correlator: &'a EventCorrelator,
    pub event_type: EventType,
    pub event_name: String,
    pub execution_id: ExecutionId,
    pub payload: Option<Value>,
    pub retries: u32,
}

#[async_trait]
impl Command for DeliverEventAsyncCommand<'_> {
    type Output = JobId;

    fn name(&self) -> &'static str {
        "deliver_event_async"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<JobId> {
        self.correlator
            .deliver_async(
                ctx,
                self.event_type,
                &self.event_name,
                &self.execution_id,
                self.payload.clone(),
                self.retries,
            )
            .await
    }
}
