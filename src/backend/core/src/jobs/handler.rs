//! Job handlers: what a job does when it runs.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::JobEntity;
use crate::context::UnitOfWork;
use crate::engine::ProcessEngine;
use crate::error::{ConductorError, Result};
use crate::events::EventDelivery;
use crate::execution::{ExecutionId, ResumeTrigger};

pub const ASYNC_CONTINUATION_HANDLER: &str = "async-continuation";
pub const EVENT_DELIVERY_HANDLER: &str = "event-delivery";
pub const DELEGATE_HANDLER: &str = "delegate";

/// Executes jobs of one `handler_type`.
///
/// Runs inside the job's unit of work; an error fails the attempt and its
/// staged effects are discarded.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    async fn execute(&self, job: &JobEntity, ctx: &mut UnitOfWork, engine: &ProcessEngine) -> Result<()>;
}

/// Handlers addressable by `handler_type`.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(AsyncContinuationHandler));
        registry.register(Arc::new(EventDeliveryHandler));
        registry.register(Arc::new(DelegateJobHandler));
        registry
    }

    /// Add a handler, replacing one with the same type.
    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.handler_type().to_string(), handler);
    }

    pub fn get(&self, handler_type: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(handler_type)
            .map(|h| h.value().clone())
            .ok_or_else(|| ConductorError::handler_not_found(handler_type))
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    pub fn handler_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

fn owning_execution(job: &JobEntity) -> Result<&ExecutionId> {
    job.execution_id.as_ref().ok_or_else(|| {
        ConductorError::invalid_input(format!(
            "job {} of type '{}' has no owning execution",
            job.id, job.handler_type
        ))
    })
}

fn parse_configuration<T: for<'de> Deserialize<'de>>(job: &JobEntity) -> Result<T> {
    serde_json::from_value(job.configuration.clone()).map_err(|e| {
        ConductorError::invalid_input(format!(
            "invalid configuration for job {} of type '{}'",
            job.id, job.handler_type
        ))
        .with_source(e)
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Built-in Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration of an `async-continuation` job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsyncContinuation {
    #[serde(default)]
    pub activity_id: Option<String>,
}

/// Resumes the owning execution where it went asynchronous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncContinuationHandler;

#[async_trait]
impl JobHandler for AsyncContinuationHandler {
    fn handler_type(&self) -> &str {
        ASYNC_CONTINUATION_HANDLER
    }

    async fn execute(&self, job: &JobEntity, ctx: &mut UnitOfWork, engine: &ProcessEngine) -> Result<()> {
        let execution_id = owning_execution(job)?;
        let continuation: AsyncContinuation = if job.configuration.is_null() {
            AsyncContinuation::default()
        } else {
            parse_configuration(job)?
        };

        engine
            .runtime()
            .resume(
                ctx,
                execution_id,
                ResumeTrigger::AsyncContinuation {
                    activity_id: continuation.activity_id,
                },
                None,
            )
            .await
    }
}

/// Delivers an event scheduled with asynchronous delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventDeliveryHandler;

#[async_trait]
impl JobHandler for EventDeliveryHandler {
    fn handler_type(&self) -> &str {
        EVENT_DELIVERY_HANDLER
    }

    async fn execute(&self, job: &JobEntity, ctx: &mut UnitOfWork, engine: &ProcessEngine) -> Result<()> {
        let execution_id = owning_execution(job)?;
        let delivery: EventDelivery = parse_configuration(job)?;

        engine
            .correlator()
            .deliver(
                ctx,
                delivery.event_type,
                &delivery.event_name,
                execution_id,
                delivery.payload,
            )
            .await
            .map(|_| ())
    }
}

/// Configuration of a `delegate` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateCall {
    pub delegate: String,
    #[serde(default)]
    pub payload: Value,
}

/// Invokes a registered delegate through the delegate invocation boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelegateJobHandler;

#[async_trait]
impl JobHandler for DelegateJobHandler {
    fn handler_type(&self) -> &str {
        DELEGATE_HANDLER
    }

    async fn execute(&self, job: &JobEntity, ctx: &mut UnitOfWork, engine: &ProcessEngine) -> Result<()> {
        let execution_id = owning_execution(job)?;
        let call: DelegateCall = parse_configuration(job)?;
        let delegate = engine.delegates().get(&call.delegate)?;

        engine
            .invoker()
            .invoke(ctx, delegate, execution_id, call.payload, job.deployment_id.clone())
            .await
            .map(|_| ())
    }
}
