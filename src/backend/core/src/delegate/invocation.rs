//! Delegate invocation boundary.
//!
//! Every call into user code goes through a [`DelegateInvoker`], which runs an
//! ordered chain of [`DelegateInterceptor`]s around the call. The first
//! interceptor is always the [`ContextSwitchInterceptor`]: when the delegate
//! belongs to a deployment other than the one currently active on the unit of
//! work, it enters that deployment for the duration of the call and leaves it
//! afterwards, also when the delegate fails or panics.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, debug_span, warn, Instrument};

use super::{DeploymentId, DeploymentRegistry};
use crate::context::UnitOfWork;
use crate::error::{ConductorError, Result};
use crate::execution::ExecutionId;

// ═══════════════════════════════════════════════════════════════════════════════
// Delegates
// ═══════════════════════════════════════════════════════════════════════════════

/// User-supplied business logic.
#[async_trait]
pub trait Delegate: Send + Sync {
    fn name(&self) -> &str;

    /// Deployment the delegate belongs to. `None` runs in the caller's context.
    fn deployment(&self) -> Option<&DeploymentId> {
        None
    }

    async fn invoke(
        &self,
        ctx: &mut UnitOfWork,
        execution_id: &ExecutionId,
        payload: &Value,
    ) -> Result<Value>;
}

/// Delegates addressable by name.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: DashMap<String, Arc<dyn Delegate>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, delegate: Arc<dyn Delegate>) {
        debug!(delegate = %delegate.name(), "Delegate registered");
        self.delegates.insert(delegate.name().to_string(), delegate);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Delegate>> {
        self.delegates
            .get(name)
            .map(|d| d.value().clone())
            .ok_or_else(|| ConductorError::delegate_not_found(name))
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Interceptor Chain
// ═══════════════════════════════════════════════════════════════════════════════

/// One call into a delegate, as seen by interceptors.
pub struct DelegateInvocation<'a> {
    pub ctx: &'a mut UnitOfWork,
    pub delegate: Arc<dyn Delegate>,
    pub execution_id: ExecutionId,
    pub payload: Value,
    /// Deployment the call must run in
    pub target_deployment: Option<DeploymentId>,
}

impl DelegateInvocation<'_> {
    /// Call the delegate itself.
    pub async fn proceed(&mut self) -> Result<Value> {
        let delegate = self.delegate.clone();
        delegate
            .invoke(self.ctx, &self.execution_id, &self.payload)
            .await
    }
}

/// Middleware wrapped around a delegate call.
#[async_trait]
pub trait DelegateInterceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Handle the invocation, normally by calling `next.run(invocation)`.
    async fn around(&self, invocation: &mut DelegateInvocation<'_>, next: Next<'_>) -> Result<Value>;
}

/// The rest of the interceptor chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn DelegateInterceptor>],
}

impl<'a> Next<'a> {
    pub fn run<'b, 'c>(self, invocation: &'b mut DelegateInvocation<'c>) -> BoxFuture<'b, Result<Value>>
    where
        'a: 'b,
        'c: 'b,
    {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((head, rest)) => head.around(invocation, Next { chain: rest }).await,
                None => invocation.proceed().await,
            }
        })
    }
}

/// Enters the delegate's deployment when it differs from the active one.
pub struct ContextSwitchInterceptor {
    deployments: Arc<DeploymentRegistry>,
}

impl ContextSwitchInterceptor {
    pub fn new(deployments: Arc<DeploymentRegistry>) -> Self {
        Self { deployments }
    }
}

#[async_trait]
impl DelegateInterceptor for ContextSwitchInterceptor {
    fn name(&self) -> &str {
        "context-switch"
    }

    async fn around(&self, invocation: &mut DelegateInvocation<'_>, next: Next<'_>) -> Result<Value> {
        let Some(target) = invocation.target_deployment.clone() else {
            return next.run(invocation).await;
        };

        let already_active = invocation
            .ctx
            .current_deployment()
            .map_or(false, |active| active.id == target);
        if already_active {
            return next.run(invocation).await;
        }

        let handle = self.deployments.resolve(&target)?;
        let span = debug_span!(
            "deployment_context",
            deployment = %target,
            delegate = %invocation.delegate.name(),
        );

        invocation.ctx.push_deployment(handle);
        let outcome = AssertUnwindSafe(next.run(invocation).instrument(span))
            .catch_unwind()
            .await;
        invocation.ctx.pop_deployment();

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Logs slow and failing delegate calls.
pub struct TimingInterceptor {
    slow_threshold_ms: u64,
}

impl TimingInterceptor {
    pub fn new(slow_threshold_ms: u64) -> Self {
        Self { slow_threshold_ms }
    }
}

#[async_trait]
impl DelegateInterceptor for TimingInterceptor {
    fn name(&self) -> &str {
        "timing"
    }

    async fn around(&self, invocation: &mut DelegateInvocation<'_>, next: Next<'_>) -> Result<Value> {
        let start = Instant::now();
        let result = next.run(invocation).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if let Err(e) = &result {
            warn!(
                delegate = %invocation.delegate.name(),
                execution_id = %invocation.execution_id,
                error = %e,
                "Delegate failed"
            );
        } else if elapsed_ms >= self.slow_threshold_ms {
            warn!(
                delegate = %invocation.delegate.name(),
                execution_id = %invocation.execution_id,
                elapsed_ms,
                "Slow delegate call"
            );
        }
        result
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invoker
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs delegates through the interceptor chain.
#[derive(Clone)]
pub struct DelegateInvoker {
    interceptors: Vec<Arc<dyn DelegateInterceptor>>,
}

impl DelegateInvoker {
    /// Invoker whose chain starts with the deployment context switch.
    pub fn new(deployments: Arc<DeploymentRegistry>) -> Self {
        Self {
            interceptors: vec![Arc::new(ContextSwitchInterceptor::new(deployments))],
        }
    }

    /// Append an interceptor; it runs inside the ones added before it.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn DelegateInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptor_names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Invoke `delegate` for `execution_id` inside `ctx`.
    ///
    /// `target` overrides the deployment the delegate declares.
    pub async fn invoke(
        &self,
        ctx: &mut UnitOfWork,
        delegate: Arc<dyn Delegate>,
        execution_id: &ExecutionId,
        payload: Value,
        target: Option<DeploymentId>,
    ) -> Result<Value> {
        let target_deployment = target.or_else(|| delegate.deployment().cloned());
        debug!(
            delegate = %delegate.name(),
            execution_id = %execution_id,
            deployment = ?target_deployment,
            "Invoking delegate"
        );

        let mut invocation = DelegateInvocation {
            ctx,
            delegate,
            execution_id: execution_id.clone(),
            payload,
            target_deployment,
        };
        Next {
            chain: &self.interceptors,
        }
        .run(&mut invocation)
        .await
    }
}
