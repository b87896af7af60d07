//! Process engine facade.
//!
//! A [`ProcessEngine`] bundles one store with the command executor, job
//! handlers, runtime collaborator, delegates and deployments that operate on
//! it. API callers use its methods, each of which runs one command in its own
//! unit of work. Acquisitions execute jobs through the same path.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::context::{Command, CommandExecutor, CommitOutcome, UnitOfWork};
use crate::delegate::{
    Delegate, DelegateInterceptor, DelegateInvoker, DelegateRegistry, DeploymentHandle,
    DeploymentRegistry,
};
use crate::error::{ConductorError, Result};
use crate::events::{
    DeliverEventAsyncCommand, DeliverEventCommand, EventCorrelator, EventSubscription, EventType,
    SubscribeCommand, SubscriptionId,
};
use crate::execution::{
    CreateExecutionCommand, DeleteProcessInstanceCommand, ExecutionId, ExecutionNode,
    ExecutionRuntime, RecordingRuntime,
};
use crate::jobs::{
    AcquisitionContext, CreateJobCommand, ExecuteJobCommand, JobEntity, JobHandler,
    JobHandlerRegistry, JobId, JobOutcome, RecordJobFailureCommand, RetryPolicy,
    SetJobRetriesCommand,
};
use crate::persistence::{EngineStore, InMemoryStore};

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ProcessEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn EngineStore>>,
    runtime: Option<Arc<dyn ExecutionRuntime>>,
    handlers: Vec<Arc<dyn JobHandler>>,
    delegates: Vec<Arc<dyn Delegate>>,
    deployments: Vec<DeploymentHandle>,
    interceptors: Vec<Arc<dyn DelegateInterceptor>>,
}

impl ProcessEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            runtime: None,
            handlers: Vec::new(),
            delegates: Vec::new(),
            deployments: Vec::new(),
            interceptors: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EngineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ExecutionRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Register a job handler, replacing a built-in of the same type.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.delegates.push(delegate);
        self
    }

    pub fn with_deployment(mut self, deployment: DeploymentHandle) -> Self {
        self.deployments.push(deployment);
        self
    }

    /// Add a delegate interceptor after the deployment context switch.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn DelegateInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Build the engine. Without a store or runtime, an in-memory store and a
    /// recording runtime are used.
    pub fn build(self) -> Result<Arc<ProcessEngine>> {
        if self.config.name.trim().is_empty() {
            return Err(ConductorError::invalid_configuration("engine name must not be empty"));
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn EngineStore>);
        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(RecordingRuntime::new()) as Arc<dyn ExecutionRuntime>);

        let handlers = JobHandlerRegistry::with_defaults();
        for handler in self.handlers {
            handlers.register(handler);
        }

        let delegates = DelegateRegistry::new();
        for delegate in self.delegates {
            delegates.register(delegate);
        }

        let deployments = Arc::new(DeploymentRegistry::new());
        for deployment in self.deployments {
            deployments.register(deployment);
        }

        let invoker = self
            .interceptors
            .into_iter()
            .fold(DelegateInvoker::new(deployments.clone()), |invoker, i| {
                invoker.with_interceptor(i)
            });

        info!(
            engine = %self.config.name,
            handlers = ?handlers.handler_types(),
            delegates = delegates.len(),
            deployments = deployments.len(),
            "Process engine built"
        );

        Ok(Arc::new(ProcessEngine {
            name: self.config.name.clone(),
            executor: CommandExecutor::new(store.clone()),
            correlator: EventCorrelator::new(runtime.clone()),
            config: self.config,
            store,
            handlers,
            runtime,
            delegates,
            deployments,
            invoker,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ProcessEngine {
    name: String,
    config: EngineConfig,
    store: Arc<dyn EngineStore>,
    executor: CommandExecutor,
    handlers: JobHandlerRegistry,
    runtime: Arc<dyn ExecutionRuntime>,
    delegates: DelegateRegistry,
    deployments: Arc<DeploymentRegistry>,
    invoker: DelegateInvoker,
    correlator: EventCorrelator,
}

impl fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("name", &self.name)
            .field("handlers", &self.handlers.handler_types())
            .finish()
    }
}

impl ProcessEngine {
    /// Builder for an engine called `name` with default settings.
    pub fn builder(name: impl Into<String>) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(EngineConfig {
            name: name.into(),
            ..Default::default()
        })
    }

    pub fn from_config(config: EngineConfig) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(config)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn handlers(&self) -> &JobHandlerRegistry {
        &self.handlers
    }

    pub fn runtime(&self) -> &Arc<dyn ExecutionRuntime> {
        &self.runtime
    }

    pub fn delegates(&self) -> &DelegateRegistry {
        &self.delegates
    }

    pub fn deployments(&self) -> &Arc<DeploymentRegistry> {
        &self.deployments
    }

    pub fn invoker(&self) -> &DelegateInvoker {
        &self.invoker
    }

    pub fn correlator(&self) -> &EventCorrelator {
        &self.correlator
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Jobs
    // ─────────────────────────────────────────────────────────────────────────

    /// A new job carrying this engine's initial retries.
    pub fn new_job(&self, handler_type: impl Into<String>) -> JobEntity {
        JobEntity::new(handler_type).with_retries(self.config.retry.retries)
    }

    pub async fn create_job(&self, job: JobEntity) -> Result<JobId> {
        self.executor.execute(&CreateJobCommand { job }).await
    }

    /// Execute a job now, whoever holds its lock.
    ///
    /// A failing handler still commits the failure record; the failure is then
    /// returned as [`crate::error::ErrorCode::JobExecutionFailed`].
    pub async fn execute_job(&self, job_id: JobId) -> Result<()> {
        let outcome = self
            .run_job(self.executor.open(), job_id, None)
            .await?
            .into_result()?;

        match outcome {
            JobOutcome::Failed { error, .. } => {
                Err(ConductorError::job_execution_failed(job_id, error.failure_detail()).with_source(error))
            }
            JobOutcome::Executed { .. } | JobOutcome::Skipped => Ok(()),
        }
    }

    /// Execute a job locked by `acquisition`; skipped if the lock moved on.
    ///
    /// If the execution does not commit and the job is no longer locked by the
    /// acquisition, the error is [`crate::error::ErrorCode::JobLockLost`].
    pub(crate) async fn execute_acquired_job(
        &self,
        job_id: JobId,
        acquisition: &Arc<AcquisitionContext>,
    ) -> Result<JobOutcome> {
        let ctx = self.executor.open().with_acquisition(acquisition);
        match self.run_job(ctx, job_id, Some(acquisition.lock_owner.as_str())).await? {
            CommitOutcome::ListenerFailed { output, error } => {
                warn!(
                    job_id = %job_id,
                    acquisition = %acquisition.name,
                    error = %error,
                    "Job committed but a commit listener failed"
                );
                Ok(output)
            }
            commit => commit.into_result(),
        }
    }

    /// Run one job in `ctx`.
    ///
    /// When the execution's commit fails, its effects are gone and the failed
    /// attempt is recorded in a fresh unit of work instead, so a job whose
    /// effects keep failing to commit still runs out of retries. The result is
    /// then a committed [`JobOutcome::Failed`].
    async fn run_job(
        &self,
        ctx: UnitOfWork,
        job_id: JobId,
        lock_owner: Option<&str>,
    ) -> Result<CommitOutcome<JobOutcome>> {
        let command = ExecuteJobCommand {
            engine: self,
            job_id,
            require_exists: lock_owner.is_none(),
        };
        let (output, commit_error) = match self.executor.execute_with_commit(ctx, &command).await? {
            CommitOutcome::NotCommitted { output, error } => (output, error),
            commit => return Ok(commit),
        };

        warn!(job_id = %job_id, error = %commit_error, "Job execution did not commit");
        let cause = match output {
            JobOutcome::Skipped => return Err(commit_error),
            JobOutcome::Failed { error, .. } => error,
            JobOutcome::Executed { .. } => commit_error,
        };

        let recorded = self
            .executor
            .execute(&RecordJobFailureCommand {
                engine: self,
                job_id,
                lock_owner,
                error: &cause,
            })
            .await?;

        match (recorded, lock_owner) {
            (Some(retries_left), _) => Ok(CommitOutcome::Committed(JobOutcome::Failed {
                retries_left,
                error: cause,
            })),
            (None, Some(owner)) => Err(ConductorError::job_lock_lost(job_id, owner).with_source(cause)),
            (None, None) => Err(cause),
        }
    }

    /// Set the remaining retries of a job; negative values clamp to zero.
    pub async fn set_job_retries(&self, job_id: JobId, retries: i32) -> Result<JobEntity> {
        self.executor
            .execute(&SetJobRetriesCommand { job_id, retries })
            .await
    }

    pub async fn find_job(&self, job_id: JobId) -> Result<Option<JobEntity>> {
        self.store.find_job(job_id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobEntity>> {
        self.store.list_jobs().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn subscribe(&self, subscription: EventSubscription) -> Result<SubscriptionId> {
        self.executor
            .execute(&SubscribeCommand {
                correlator: &self.correlator,
                subscription,
            })
            .await
    }

    /// Deliver an event and resume the waiting execution.
    pub async fn deliver_event(
        &self,
        event_type: EventType,
        event_name: &str,
        execution_id: &ExecutionId,
        payload: Option<Value>,
    ) -> Result<SubscriptionId> {
        self.executor
            .execute(&DeliverEventCommand {
                correlator: &self.correlator,
                event_type,
                event_name: event_name.to_string(),
                execution_id: execution_id.clone(),
                payload,
            })
            .await
    }

    /// Schedule delivery of an event as a job.
    pub async fn deliver_event_async(
        &self,
        event_type: EventType,
        event_name: &str,
        execution_id: &ExecutionId,
        payload: Option<Value>,
    ) -> Result<JobId> {
        self.executor
            .execute(&DeliverEventAsyncCommand {
                correlator: &self.correlator,
                event_type,
                event_name: event_name.to_string(),
                execution_id: execution_id.clone(),
                payload,
                retries: self.config.retry.retries,
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Executions
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn create_execution(&self, node: ExecutionNode) -> Result<ExecutionId> {
        self.executor.execute(&CreateExecutionCommand { node }).await
    }

    /// Delete a process instance tree; returns the deleted execution ids in deletion order.
    pub async fn delete_process_instance(&self, process_instance_id: &ExecutionId) -> Result<Vec<ExecutionId>> {
        self.executor
            .execute(&DeleteProcessInstanceCommand {
                process_instance_id: process_instance_id.clone(),
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delegates
    // ─────────────────────────────────────────────────────────────────────────

    /// Invoke a registered delegate in its own unit of work.
    pub async fn invoke_delegate(
        &self,
        delegate: &str,
        execution_id: &ExecutionId,
        payload: Value,
    ) -> Result<Value> {
        self.executor
            .execute(&InvokeDelegateCommand {
                engine: self,
                delegate: delegate.to_string(),
                execution_id: execution_id.clone(),
                payload,
            })
            .await
    }
}

struct InvokeDelegateCommand<'a> {
    engine: &'a ProcessEngine,
    delegate: String,
    execution_id: ExecutionId,
    payload: Value,
}

#[async_trait]
impl Command for InvokeDelegateCommand<'_> {
    type Output = Value;

    fn name(&self) -> &'static str {
        "invoke_delegate"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<Value> {
        let delegate = self.engine.delegates.get(&self.delegate)?;
        self.engine
            .invoker
            .invoke(ctx, delegate, &self.execution_id, self.payload.clone(), None)
            .await
    }
}
