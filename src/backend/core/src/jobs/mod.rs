//! Job acquisition and execution.
//!
//! - **Job**: persisted deferred work with lock, retry and backoff state
//! - **Handlers**: what a job does, registered by `handler_type`
//! - **Executor**: commands that run, create, unlock and reset jobs
//! - **Strategies**: which due jobs a cycle locks and how long it idles
//! - **Acquisition**: one named polling loop shared by registered engines
//! - **Scheduler**: owns the acquisitions and their shared worker pool
//!
//! # Architecture
//!
//! ```text
//! JobScheduler
//!  ├── JobAcquisition "default" ──┐   lock batch (UnitOfWork)   ┌─────────────┐
//!  ├── JobAcquisition "batch"   ──┼───────────────────────────▶│ EngineStore │
//!  │                              │                             └─────────────┘
//!  └── WorkerPool ◀───────────────┘   one permit per locked job
//!        └── ExecuteJobCommand, each in its own UnitOfWork
//! ```

pub mod acquisition;
pub mod executor;
pub mod handler;
pub mod job;
pub mod scheduler;
pub mod strategy;
pub mod worker_pool;

pub use acquisition::{AcquisitionContext, AcquisitionState, AcquisitionStats, JobAcquisition};
pub use executor::{
    CreateJobCommand, ExecuteJobCommand, JobOutcome, RecordJobFailureCommand,
    SetJobRetriesCommand, UnlockJobCommand,
};
pub use handler::{
    AsyncContinuation, AsyncContinuationHandler, DelegateCall, DelegateJobHandler,
    EventDeliveryHandler, JobHandler, JobHandlerRegistry, ASYNC_CONTINUATION_HANDLER,
    DELEGATE_HANDLER, EVENT_DELIVERY_HANDLER,
};
pub use job::{BackoffStrategy, JobEntity, JobId, RetryPolicy};
pub use scheduler::JobScheduler;
pub use strategy::{
    AcquisitionStrategy, IdleBackoffStrategy, SequentialStrategy, StrategyRegistry,
    BACKOFF_STRATEGY, SEQUENTIAL_STRATEGY,
};
pub use worker_pool::{WorkerPermit, WorkerPool, WorkerPoolConfig, WorkerPoolStats};
