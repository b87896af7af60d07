#![allow(clippy::result_large_err)]
//! # Conductor Core
//!
//! Transactional execution and job scheduling core for long-running business processes.
//!
//! ## Architecture
//!
//! - **Context**: Units of work, transaction listeners and the command executor
//! - **Jobs**: Job acquisition, locking, retries with backoff and the shared worker pool
//! - **Delegate**: Invocation boundary that runs user code inside its deployment
//! - **Events**: Event subscriptions and correlation to waiting executions
//! - **Execution**: Execution trees, cascade deletion and the runtime collaborator
//! - **Persistence**: Store boundary with all-or-nothing flushes and an in-memory store
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod config;
pub mod context;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod jobs;
pub mod persistence;
pub mod telemetry;

pub use error::{ConductorError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{AcquisitionConfig, Config, EngineConfig, SchedulerConfig};
    pub use crate::context::{Command, CommandExecutor, TransactionListener, TransactionOutcome, UnitOfWork};
    pub use crate::delegate::{Delegate, DelegateInterceptor, DeploymentHandle, DeploymentId};
    pub use crate::engine::{ProcessEngine, ProcessEngineBuilder};
    pub use crate::error::{ConductorError, ErrorCode, ErrorContext, Result};
    pub use crate::events::{EventSubscription, EventType, SubscriptionId};
    pub use crate::execution::{ExecutionId, ExecutionNode, ExecutionRuntime, RecordingRuntime, ResumeTrigger};
    pub use crate::jobs::{
        AcquisitionState, AcquisitionStrategy, BackoffStrategy, JobEntity, JobHandler, JobId,
        JobScheduler, RetryPolicy, StrategyRegistry,
    };
    pub use crate::persistence::{EngineStore, InMemoryStore};
    pub use crate::telemetry::{init_telemetry, TelemetryConfig};
}
