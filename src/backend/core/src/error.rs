//! Error handling for Conductor Core.
//!
//! This module provides:
//! - A single error type with a stable, machine-readable error code
//! - Classification into client errors, job failures, lock conflicts and fatal errors
//! - User-facing messages kept apart from internal detail
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use conductor_core::error::{ConductorError, Result, ErrorContext};
//!
//! fn load_job(store: &Store, id: JobId) -> Result<JobEntity> {
//!     store.get(id).with_error_code(ErrorCode::JobNotFound)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Conductor operations.
pub type Result<T> = std::result::Result<T, ConductorError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Unit of Work Errors (1000-1099)
    UnitOfWorkFailed,
    ListenerFailed,
    InvalidStateTransition,

    // Job Errors (1100-1199)
    JobNotFound,
    JobExecutionFailed,
    JobLockLost,
    JobRejected,
    HandlerNotFound,
    AcquisitionNotFound,

    // Event Errors (1200-1299)
    SubscriptionNotFound,
    DuplicateSubscription,

    // Execution Errors (1300-1399)
    ExecutionNotFound,
    CascadeCycleDetected,

    // Delegate Errors (1400-1499)
    DeploymentNotFound,
    DelegateNotFound,
    DelegateFailed,

    // Persistence Errors (2000-2099)
    OptimisticLockConflict,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    Unavailable,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::UnitOfWorkFailed => 1000,
            Self::ListenerFailed => 1002,
            Self::InvalidStateTransition => 1003,

            Self::JobNotFound => 1100,
            Self::JobExecutionFailed => 1101,
            Self::JobLockLost => 1102,
            Self::JobRejected => 1103,
            Self::HandlerNotFound => 1104,
            Self::AcquisitionNotFound => 1105,

            Self::SubscriptionNotFound => 1200,
            Self::DuplicateSubscription => 1201,

            Self::ExecutionNotFound => 1300,
            Self::CascadeCycleDetected => 1301,

            Self::DeploymentNotFound => 1400,
            Self::DelegateNotFound => 1401,
            Self::DelegateFailed => 1402,

            Self::OptimisticLockConflict => 2001,
            Self::DuplicateRecord => 2002,

            Self::SerializationError => 2200,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
            Self::Unavailable => 9002,
            Self::UnknownError => 9099,
        }
    }

    /// Invalid input to a public operation. Reported immediately, never retried.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound
                | Self::HandlerNotFound
                | Self::AcquisitionNotFound
                | Self::SubscriptionNotFound
                | Self::DuplicateSubscription
                | Self::ExecutionNotFound
                | Self::DeploymentNotFound
                | Self::DelegateNotFound
                | Self::ValidationError
                | Self::InvalidInput
                | Self::InvalidStateTransition
        )
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OptimisticLockConflict | Self::JobRejected | Self::Unavailable
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "unit_of_work",
            1100..=1199 => "job",
            1200..=1299 => "event",
            1300..=1399 => "execution",
            1400..=1499 => "delegate",
            2000..=2099 => "persistence",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Client errors (bad input, unknown ids)
    Low,
    /// Operational issues (lock conflicts, failing jobs, timeouts)
    Medium,
    /// System errors (persistence failures, broken configuration)
    High,
    /// Errors that stop the engine from making progress
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::HandlerNotFound
            | ErrorCode::AcquisitionNotFound
            | ErrorCode::SubscriptionNotFound
            | ErrorCode::DuplicateSubscription
            | ErrorCode::ExecutionNotFound
            | ErrorCode::DeploymentNotFound
            | ErrorCode::DelegateNotFound
            | ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::InvalidStateTransition
            | ErrorCode::DuplicateRecord => Self::Low,

            ErrorCode::JobExecutionFailed
            | ErrorCode::DelegateFailed
            | ErrorCode::JobLockLost
            | ErrorCode::JobRejected
            | ErrorCode::OptimisticLockConflict
            | ErrorCode::ListenerFailed => Self::Medium,

            ErrorCode::SerializationError
            | ErrorCode::CascadeCycleDetected
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration
            | ErrorCode::Unavailable => Self::High,

            ErrorCode::UnitOfWorkFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, execution, subscription, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry hint in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, millis: u64) -> Self {
        self.retry_after_ms = Some(millis);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Conductor Core.
///
/// This error type supports:
/// - Structured error codes
/// - Error chaining with context
/// - User-facing vs internal messages
/// - Metrics integration
#[derive(Error, Debug)]
pub struct ConductorError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-facing error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ConductorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ConductorError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error for an arbitrary entity.
    pub fn not_found(code: ErrorCode, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(code, format!("{} not found: {}", entity_type, entity_id))
            .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this is a client error.
    pub fn is_client_error(&self) -> bool {
        self.code.is_client_error()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Render the error and its source chain as a single failure detail line.
    pub fn failure_detail(&self) -> String {
        let mut detail = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            detail.push_str(": ");
            detail.push_str(&cause.to_string());
            source = cause.source();
        }
        detail
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "conductor_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the error with an internal error carrying a message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error with a specific error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let message = message.into();
            ConductorError::with_internal(ErrorCode::InternalError, message.clone(), e.to_string())
                .with_source(e)
        })
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| ConductorError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ConductorError::internal(message))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| ConductorError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<std::io::Error> for ConductorError {
    fn from(error: std::io::Error) -> Self {
        ConductorError::with_internal(ErrorCode::InternalError, "I/O error", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::sync::AcquireError> for ConductorError {
    fn from(error: tokio::sync::AcquireError) -> Self {
        ConductorError::with_internal(
            ErrorCode::Unavailable,
            "Worker pool is closed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<anyhow::Error> for ConductorError {
    fn from(error: anyhow::Error) -> Self {
        ConductorError::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            format!("{:#}", error),
        )
    }
}

impl From<config::ConfigError> for ConductorError {
    fn from(error: config::ConfigError) -> Self {
        ConductorError::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to load configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl ConductorError {
    // ─────────────────────────────────────────────────────────────────────────
    // Unit of Work Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// A unit of work could not run at all, e.g. an acquisition cycle's.
    pub fn unit_of_work_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnitOfWorkFailed, message.into())
    }

    /// A transaction listener failed.
    pub fn listener_failed(listener: impl Into<String>, reason: impl Into<String>) -> Self {
        let listener = listener.into();
        Self::new(
            ErrorCode::ListenerFailed,
            format!("Transaction listener '{}' failed: {}", listener, reason.into()),
        )
        .with_context("listener", &listener)
    }

    /// A state machine refused a transition.
    pub fn invalid_state_transition(
        entity: impl Into<String>,
        from: impl fmt::Debug,
        to: impl fmt::Debug,
    ) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid state transition for {}: {:?} -> {:?}", entity.into(), from, to),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Job Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a job not found error.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        Self::not_found(ErrorCode::JobNotFound, "job", job_id.to_string())
    }

    /// Create a job execution failed error.
    pub fn job_execution_failed(job_id: impl fmt::Display, reason: impl Into<String>) -> Self {
        let job_id = job_id.to_string();
        Self::new(
            ErrorCode::JobExecutionFailed,
            format!("Job {} failed: {}", job_id, reason.into()),
        )
        .with_details(ErrorDetails::new().with_entity("job", &job_id))
    }

    /// The job's lock was taken over or the job vanished while it was executing.
    pub fn job_lock_lost(job_id: impl fmt::Display, owner: impl Into<String>) -> Self {
        let job_id = job_id.to_string();
        Self::new(
            ErrorCode::JobLockLost,
            format!("Lock on job {} is no longer held by {}", job_id, owner.into()),
        )
        .with_details(ErrorDetails::new().with_entity("job", &job_id))
    }

    /// No handler registered for a job's handler type.
    pub fn handler_not_found(handler_type: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::HandlerNotFound, "job handler", handler_type)
    }

    /// No acquisition with this name.
    pub fn acquisition_not_found(name: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::AcquisitionNotFound, "job acquisition", name)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// No subscription matches the correlation key.
    pub fn subscription_not_found(
        event_type: impl fmt::Display,
        event_name: impl Into<String>,
        execution_id: impl fmt::Display,
    ) -> Self {
        let event_name = event_name.into();
        Self::new(
            ErrorCode::SubscriptionNotFound,
            format!(
                "No {} subscription '{}' found for execution {}",
                event_type, event_name, execution_id
            ),
        )
        .with_context("event_name", &event_name)
        .with_context("execution_id", execution_id.to_string())
    }

    /// A subscription with the same correlation key already exists.
    pub fn duplicate_subscription(
        event_type: impl fmt::Display,
        event_name: impl Into<String>,
        execution_id: impl fmt::Display,
    ) -> Self {
        let event_name = event_name.into();
        Self::new(
            ErrorCode::DuplicateSubscription,
            format!(
                "Execution {} already subscribes to {} '{}'",
                execution_id, event_type, event_name
            ),
        )
        .with_context("event_name", &event_name)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an execution not found error.
    pub fn execution_not_found(execution_id: impl fmt::Display) -> Self {
        Self::not_found(ErrorCode::ExecutionNotFound, "execution", execution_id.to_string())
    }

    /// The execution tree refers back to an execution already visited.
    pub fn cascade_cycle(execution_id: impl fmt::Display) -> Self {
        let execution_id = execution_id.to_string();
        Self::new(
            ErrorCode::CascadeCycleDetected,
            format!("Execution tree contains a cycle at {}", execution_id),
        )
        .with_details(ErrorDetails::new().with_entity("execution", &execution_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delegate Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a deployment not found error.
    pub fn deployment_not_found(deployment_id: impl fmt::Display) -> Self {
        Self::not_found(ErrorCode::DeploymentNotFound, "deployment", deployment_id.to_string())
    }

    /// Create a delegate not found error.
    pub fn delegate_not_found(name: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::DelegateNotFound, "delegate", name)
    }

    /// User code raised an error.
    pub fn delegate_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::DelegateFailed,
            format!("Delegate '{}' failed: {}", name, reason.into()),
        )
        .with_details(ErrorDetails::new().with_entity("delegate", &name))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Revision check failed while flushing.
    pub fn optimistic_lock(entity_type: impl Into<String>, entity_id: impl fmt::Display) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.to_string();
        Self::new(
            ErrorCode::OptimisticLockConflict,
            format!("{} {} was updated by another unit of work", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// A value could not be written as JSON.
    pub fn serialization(error: serde_json::Error) -> Self {
        Self::with_internal(ErrorCode::SerializationError, "JSON serialization failed", error.to_string())
            .with_source(error)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_classification() {
        assert!(ErrorCode::SubscriptionNotFound.is_client_error());
        assert!(ErrorCode::ExecutionNotFound.is_client_error());
        assert!(!ErrorCode::JobExecutionFailed.is_client_error());
        assert!(!ErrorCode::OptimisticLockConflict.is_client_error());
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::OptimisticLockConflict.is_retryable());
        assert!(ErrorCode::JobRejected.is_retryable());
        assert!(!ErrorCode::SubscriptionNotFound.is_retryable());
        assert!(!ErrorCode::InvalidConfiguration.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::UnitOfWorkFailed.category(), "unit_of_work");
        assert_eq!(ErrorCode::JobLockLost.category(), "job");
        assert_eq!(ErrorCode::DuplicateSubscription.category(), "event");
        assert_eq!(ErrorCode::CascadeCycleDetected.category(), "execution");
        assert_eq!(ErrorCode::DelegateFailed.category(), "delegate");
        assert_eq!(ErrorCode::OptimisticLockConflict.category(), "persistence");
    }

    #[test]
    fn test_error_creation() {
        let error = ConductorError::job_not_found("job-1");
        assert_eq!(error.code(), ErrorCode::JobNotFound);
        assert!(error.is_client_error());
        assert_eq!(error.details().entity_id.as_deref(), Some("job-1"));
    }

    #[test]
    fn test_error_context() {
        let error = ConductorError::new(ErrorCode::InvalidInput, "bad batch size")
            .with_context("field", "max_jobs_per_acquisition")
            .with_context("value", 0);

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("value"));
    }

    #[test]
    fn test_error_details_builder() {
        let details = ErrorDetails::new()
            .with_entity("job", "abc-123")
            .with_retry_after(500)
            .with_suggestion("Reset the job retries")
            .with_context("extra", "info");

        assert_eq!(details.entity_type, Some("job".to_string()));
        assert_eq!(details.entity_id, Some("abc-123".to_string()));
        assert_eq!(details.retry_after_ms, Some(500));
        assert!(details.suggested_action.is_some());
        assert!(details.context.contains_key("extra"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::SubscriptionNotFound),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::JobExecutionFailed),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::SerializationError),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::UnitOfWorkFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = ConductorError::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to load configuration",
            "missing field `engine`",
        );

        let display = format!("{}", error);
        assert!(display.contains("ConfigurationError"));
        assert!(display.contains("Failed to load configuration"));
        assert!(display.contains("missing field `engine`"));
    }

    #[tokio::test]
    async fn test_closed_semaphore_is_unavailable() {
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(1));
        semaphore.close();

        let error: ConductorError = semaphore.acquire_owned().await.unwrap_err().into();
        assert_eq!(error.code(), ErrorCode::Unavailable);
        assert!(error.code().is_retryable());
    }

    #[test]
    fn test_serialization_error() {
        struct Opaque;
        impl Serialize for Opaque {
            fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("no JSON form"))
            }
        }
        let error = ConductorError::serialization(serde_json::to_value(Opaque).unwrap_err());
        assert_eq!(error.code(), ErrorCode::SerializationError);
        assert!(error.failure_detail().contains("no JSON form"));
    }

    #[test]
    fn test_failure_detail_includes_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let error = ConductorError::delegate_failed("charge-card", "write failed").with_source(io);
        let detail = error.failure_detail();
        assert!(detail.contains("charge-card"));
        assert!(detail.contains("disk full"));
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.with_error_code(ErrorCode::JobNotFound).unwrap_err();
        assert_eq!(error.code(), ErrorCode::JobNotFound);
    }
}
