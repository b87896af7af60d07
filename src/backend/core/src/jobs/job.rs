//! Job records and retry behavior.
//!
//! - **JobEntity**: persisted unit of deferred work, with lock and retry state
//! - **BackoffStrategy**: how far a failed job's due date is pushed forward
//! - **RetryPolicy**: initial retries and backoff applied to new jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::execution::ExecutionId;
use crate::delegate::DeploymentId;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Entity
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted unit of deferred work.
///
/// Lifecycle: created, locked by an acquisition cycle, then either deleted after a
/// successful execution or rescheduled with one retry fewer. A job with zero
/// retries is a terminal failure that stays visible until its retries are reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: JobId,
    /// Registered handler that executes this job
    pub handler_type: String,
    /// Handler-specific configuration
    #[serde(default)]
    pub configuration: serde_json::Value,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ExecutionId>,
    pub deployment_id: Option<DeploymentId>,
    /// Not acquirable before this instant; `None` means immediately
    pub due_date: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub retries: u32,
    /// Number of failed executions since creation or the last retries reset
    #[serde(default)]
    pub failed_attempts: u32,
    /// Detail of the last failure
    pub exception_message: Option<String>,
    /// Higher runs first under priority-ordered strategies
    #[serde(default)]
    pub priority: i64,
    /// Optimistic locking counter, bumped on every persisted change
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub suspended: bool,
}

impl JobEntity {
    /// Create an unlocked job that is due immediately.
    pub fn new(handler_type: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            handler_type: handler_type.into(),
            configuration: serde_json::Value::Null,
            execution_id: None,
            process_instance_id: None,
            deployment_id: None,
            due_date: None,
            lock_owner: None,
            lock_expiration_time: None,
            retries: RetryPolicy::default().retries,
            failed_attempts: 0,
            exception_message: None,
            priority: 0,
            revision: 0,
            created_at: Utc::now(),
            suspended: false,
        }
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<ExecutionId>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_process_instance(mut self, process_instance_id: impl Into<ExecutionId>) -> Self {
        self.process_instance_id = Some(process_instance_id.into());
        self
    }

    pub fn with_deployment(mut self, deployment_id: impl Into<DeploymentId>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspended = true;
        self
    }

    /// Whether an acquisition cycle may lock this job at `now`.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended
            && self.retries > 0
            && self.due_date.map_or(true, |due| due <= now)
            && !self.is_locked(now)
    }

    /// Whether a lock is held and has not expired yet.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expires)) => expires > now,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Whether the job is locked by `owner`.
    pub fn is_locked_by(&self, owner: &str) -> bool {
        self.lock_owner.as_deref() == Some(owner)
    }

    /// A lock owner without an expiration, or a failed job that still carries a lock.
    pub fn is_in_inconsistent_lock_state(&self) -> bool {
        (self.lock_owner.is_some() && self.lock_expiration_time.is_none())
            || (self.retries == 0 && (self.lock_owner.is_some() || self.lock_expiration_time.is_some()))
    }

    /// Whether the job ran out of retries.
    pub fn is_failed(&self) -> bool {
        self.retries == 0
    }

    pub fn lock(&mut self, owner: impl Into<String>, expires_at: DateTime<Utc>) {
        self.lock_owner = Some(owner.into());
        self.lock_expiration_time = Some(expires_at);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    /// Record a failed execution: one retry fewer, due date pushed back, lock released.
    pub fn record_failure(
        &mut self,
        message: &str,
        backoff: &BackoffStrategy,
        now: DateTime<Utc>,
        max_message_length: usize,
    ) {
        let delay = backoff.delay_for_attempt(self.failed_attempts);
        self.retries = self.retries.saturating_sub(1);
        self.failed_attempts += 1;
        self.exception_message = Some(truncate_message(message, max_message_length));
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.due_date = Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
        self.unlock();
    }

    /// Set the retries; raising them from zero clears the failure.
    pub fn set_retries(&mut self, retries: i32) {
        let retries = retries.max(0) as u32;
        if self.retries == 0 && retries > 0 {
            self.exception_message = None;
            self.failed_attempts = 0;
            self.unlock();
        }
        self.retries = retries;
    }
}

fn truncate_message(message: &str, max_length: usize) -> String {
    if message.chars().count() <= max_length {
        message.to_string()
    } else {
        message.chars().take(max_length).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        delay_millis: u64,
    },
    /// Linear increase in delay (initial + increment * attempt)
    Linear {
        initial_delay_millis: u64,
        increment_millis: u64,
    },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        initial_delay_millis: u64,
        max_delay_millis: u64,
        multiplier: f64,
    },
    /// Exponential with random jitter
    ExponentialWithJitter {
        initial_delay_millis: u64,
        max_delay_millis: u64,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_millis: 5_000,
            max_delay_millis: 3_600_000, // 1 hour max
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = match self {
            Self::Fixed { delay_millis } => *delay_millis,
            Self::Linear {
                initial_delay_millis,
                increment_millis,
            } => initial_delay_millis.saturating_add(increment_millis.saturating_mul(attempt as u64)),
            Self::Exponential {
                initial_delay_millis,
                max_delay_millis,
                multiplier,
            } => {
                let delay = (*initial_delay_millis as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_millis as f64) as u64
            }
            Self::ExponentialWithJitter {
                initial_delay_millis,
                max_delay_millis,
                multiplier,
                jitter_factor,
            } => {
                let base_delay = (*initial_delay_millis as f64) * multiplier.powi(attempt as i32);
                let capped_delay = base_delay.min(*max_delay_millis as f64);
                // delay * (1 +/- jitter_factor * random)
                let jitter_range = capped_delay * jitter_factor;
                let jitter = (rand_simple() * 2.0 - 1.0) * jitter_range;
                (capped_delay + jitter).max(1.0) as u64
            }
        };

        Duration::from_millis(millis)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay_millis: u64) -> Self {
        Self::Fixed { delay_millis }
    }

    /// Retry immediately.
    pub fn immediate() -> Self {
        Self::fixed(0)
    }

    /// Create an exponential backoff strategy with sensible defaults.
    pub fn exponential() -> Self {
        Self::default()
    }
}

/// Simple pseudo-random number generator for jitter (0.0 to 1.0).
fn rand_simple() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Retries given to new jobs and the backoff used when they fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Executions attempted before the job is left failed
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Backoff strategy for calculating the next due date
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

fn default_retries() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a specific number of attempts.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
