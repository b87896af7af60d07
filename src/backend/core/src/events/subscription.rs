//! Event subscriptions: executions waiting for an external event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ConductorError, Result};
use crate::execution::ExecutionId;

/// Unique identifier for an event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of event an execution waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Message,
    Signal,
    Compensate,
    Conditional,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Signal => "signal",
            Self::Compensate => "compensate",
            Self::Conditional => "conditional",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "message" => Ok(Self::Message),
            "signal" => Ok(Self::Signal),
            "compensate" => Ok(Self::Compensate),
            "conditional" => Ok(Self::Conditional),
            other => Err(ConductorError::invalid_input(format!("unknown event type '{}'", other))),
        }
    }
}

/// An execution waiting for `(event_type, event_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub event_type: EventType,
    pub event_name: String,
    pub execution_id: ExecutionId,
    pub process_instance_id: Option<ExecutionId>,
    pub activity_id: Option<String>,
    /// Correlation configuration, opaque to the correlator
    pub configuration: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl EventSubscription {
    pub fn new(
        event_type: EventType,
        event_name: impl Into<String>,
        execution_id: impl Into<ExecutionId>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            event_type,
            event_name: event_name.into(),
            execution_id: execution_id.into(),
            process_instance_id: None,
            activity_id: None,
            configuration: None,
            created_at: Utc::now(),
        }
    }

    pub fn message(event_name: impl Into<String>, execution_id: impl Into<ExecutionId>) -> Self {
        Self::new(EventType::Message, event_name, execution_id)
    }

    pub fn signal(event_name: impl Into<String>, execution_id: impl Into<ExecutionId>) -> Self {
        Self::new(EventType::Signal, event_name, execution_id)
    }

    pub fn with_process_instance(mut self, process_instance_id: impl Into<ExecutionId>) -> Self {
        self.process_instance_id = Some(process_instance_id.into());
        self
    }

    pub fn with_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Whether this subscription has exactly the given correlation key.
    pub fn matches(&self, event_type: EventType, event_name: &str, execution_id: &ExecutionId) -> bool {
        self.event_type == event_type && self.event_name == event_name && &self.execution_id == execution_id
    }
}
