//! Execution tree nodes.
//!
//! Executions are owned by the process runtime. This core only reads the tree to
//! resume executions and to tear whole instances down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::{Command, UnitOfWork};
use crate::error::Result;
use crate::persistence::Mutation;

/// Identifier of an execution or process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&ExecutionId> for ExecutionId {
    fn from(id: &ExecutionId) -> Self {
        id.clone()
    }
}

/// One node of an execution tree.
///
/// A process instance is the root execution of its tree (`parent_id` is `None`).
/// A called process instance points back at the calling execution through
/// `super_execution_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: ExecutionId,
    pub parent_id: Option<ExecutionId>,
    pub process_instance_id: ExecutionId,
    pub super_execution_id: Option<ExecutionId>,
    pub activity_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionNode {
    /// A new process instance root.
    pub fn process_instance(id: impl Into<ExecutionId>) -> Self {
        let id = id.into();
        Self {
            process_instance_id: id.clone(),
            id,
            parent_id: None,
            super_execution_id: None,
            activity_id: None,
            created_at: Utc::now(),
        }
    }

    /// A child execution of `parent`.
    pub fn child_of(id: impl Into<ExecutionId>, parent: &ExecutionNode) -> Self {
        Self {
            id: id.into(),
            parent_id: Some(parent.id.clone()),
            process_instance_id: parent.process_instance_id.clone(),
            super_execution_id: None,
            activity_id: None,
            created_at: Utc::now(),
        }
    }

    /// The root of a process instance called from `caller`.
    pub fn called_by(id: impl Into<ExecutionId>, caller: &ExecutionNode) -> Self {
        let mut node = Self::process_instance(id);
        node.super_execution_id = Some(caller.id.clone());
        node
    }

    pub fn with_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Persist a new execution node.
pub struct CreateExecutionCommand {
    pub node: ExecutionNode,
}

#[async_trait]
impl Command for CreateExecutionCommand {
    type Output = ExecutionId;

    fn name(&self) -> &'static str {
        "create_execution"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<ExecutionId> {
        ctx.stage(Mutation::InsertExecution(self.node.clone()));
        Ok(self.node.id.clone())
    }
}
