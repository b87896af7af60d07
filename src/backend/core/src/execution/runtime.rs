//! The process runtime collaborator.
//!
//! Token routing lives outside this crate. Jobs and event deliveries end by
//! handing the execution back to the runtime through [`ExecutionRuntime::resume`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::ExecutionId;
use crate::context::UnitOfWork;
use crate::error::Result;
use crate::events::EventType;

/// Why an execution is being resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeTrigger {
    /// A correlated event was delivered
    Event { event_type: EventType, event_name: String },
    /// An asynchronous continuation job ran
    AsyncContinuation { activity_id: Option<String> },
}

/// Continues executions once the work they waited for is done.
#[async_trait]
pub trait ExecutionRuntime: Send + Sync {
    /// Resume `execution_id` inside the caller's unit of work.
    async fn resume(
        &self,
        ctx: &mut UnitOfWork,
        execution_id: &ExecutionId,
        trigger: ResumeTrigger,
        payload: Option<Value>,
    ) -> Result<()>;
}

/// A resumption seen by [`RecordingRuntime`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resumption {
    pub execution_id: ExecutionId,
    pub trigger: ResumeTrigger,
    pub payload: Option<Value>,
}

/// Runtime that logs every resumption and records it once its unit of work commits.
///
/// Used by the standalone daemon and the CLI, where no process model is loaded.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    resumptions: Arc<Mutex<Vec<Resumption>>>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed resumption so far, oldest first.
    pub fn resumptions(&self) -> Vec<Resumption> {
        self.resumptions.lock().clone()
    }

    /// Number of times `execution_id` was resumed.
    pub fn resume_count(&self, execution_id: &ExecutionId) -> usize {
        self.resumptions
            .lock()
            .iter()
            .filter(|r| &r.execution_id == execution_id)
            .count()
    }
}

#[async_trait]
impl ExecutionRuntime for RecordingRuntime {
    async fn resume(
        &self,
        ctx: &mut UnitOfWork,
        execution_id: &ExecutionId,
        trigger: ResumeTrigger,
        payload: Option<Value>,
    ) -> Result<()> {
        tracing::info!(
            unit_of_work = %ctx.id(),
            execution_id = %execution_id,
            trigger = ?trigger,
            "Execution resumed"
        );
        let resumption = Resumption {
            execution_id: execution_id.clone(),
            trigger,
            payload,
        };
        let resumptions = self.resumptions.clone();
        ctx.on_commit("record-resumption", move || {
            resumptions.lock().push(resumption.clone());
            Ok(())
        });
        Ok(())
    }
}
