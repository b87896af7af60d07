//! Execution trees and the runtime that continues them.

pub mod cascade;
pub mod runtime;
pub mod tree;

pub use cascade::{CascadeCollector, DeleteProcessInstanceCommand};
pub use runtime::{ExecutionRuntime, RecordingRuntime, ResumeTrigger, Resumption};
pub use tree::{CreateExecutionCommand, ExecutionId, ExecutionNode};
