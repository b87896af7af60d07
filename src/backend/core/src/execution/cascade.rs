//! Cascade deletion of execution trees.
//!
//! [`CascadeCollector::collect`] returns the executions below a root in strict
//! post-order. Each execution follows its children, then the tree of the
//! process instance it called, and the root comes last. Deleting in that order
//! never leaves a record whose parent is already gone.

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, info};

use super::{ExecutionId, ExecutionNode};
use crate::context::{Command, UnitOfWork};
use crate::error::{ConductorError, Result};
use crate::persistence::Mutation;
use crate::telemetry::OperationTimer;

struct Frame {
    node: ExecutionNode,
    /// Children and called instance already pushed
    expanded: bool,
}

/// Walks an execution tree, including called process instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct CascadeCollector;

impl CascadeCollector {
    pub fn new() -> Self {
        Self
    }

    /// Executions to delete for `root`, deepest first, `root` last.
    ///
    /// Iterative so deep trees cannot overflow the stack. A node reached twice
    /// is reported as [`crate::error::ErrorCode::CascadeCycleDetected`].
    pub async fn collect(&self, ctx: &UnitOfWork, root: &ExecutionId) -> Result<Vec<ExecutionNode>> {
        let store = ctx.store();
        let root = store
            .find_execution(root)
            .await?
            .ok_or_else(|| ConductorError::execution_not_found(root))?;

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![Frame {
            node: root,
            expanded: false,
        }];

        while let Some(frame) = stack.pop() {
            if frame.expanded {
                order.push(frame.node);
                continue;
            }

            let id = frame.node.id.clone();
            if !visited.insert(id.clone()) {
                return Err(ConductorError::cascade_cycle(&id));
            }

            let children = store.find_child_executions(&id).await?;
            let called = store.find_called_process_instance(&id).await?;

            stack.push(Frame {
                node: frame.node,
                expanded: true,
            });
            if let Some(called) = called {
                stack.push(Frame {
                    node: called,
                    expanded: false,
                });
            }
            for child in children.into_iter().rev() {
                stack.push(Frame {
                    node: child,
                    expanded: false,
                });
            }
        }

        debug!(count = order.len(), "Execution tree collected");
        Ok(order)
    }
}

/// Delete a process instance with every execution, job and event
/// subscription below it, including called process instances.
pub struct DeleteProcessInstanceCommand {
    pub process_instance_id: ExecutionId,
}

#[async_trait]
impl Command for DeleteProcessInstanceCommand {
    type Output = Vec<ExecutionId>;

    fn name(&self) -> &'static str {
        "delete_process_instance"
    }

    async fn execute(&self, ctx: &mut UnitOfWork) -> Result<Vec<ExecutionId>> {
        let timer = OperationTimer::start("delete_process_instance");
        let nodes = CascadeCollector::new()
            .collect(ctx, &self.process_instance_id)
            .await?;

        let mut jobs = 0usize;
        let mut subscriptions = 0usize;
        let mut deleted = Vec::with_capacity(nodes.len());

        for node in nodes {
            let node_jobs = ctx.store().find_jobs_by_execution(&node.id).await?;
            let node_subscriptions = ctx.store().find_subscriptions_by_execution(&node.id).await?;

            for job in node_jobs {
                ctx.stage(Mutation::DeleteJob {
                    id: job.id,
                    revision: job.revision,
                });
                jobs += 1;
            }
            for subscription in node_subscriptions {
                ctx.stage(Mutation::DeleteSubscription(subscription.id));
                subscriptions += 1;
            }
            ctx.stage(Mutation::DeleteExecution(node.id.clone()));
            deleted.push(node.id);
        }

        info!(
            process_instance_id = %self.process_instance_id,
            executions = deleted.len(),
            jobs,
            subscriptions,
            elapsed_ms = timer.finish().as_millis() as u64,
            "Process instance deleted"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TransactionOutcome;
    use crate::error::ErrorCode;
    use crate::persistence::InMemoryStore;
    use std::sync::Arc;

    async fn seed(store: &Arc<InMemoryStore>, nodes: Vec<ExecutionNode>) {
        let mut ctx = UnitOfWork::open(store.clone());
        for node in nodes {
            ctx.stage(Mutation::InsertExecution(node));
        }
        ctx.close(TransactionOutcome::Committed).await.unwrap();
    }

    fn ids(nodes: &[ExecutionNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_single_node() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, vec![ExecutionNode::process_instance("root")]).await;

        let ctx = UnitOfWork::open(store.clone());
        let order = CascadeCollector::new()
            .collect(&ctx, &ExecutionId::from("root"))
            .await
            .unwrap();
        assert_eq!(ids(&order), vec!["root"]);
    }

    #[tokio::test]
    async fn test_deep_chain_is_post_order() {
        let store = Arc::new(InMemoryStore::new());
        let root = ExecutionNode::process_instance("n0");
        let mut nodes = vec![root.clone()];
        let mut parent = root;
        for i in 1..200 {
            let child = ExecutionNode::child_of(format!("n{}", i), &parent);
            nodes.push(child.clone());
            parent = child;
        }
        seed(&store, nodes).await;

        let ctx = UnitOfWork::open(store.clone());
        let order = CascadeCollector::new()
            .collect(&ctx, &ExecutionId::from("n0"))
            .await
            .unwrap();

        assert_eq!(order.len(), 200);
        assert_eq!(order.first().unwrap().id.as_str(), "n199");
        assert_eq!(order.last().unwrap().id.as_str(), "n0");
    }

    #[tokio::test]
    async fn test_missing_root() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = UnitOfWork::open(store);
        let err = CascadeCollector::new()
            .collect(&ctx, &ExecutionId::from("ghost"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExecutionNotFound);
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        let store = Arc::new(InMemoryStore::new());
        let root = ExecutionNode::process_instance("root");
        let child = ExecutionNode::child_of("child", &root);
        // the child calls back into the root instance
        let mut looped = root.clone();
        looped.super_execution_id = Some(child.id.clone());
        seed(&store, vec![looped, child]).await;

        let ctx = UnitOfWork::open(store);
        let err = CascadeCollector::new()
            .collect(&ctx, &ExecutionId::from("root"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CascadeCycleDetected);
    }
}
