//! Integration tests for cascade deletion of process instances.
//!
//! Tests cover:
//! - Post-order collection across children and called instances
//! - Deleting jobs and subscriptions with their executions
//! - Leaving unrelated process instances untouched

use std::sync::Arc;

use conductor_core::engine::ProcessEngine;
use conductor_core::error::ErrorCode;
use conductor_core::events::EventSubscription;
use conductor_core::execution::{CascadeCollector, ExecutionId, ExecutionNode};
use conductor_core::jobs::ASYNC_CONTINUATION_HANDLER;
use conductor_core::persistence::{EngineStore, InMemoryStore};

/// root -> {a, b}; a calls c; c -> {c1}
fn call_tree() -> Vec<ExecutionNode> {
    let root = ExecutionNode::process_instance("root");
    let a = ExecutionNode::child_of("a", &root).with_activity("call-billing");
    let b = ExecutionNode::child_of("b", &root);
    let c = ExecutionNode::called_by("c", &a);
    let c1 = ExecutionNode::child_of("c1", &c);
    vec![root, a, b, c, c1]
}

async fn setup() -> (Arc<InMemoryStore>, Arc<ProcessEngine>) {
    let store = Arc::new(InMemoryStore::new());
    let engine = ProcessEngine::builder("cascade")
        .with_store(store.clone())
        .build()
        .unwrap();
    for node in call_tree() {
        engine.create_execution(node).await.unwrap();
    }
    (store, engine)
}

fn ids(ids: &[ExecutionId]) -> Vec<&str> {
    ids.iter().map(|id| id.as_str()).collect()
}

// ============================================================================
// Collection Tests
// ============================================================================

#[tokio::test]
async fn test_called_instance_collected_before_caller() {
    let (_store, engine) = setup().await;

    let ctx = engine.executor().open();
    let order: Vec<ExecutionId> = CascadeCollector::new()
        .collect(&ctx, &ExecutionId::from("root"))
        .await
        .unwrap()
        .into_iter()
        .map(|node| node.id)
        .collect();

    assert_eq!(ids(&order), vec!["c1", "c", "a", "b", "root"]);
}

#[tokio::test]
async fn test_subtree_collection() {
    let (_store, engine) = setup().await;

    let ctx = engine.executor().open();
    let order = CascadeCollector::new()
        .collect(&ctx, &ExecutionId::from("a"))
        .await
        .unwrap();

    let order: Vec<&str> = order.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(order, vec!["c1", "c", "a"]);
}

// ============================================================================
// Deletion Tests
// ============================================================================

#[tokio::test]
async fn test_delete_process_instance_removes_everything_below() {
    let (store, engine) = setup().await;

    engine
        .create_execution(ExecutionNode::process_instance("other"))
        .await
        .unwrap();
    engine
        .subscribe(EventSubscription::message("paid", "c1"))
        .await
        .unwrap();
    engine
        .subscribe(EventSubscription::message("cancel", "b"))
        .await
        .unwrap();
    engine
        .subscribe(EventSubscription::message("paid", "other"))
        .await
        .unwrap();
    engine
        .create_job(engine.new_job(ASYNC_CONTINUATION_HANDLER).with_execution("a"))
        .await
        .unwrap();
    let kept_job = engine
        .create_job(engine.new_job(ASYNC_CONTINUATION_HANDLER).with_execution("other"))
        .await
        .unwrap();

    let deleted = engine
        .delete_process_instance(&ExecutionId::from("root"))
        .await
        .unwrap();

    assert_eq!(ids(&deleted), vec!["c1", "c", "a", "b", "root"]);
    assert_eq!(store.execution_count(), 1);
    assert_eq!(store.subscription_count(), 1);
    assert_eq!(store.job_count(), 1);
    assert!(store.find_job(kept_job).await.unwrap().is_some());
    assert!(store
        .find_execution(&ExecutionId::from("other"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_delete_missing_instance() {
    let (store, engine) = setup().await;

    let err = engine
        .delete_process_instance(&ExecutionId::from("ghost"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ExecutionNotFound);
    assert_eq!(store.execution_count(), 5);
}

#[tokio::test]
async fn test_delete_twice_fails_second_time() {
    let (_store, engine) = setup().await;
    let root = ExecutionId::from("root");

    engine.delete_process_instance(&root).await.unwrap();
    let err = engine.delete_process_instance(&root).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::ExecutionNotFound);
}
