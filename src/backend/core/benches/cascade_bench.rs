//! Benchmarks for execution tree collection
//!
//! Run with: cargo bench --bench cascade_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use conductor_core::context::{TransactionOutcome, UnitOfWork};
use conductor_core::execution::{CascadeCollector, ExecutionId, ExecutionNode};
use conductor_core::persistence::{InMemoryStore, Mutation};

fn seed(rt: &tokio::runtime::Runtime, nodes: Vec<ExecutionNode>) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    rt.block_on(async {
        let mut ctx = UnitOfWork::open(store.clone());
        for node in nodes {
            ctx.stage(Mutation::InsertExecution(node));
        }
        ctx.close(TransactionOutcome::Committed).await.unwrap();
    });
    store
}

/// Linear chain `n0 -> n1 -> ...`.
fn chain(depth: usize) -> Vec<ExecutionNode> {
    let mut parent = ExecutionNode::process_instance("n0");
    let mut nodes = vec![parent.clone()];
    for i in 1..depth {
        let child = ExecutionNode::child_of(format!("n{i}"), &parent);
        nodes.push(child.clone());
        parent = child;
    }
    nodes
}

/// Root with `width` children, each calling a process instance with one child.
fn fan_out(width: usize) -> Vec<ExecutionNode> {
    let root = ExecutionNode::process_instance("root");
    let mut nodes = vec![root.clone()];
    for i in 0..width {
        let child = ExecutionNode::child_of(format!("c{i}"), &root);
        let called = ExecutionNode::called_by(format!("p{i}"), &child);
        let leaf = ExecutionNode::child_of(format!("p{i}-leaf"), &called);
        nodes.extend([child, called, leaf]);
    }
    nodes
}

fn bench_collect_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("cascade_collect_chain");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for depth in [10, 100, 1_000] {
        let store = seed(&rt, chain(depth));
        let root = ExecutionId::from("n0");
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let ctx = UnitOfWork::open(store.clone());
                    black_box(CascadeCollector::new().collect(&ctx, &root).await.unwrap());
                })
            });
        });
    }
    group.finish();
}

fn bench_collect_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("cascade_collect_fan_out");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for width in [10, 100] {
        let store = seed(&rt, fan_out(width));
        let root = ExecutionId::from("root");
        group.throughput(Throughput::Elements((width * 3 + 1) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let ctx = UnitOfWork::open(store.clone());
                    black_box(CascadeCollector::new().collect(&ctx, &root).await.unwrap());
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_collect_chain, bench_collect_fan_out);
criterion_main!(benches);
