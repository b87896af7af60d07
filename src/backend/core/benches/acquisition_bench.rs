//! Benchmarks for job locking and acquisition cycles
//!
//! Run with: cargo bench --bench acquisition_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::config::AcquisitionConfig;
use conductor_core::context::{TransactionOutcome, UnitOfWork};
use conductor_core::engine::ProcessEngine;
use conductor_core::jobs::{
    JobAcquisition, JobEntity, StrategyRegistry, WorkerPool, WorkerPoolConfig, ASYNC_CONTINUATION_HANDLER,
    SEQUENTIAL_STRATEGY,
};
use conductor_core::persistence::{DueJobQuery, EngineStore, InMemoryStore, JobOrder, Mutation};

fn seed_jobs(rt: &tokio::runtime::Runtime, store: &Arc<InMemoryStore>, count: usize) {
    rt.block_on(async {
        let mut ctx = UnitOfWork::open(store.clone());
        for i in 0..count {
            ctx.stage(Mutation::InsertJob(
                JobEntity::new(ASYNC_CONTINUATION_HANDLER)
                    .with_execution(format!("e{i}"))
                    .with_priority((i % 5) as i64),
            ));
        }
        ctx.close(TransactionOutcome::Committed).await.unwrap();
    });
}

fn bench_query_due_jobs(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_due_jobs");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for count in [100, 1_000, 10_000] {
        let store = Arc::new(InMemoryStore::new());
        seed_jobs(&rt, &store, count);

        for order in [JobOrder::DueDate, JobOrder::PriorityThenDueDate] {
            group.bench_with_input(BenchmarkId::new(format!("{order:?}"), count), &count, |b, _| {
                b.iter(|| {
                    rt.block_on(async {
                        let query = DueJobQuery {
                            now: Utc::now(),
                            limit: 10,
                            order,
                        };
                        black_box(store.query_due_jobs(&query).await.unwrap());
                    })
                });
            });
        }
    }
    group.finish();
}

fn bench_lock_job(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    seed_jobs(&rt, &store, 1);
    let job_id = rt.block_on(async { store.list_jobs().await.unwrap()[0].id });

    c.bench_function("lock_job_contended", |b| {
        b.iter(|| {
            rt.block_on(async {
                let now = Utc::now();
                // already locked after the first iteration
                black_box(
                    store
                        .lock_job(job_id, "bench", now + chrono::Duration::minutes(5), now)
                        .await
                        .unwrap(),
                );
            })
        });
    });
}

fn bench_acquisition_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquisition_cycle");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for batch in [1, 10, 50] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let store = Arc::new(InMemoryStore::new());
                    seed_jobs(&rt, &store, batch);
                    let engine = ProcessEngine::builder("bench")
                        .with_store(store)
                        .build()
                        .unwrap();
                    let acquisition = JobAcquisition::new(
                        AcquisitionConfig::named("bench").with_max_jobs(batch),
                        StrategyRegistry::with_defaults().get(SEQUENTIAL_STRATEGY).unwrap(),
                        Arc::new(WorkerPool::new(WorkerPoolConfig::default().with_max_workers(16))),
                        Duration::from_secs(1),
                    );
                    acquisition.register(engine).unwrap();
                    acquisition
                },
                |acquisition| {
                    rt.block_on(async {
                        black_box(acquisition.run_cycle().await);
                        acquisition.wait_idle().await;
                    })
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_query_due_jobs, bench_lock_job, bench_acquisition_cycle);
criterion_main!(benches);
