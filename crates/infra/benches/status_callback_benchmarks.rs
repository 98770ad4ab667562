use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use relayq_core::{ArchivedJobStatus, DeliveryStrategy, EnqueueJobParams, JobType, QueuedJob};
use relayq_infra::WorkContext;
use relayq_infra::jobs::{RetryPolicy, StatusReconciler};
use relayq_infra::store::{InMemoryJobStore, JobStore};
use relayq_observability::NoopMetrics;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn setup(rt: &tokio::runtime::Runtime, attempts: i16) -> StatusReconciler<Arc<InMemoryJobStore>> {
    let store = InMemoryJobStore::arc();
    rt.block_on(store.create_job_type(
        JobType::new("echo", DeliveryStrategy::AtLeastOnce, attempts, 1).unwrap(),
    ))
    .unwrap();
    StatusReconciler::new(store, Arc::new(NoopMetrics))
        .with_requeue_backoff(RetryPolicy::immediate())
}

fn enqueue(rt: &tokio::runtime::Runtime, store: &InMemoryJobStore) -> QueuedJob {
    rt.block_on(store.enqueue(EnqueueJobParams::new("echo", b"{}".to_vec())))
        .unwrap()
}

fn bench_success_callback(c: &mut Criterion) {
    let mut group = c.benchmark_group("status_callback_success");
    group.sample_size(1000);
    let rt = runtime();
    let reconciler = setup(&rt, 1);
    let ctx = WorkContext::with_timeout(Duration::from_secs(3600));

    group.bench_function("archive_succeeded", |b| {
        b.iter(|| {
            let job = enqueue(&rt, reconciler.store());
            rt.block_on(reconciler.handle_status_callback(
                &ctx,
                black_box(&job.id),
                "echo",
                ArchivedJobStatus::Succeeded,
                job.attempts,
                true,
            ))
            .unwrap();
        });
    });

    group.bench_function("duplicate_callback", |b| {
        let job = enqueue(&rt, reconciler.store());
        rt.block_on(reconciler.handle_status_callback(
            &ctx,
            &job.id,
            "echo",
            ArchivedJobStatus::Succeeded,
            job.attempts,
            true,
        ))
        .unwrap();

        b.iter(|| {
            let res = rt.block_on(reconciler.handle_status_callback(
                &ctx,
                black_box(&job.id),
                "echo",
                ArchivedJobStatus::Succeeded,
                job.attempts,
                true,
            ));
            assert!(res.is_err());
        });
    });

    group.finish();
}

fn bench_retry_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("status_callback_retry_chain");

    for attempts in [1i16, 5, 25].iter() {
        group.throughput(Throughput::Elements(*attempts as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(attempts),
            attempts,
            |b, &attempts| {
                let rt = runtime();
                let reconciler = setup(&rt, attempts);
                let ctx = WorkContext::with_timeout(Duration::from_secs(3600));

                b.iter(|| {
                    let job = enqueue(&rt, reconciler.store());
                    // Fail every attempt until the job is archived.
                    for attempt in (1..=attempts).rev() {
                        rt.block_on(reconciler.handle_status_callback(
                            &ctx,
                            &job.id,
                            "echo",
                            ArchivedJobStatus::Failed,
                            attempt,
                            true,
                        ))
                        .unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_success_callback, bench_retry_chain);
criterion_main!(benches);
