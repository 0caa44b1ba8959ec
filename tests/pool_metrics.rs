#![cfg(unix)]

#[path = "support/fake_worker.rs"]
mod fake_worker;

use std::collections::HashSet;
use std::time::Duration;

use fake_worker::{FakeWorker, eventually};
use metrics_util::debugging::DebuggingRecorder;
use rasterd::{
    infra::telemetry::describe_metrics,
    pool::{
        LeaseOutcome, WorkerPool,
        metrics::{
            METRIC_ACQUIRE_TIMEOUT_TOTAL, METRIC_ACQUIRE_WAIT_MS, METRIC_DESTROYED_TOTAL,
            METRIC_IDLE_WORKERS, METRIC_LEASE_EXPIRED_TOTAL, METRIC_LEASED_WORKERS,
            METRIC_SPAWN_FAILURES_TOTAL, METRIC_SPAWNED_TOTAL, METRIC_STARTING_WORKERS,
            METRIC_TOTAL_WORKERS, METRIC_WAITING_CALLERS,
        },
    },
};

#[tokio::test]
async fn pool_lifecycle_emits_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    describe_metrics();

    // Spawn, lease, recycle and destroy.
    let fake = FakeWorker::new();
    let mut config = fake.pool_config(1, 1, 1);
    config.lease_timeout = Duration::from_millis(200);
    let pool = WorkerPool::new(config).expect("pool");
    pool.initialize().expect("initialize");
    assert!(eventually(Duration::from_secs(5), || pool.readiness().ready).await);

    let lease = pool
        .acquire_within(Duration::from_secs(5))
        .await
        .expect("lease");
    let err = pool
        .acquire_within(Duration::from_millis(50))
        .await
        .expect_err("only one worker");
    assert!(err.is_retryable());
    pool.release(lease, LeaseOutcome::Healthy);

    // Let a lease run past its deadline so maintenance reclaims it.
    let overdue = pool
        .acquire_within(Duration::from_secs(5))
        .await
        .expect("lease");
    let generation = overdue.generation();
    assert!(
        eventually(Duration::from_secs(5), || pool
            .workers()
            .iter()
            .all(|worker| worker.generation != generation))
        .await
    );
    drop(overdue);
    pool.shutdown(Duration::from_secs(1)).await;

    // A worker that cannot start.
    let broken = FakeWorker::new().with_env("FAKE_STARTUP_FAIL", "no engine");
    let broken_pool = WorkerPool::new(broken.pool_config(0, 1, 1)).expect("pool");
    broken_pool.initialize().expect("initialize");
    let _ = broken_pool
        .acquire_within(Duration::from_millis(200))
        .await;
    broken_pool.shutdown(Duration::from_secs(1)).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        METRIC_IDLE_WORKERS,
        METRIC_TOTAL_WORKERS,
        METRIC_LEASED_WORKERS,
        METRIC_STARTING_WORKERS,
        METRIC_WAITING_CALLERS,
        METRIC_SPAWNED_TOTAL,
        METRIC_SPAWN_FAILURES_TOTAL,
        METRIC_DESTROYED_TOTAL,
        METRIC_LEASE_EXPIRED_TOTAL,
        METRIC_ACQUIRE_TIMEOUT_TOTAL,
        METRIC_ACQUIRE_WAIT_MS,
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
