use metrics::gauge;

use super::ReadinessSnapshot;

pub const METRIC_IDLE_WORKERS: &str = "rasterd_pool_idle_workers";
pub const METRIC_TOTAL_WORKERS: &str = "rasterd_pool_total_workers";
pub const METRIC_LEASED_WORKERS: &str = "rasterd_pool_leased_workers";
pub const METRIC_STARTING_WORKERS: &str = "rasterd_pool_starting_workers";
pub const METRIC_WAITING_CALLERS: &str = "rasterd_pool_waiting_callers";
pub const METRIC_SPAWNED_TOTAL: &str = "rasterd_pool_spawned_total";
pub const METRIC_SPAWN_FAILURES_TOTAL: &str = "rasterd_pool_spawn_failures_total";
pub const METRIC_DESTROYED_TOTAL: &str = "rasterd_pool_destroyed_total";
pub const METRIC_LEASE_EXPIRED_TOTAL: &str = "rasterd_pool_lease_expired_total";
pub const METRIC_ACQUIRE_TIMEOUT_TOTAL: &str = "rasterd_pool_acquire_timeout_total";
pub const METRIC_ACQUIRE_WAIT_MS: &str = "rasterd_pool_acquire_wait_ms";

pub(crate) fn publish(snapshot: &ReadinessSnapshot) {
    gauge!(METRIC_IDLE_WORKERS).set(snapshot.idle as f64);
    gauge!(METRIC_TOTAL_WORKERS).set(snapshot.total as f64);
    gauge!(METRIC_LEASED_WORKERS).set(snapshot.leased as f64);
    gauge!(METRIC_STARTING_WORKERS).set(snapshot.starting as f64);
    gauge!(METRIC_WAITING_CALLERS).set(snapshot.waiting as f64);
}
