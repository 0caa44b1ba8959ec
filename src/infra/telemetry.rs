use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    config::{LogFormat, LoggingSettings},
    pool::metrics::{
        METRIC_ACQUIRE_TIMEOUT_TOTAL, METRIC_ACQUIRE_WAIT_MS, METRIC_DESTROYED_TOTAL,
        METRIC_IDLE_WORKERS, METRIC_LEASE_EXPIRED_TOTAL, METRIC_LEASED_WORKERS,
        METRIC_SPAWN_FAILURES_TOTAL, METRIC_SPAWNED_TOTAL, METRIC_STARTING_WORKERS,
        METRIC_TOTAL_WORKERS, METRIC_WAITING_CALLERS,
    },
};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for the pool's metrics with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_gauge!(
            METRIC_IDLE_WORKERS,
            Unit::Count,
            "Workers parked idle and ready to lease."
        );
        describe_gauge!(
            METRIC_TOTAL_WORKERS,
            Unit::Count,
            "Worker handles counted against max_total, including starting and dying ones."
        );
        describe_gauge!(
            METRIC_LEASED_WORKERS,
            Unit::Count,
            "Workers currently held by a lease."
        );
        describe_gauge!(
            METRIC_STARTING_WORKERS,
            Unit::Count,
            "Workers spawned but not yet ready."
        );
        describe_gauge!(
            METRIC_WAITING_CALLERS,
            Unit::Count,
            "Callers queued for a worker."
        );
        describe_counter!(
            METRIC_SPAWNED_TOTAL,
            Unit::Count,
            "Total number of workers that reported ready."
        );
        describe_counter!(
            METRIC_SPAWN_FAILURES_TOTAL,
            Unit::Count,
            "Total number of worker spawns that failed."
        );
        describe_counter!(
            METRIC_DESTROYED_TOTAL,
            Unit::Count,
            "Total number of workers killed, labelled by reason."
        );
        describe_counter!(
            METRIC_LEASE_EXPIRED_TOTAL,
            Unit::Count,
            "Total number of leases killed for overstaying their deadline."
        );
        describe_counter!(
            METRIC_ACQUIRE_TIMEOUT_TOTAL,
            Unit::Count,
            "Total number of acquire calls that hit their deadline."
        );
        describe_histogram!(
            METRIC_ACQUIRE_WAIT_MS,
            Unit::Milliseconds,
            "Time spent waiting for a worker lease in milliseconds."
        );
    });
}
