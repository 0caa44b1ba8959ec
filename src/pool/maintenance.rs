//! Background upkeep for a [`super::WorkerPool`].
//!
//! One pass purges reaped workers, kills overdue leases, retires stale or
//! surplus idle workers and spawns replacements. Passes run on the configured
//! interval, when the earliest lease deadline or spawn retry comes due, and
//! whenever something nudges the pool.

use std::sync::Arc;

use metrics::counter;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::{PoolConfig, PoolState, Shared, WorkerState, metrics::METRIC_LEASE_EXPIRED_TOTAL};

pub(super) struct Tick {
    pub(super) spawn: Vec<u64>,
    pub(super) wake_at: Instant,
}

pub(super) async fn run(shared: Arc<Shared>) {
    debug!(
        target = "rasterd::pool",
        op = "maintenance::start",
        interval_ms = shared.config.maintenance_interval.as_millis() as u64,
        "Pool maintenance started"
    );

    loop {
        let tick = {
            let mut state = shared.lock("maintenance");
            state.maintain(&shared.config, Instant::now())
        };
        for generation in tick.spawn {
            shared.start_spawn(generation);
        }

        tokio::select! {
            () = shared.cancel.cancelled() => break,
            () = shared.nudge.notified() => {}
            () = sleep_until(tick.wake_at) => {}
        }
    }

    debug!(
        target = "rasterd::pool",
        op = "maintenance::stop",
        "Pool maintenance stopped"
    );
}

impl PoolState {
    pub(super) fn maintain(&mut self, config: &PoolConfig, now: Instant) -> Tick {
        self.workers.retain(|_, handle| !handle.is_purgeable());

        let crashed: Vec<u64> = self
            .idle
            .iter()
            .copied()
            .filter(|generation| {
                self.workers
                    .get(generation)
                    .is_some_and(|handle| handle.has_exited())
            })
            .collect();
        for generation in crashed {
            warn!(
                target = "rasterd::pool",
                op = "maintenance::crashed",
                generation,
                "Idle worker exited unexpectedly"
            );
            self.retire(generation, "crashed");
        }

        let overdue: Vec<u64> = self
            .workers
            .iter()
            .filter(|(_, handle)| {
                handle.state() == WorkerState::Leased
                    && handle
                        .lease_window()
                        .is_some_and(|window| window.deadline <= now)
            })
            .map(|(generation, _)| *generation)
            .collect();
        for generation in overdue {
            warn!(
                target = "rasterd::pool",
                op = "maintenance::lease_expired",
                generation,
                lease_timeout_ms = config.lease_timeout.as_millis() as u64,
                "Lease expired, killing worker"
            );
            counter!(METRIC_LEASE_EXPIRED_TOTAL).increment(1);
            self.retire(generation, "lease_expired");
        }

        let stale: Vec<u64> = self
            .idle
            .iter()
            .copied()
            .filter(|generation| {
                self.workers.get(generation).is_some_and(|handle| {
                    now.saturating_duration_since(handle.last_heartbeat()) >= config.idle_timeout
                })
            })
            .collect();
        for generation in stale {
            self.retire(generation, "idle_timeout");
        }

        while self.idle.len() > config.max_idle {
            let Some(generation) = self.idle.front().copied() else {
                break;
            };
            self.retire(generation, "trimmed");
        }

        let mut spawn = Vec::new();
        if !self.closed {
            let for_idle = config
                .min_idle
                .saturating_sub(self.idle.len() + self.starting);
            let for_waiters = self.waiters.len().saturating_sub(self.starting);
            let mut wanted = for_idle.max(for_waiters);
            while wanted > 0 && self.can_spawn(config, now) {
                spawn.push(self.reserve_spawn(now));
                wanted -= 1;
            }
        }

        if !self.closed && !self.ready && self.idle.len() >= config.min_idle {
            self.ready = true;
            info!(
                target = "rasterd::pool",
                op = "maintenance::ready",
                idle = self.idle.len(),
                "Worker pool ready"
            );
        }
        self.publish();

        let mut wake_at = now + config.maintenance_interval;
        for window in self.workers.values().filter_map(|handle| handle.lease_window()) {
            wake_at = wake_at.min(window.deadline);
        }
        if let Some(retry_at) = self.retry_at
            && retry_at > now
        {
            wake_at = wake_at.min(retry_at);
        }

        Tick { spawn, wake_at }
    }
}
