//! Process-isolated worker pool.
//!
//! [`WorkerPool`] keeps a set of warm `rasterd-worker` processes and hands
//! them out through exclusive, time-bounded [`Lease`]s. Callers that find no
//! idle worker queue in FIFO order until a worker is released or spawned. A
//! background maintenance task keeps the pool between its idle bounds,
//! replaces dead workers and kills leases that overstay their deadline.
//!
//! All bookkeeping sits behind one synchronous mutex that is never held
//! across an `.await`.

pub mod config;
pub mod error;
pub mod handle;
mod lease;
mod maintenance;
pub mod metrics;

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ::metrics::{counter, histogram};
use futures::future::join_all;
use serde::Serialize;
use tokio::{
    sync::{Notify, oneshot},
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    util::lock::mutex_lock,
    worker::{ProcessControl, SpawnError, WorkerProcess},
};

pub use config::PoolConfig;
pub use error::PoolError;
pub use handle::{WorkerState, WorkerSummary};
pub use lease::{Lease, LeaseOutcome};

use handle::{LeaseWindow, WorkerHandle};
use self::metrics::{
    METRIC_ACQUIRE_TIMEOUT_TOTAL, METRIC_ACQUIRE_WAIT_MS, METRIC_DESTROYED_TOTAL,
    METRIC_SPAWN_FAILURES_TOTAL, METRIC_SPAWNED_TOTAL,
};

const LOCK_TARGET: &str = "rasterd::pool";
/// Upper bound on waiting for killed processes to be reaped during shutdown.
const EXIT_WAIT: Duration = Duration::from_secs(5);

/// Point-in-time counts used by the readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadinessSnapshot {
    pub ready: bool,
    pub idle: usize,
    pub total: usize,
    pub leased: usize,
    pub starting: usize,
    pub waiting: usize,
}

/// A worker on its way to a lease holder.
pub(crate) struct Grant {
    generation: u64,
    process: WorkerProcess,
    window: LeaseWindow,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

struct PoolState {
    workers: BTreeMap<u64, WorkerHandle>,
    /// Idle generations, most recently parked at the back.
    idle: VecDeque<u64>,
    waiters: VecDeque<Waiter>,
    next_generation: u64,
    next_waiter: u64,
    starting: usize,
    closed: bool,
    ready: bool,
    spawn_failures: u32,
    retry_at: Option<Instant>,
    last_spawn_error: Option<String>,
}

impl PoolState {
    fn new() -> Self {
        Self {
            workers: BTreeMap::new(),
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            next_generation: 1,
            next_waiter: 1,
            starting: 0,
            closed: false,
            ready: false,
            spawn_failures: 0,
            retry_at: None,
            last_spawn_error: None,
        }
    }

    fn leased(&self) -> usize {
        self.workers
            .values()
            .filter(|handle| handle.state() == WorkerState::Leased)
            .count()
    }

    fn snapshot(&self) -> ReadinessSnapshot {
        ReadinessSnapshot {
            ready: self.ready && !self.closed,
            idle: self.idle.len(),
            total: self.workers.len(),
            leased: self.leased(),
            starting: self.starting,
            waiting: self.waiters.len(),
        }
    }

    fn publish(&self) {
        self::metrics::publish(&self.snapshot());
    }

    /// Pop the most recently idled live worker and lease it out.
    fn take_idle(&mut self, now: Instant, lease_timeout: Duration) -> Option<Grant> {
        while let Some(generation) = self.idle.pop_back() {
            let Some(handle) = self.workers.get_mut(&generation) else {
                continue;
            };
            if handle.has_exited() {
                self.retire(generation, "crashed");
                continue;
            }
            if let Some((process, window)) = handle.check_out(now, lease_timeout) {
                return Some(Grant {
                    generation,
                    process,
                    window,
                });
            }
        }
        None
    }

    /// Hand a worker to the longest waiter, or park it idle.
    fn dispatch(
        &mut self,
        generation: u64,
        mut process: WorkerProcess,
        now: Instant,
        lease_timeout: Duration,
    ) {
        let Some(handle) = self.workers.get_mut(&generation) else {
            return;
        };

        while let Some(waiter) = self.waiters.pop_front() {
            let window = handle.mark_leased(now, lease_timeout);
            match waiter.tx.send(Grant {
                generation,
                process,
                window,
            }) {
                Ok(()) => return,
                Err(returned) => process = returned.process,
            }
        }

        handle.park(process, now);
        self.idle.push_back(generation);
    }

    fn can_spawn(&self, config: &PoolConfig, now: Instant) -> bool {
        !self.closed
            && self.workers.len() < config.max_total
            && self.retry_at.is_none_or(|at| at <= now)
    }

    fn reserve_spawn(&mut self, now: Instant) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.starting += 1;
        self.workers
            .insert(generation, WorkerHandle::starting(generation, now));
        generation
    }

    /// Kill a worker and mark its handle Dead. The handle is purged once the
    /// process has been reaped.
    fn retire(&mut self, generation: u64, reason: &'static str) {
        self.idle.retain(|idle| *idle != generation);
        let Some(handle) = self.workers.get_mut(&generation) else {
            return;
        };
        if handle.state() == WorkerState::Dead {
            return;
        }
        let age_ms = handle.age(Instant::now()).as_millis() as u64;
        let was = handle.state().as_str();
        handle.kill();
        counter!(METRIC_DESTROYED_TOTAL, "reason" => reason).increment(1);
        debug!(
            target = "rasterd::pool",
            op = "pool::retire",
            generation,
            reason,
            was,
            age_ms,
            "Worker retired"
        );
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|waiter| waiter.id == id) {
            Some(position) => {
                self.waiters.remove(position);
                true
            }
            None => false,
        }
    }
}

pub(crate) struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    nudge: Notify,
    drained: Notify,
    cancel: CancellationToken,
    initialized: AtomicBool,
}

impl Shared {
    fn lock(&self, op: &'static str) -> MutexGuard<'_, PoolState> {
        mutex_lock(&self.state, LOCK_TARGET, op)
    }

    /// Wake the maintenance task early.
    fn nudge(&self) {
        self.nudge.notify_one();
    }

    fn start_spawn(self: &Arc<Self>, generation: u64) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = WorkerProcess::spawn(
                &shared.config.command,
                generation,
                shared.config.startup_timeout,
            )
            .await;
            shared.finish_spawn(generation, result);
        });
    }

    fn finish_spawn(self: &Arc<Self>, generation: u64, result: Result<WorkerProcess, SpawnError>) {
        let now = Instant::now();
        let mut state = self.lock("spawn.finish");
        state.starting = state.starting.saturating_sub(1);

        match result {
            Ok(process) => {
                counter!(METRIC_SPAWNED_TOTAL).increment(1);
                state.spawn_failures = 0;
                state.retry_at = None;
                state.last_spawn_error = None;
                self.watch_exit(process.control().clone());

                if state.closed {
                    state.workers.remove(&generation);
                    drop(process);
                } else if let Some(handle) = state.workers.get_mut(&generation) {
                    handle.bind(process.control().clone(), process.spawned_at());
                    state.dispatch(generation, process, now, self.config.lease_timeout);
                }
            }
            Err(err) => {
                counter!(METRIC_SPAWN_FAILURES_TOTAL).increment(1);
                state.workers.remove(&generation);
                state.spawn_failures = state.spawn_failures.saturating_add(1);
                let backoff = self.config.spawn_backoff(state.spawn_failures);
                state.retry_at = Some(now + backoff);
                state.last_spawn_error = Some(err.to_string());
                warn!(
                    target = "rasterd::pool",
                    op = "pool::spawn",
                    result = "error",
                    generation,
                    consecutive_failures = state.spawn_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Worker spawn failed"
                );
            }
        }

        state.publish();
        let closed = state.closed;
        drop(state);

        if closed {
            self.drained.notify_waiters();
        }
        self.nudge();
    }

    /// Nudge maintenance when the process exits, so dead handles are purged
    /// and replaced without waiting for the next interval.
    fn watch_exit(self: &Arc<Self>, control: ProcessControl) {
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            control.wait_exit().await;
            if let Some(shared) = shared.upgrade() {
                shared.nudge();
            }
        });
    }

    pub(crate) fn give_back(
        &self,
        generation: u64,
        process: WorkerProcess,
        outcome: LeaseOutcome,
        held: Duration,
    ) {
        let now = Instant::now();
        let mut state = self.lock("release");

        let still_leased = state
            .workers
            .get(&generation)
            .is_some_and(|handle| handle.state() == WorkerState::Leased);

        if !still_leased {
            debug!(
                target = "rasterd::pool",
                op = "pool::release",
                result = "already_retired",
                generation,
                held_ms = held.as_millis() as u64,
                "Lease returned after its worker was retired"
            );
            drop(process);
        } else if outcome == LeaseOutcome::Healthy && !state.closed && !process.has_exited() {
            state.dispatch(generation, process, now, self.config.lease_timeout);
            debug!(
                target = "rasterd::pool",
                op = "pool::release",
                result = "recycled",
                generation,
                held_ms = held.as_millis() as u64,
                "Worker returned to pool"
            );
        } else {
            let reason = if state.closed {
                "shutdown"
            } else if process.has_exited() {
                "crashed"
            } else {
                "unhealthy"
            };
            drop(process);
            state.retire(generation, reason);
            debug!(
                target = "rasterd::pool",
                op = "pool::release",
                result = "destroyed",
                generation,
                reason,
                held_ms = held.as_millis() as u64,
                "Worker destroyed on release"
            );
        }

        state.publish();
        let closed = state.closed;
        drop(state);

        if closed {
            self.drained.notify_waiters();
        }
        self.nudge();
    }

    /// Put back a grant whose receiver gave up before using it.
    fn restore(&self, grant: Grant) {
        let now = Instant::now();
        let mut state = self.lock("acquire.restore");
        let still_leased = state
            .workers
            .get(&grant.generation)
            .is_some_and(|handle| handle.state() == WorkerState::Leased);
        if state.closed || !still_leased {
            drop(grant.process);
            state.retire(grant.generation, "shutdown");
        } else {
            state.dispatch(
                grant.generation,
                grant.process,
                now,
                self.config.lease_timeout,
            );
        }
        state.publish();
    }
}

/// Removes a queued waiter that stops waiting for any reason, returning a
/// grant that arrived too late to the pool.
struct PendingWaiter {
    shared: Arc<Shared>,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl PendingWaiter {
    fn expire(&mut self, started: Instant) -> Result<Grant, PoolError> {
        let mut state = self.shared.lock("acquire.timeout");
        if state.remove_waiter(self.id) {
            state.publish();
            return Err(PoolError::Timeout {
                waited: started.elapsed(),
                last_spawn_error: state.last_spawn_error.clone(),
            });
        }
        drop(state);

        // Dequeued under the lock: either a grant is already buffered or the
        // queue was dropped by shutdown.
        self.rx.try_recv().map_err(|_| PoolError::PoolClosed)
    }
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.shared.lock("acquire.cancelled");
        if state.remove_waiter(self.id) {
            state.publish();
            return;
        }
        drop(state);

        if let Ok(grant) = self.rx.try_recv() {
            self.shared.restore(grant);
        }
    }
}

/// Cheaply clonable handle to a shared worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("readiness", &self.readiness())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState::new()),
                nudge: Notify::new(),
                drained: Notify::new(),
                cancel: CancellationToken::new(),
                initialized: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Start the maintenance task, which brings the pool up to `min_idle`.
    pub fn initialize(&self) -> Result<(), PoolError> {
        {
            let mut state = self.shared.lock("initialize");
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            if self.shared.initialized.swap(true, Ordering::AcqRel) {
                debug!(
                    target = "rasterd::pool",
                    op = "pool::initialize",
                    result = "noop",
                    "Worker pool already initialized"
                );
                return Ok(());
            }
            if self.shared.config.min_idle == 0 {
                state.ready = true;
            }
        }

        tokio::spawn(maintenance::run(Arc::clone(&self.shared)));
        info!(
            target = "rasterd::pool",
            op = "pool::initialize",
            min_idle = self.shared.config.min_idle,
            max_idle = self.shared.config.max_idle,
            max_total = self.shared.config.max_total,
            program = %self.shared.config.command.program.display(),
            "Worker pool initializing"
        );
        Ok(())
    }

    /// Lease a worker, waiting until `deadline` at most.
    pub async fn acquire(&self, deadline: Instant) -> Result<Lease, PoolError> {
        let started = Instant::now();
        let shared = &self.shared;
        let config = &shared.config;

        let (id, rx, spawn) = {
            let mut state = shared.lock("acquire");
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            if config.max_total == 0 {
                return Err(PoolError::Exhausted);
            }

            if state.waiters.is_empty()
                && let Some(grant) = state.take_idle(started, config.lease_timeout)
            {
                state.publish();
                drop(state);
                histogram!(METRIC_ACQUIRE_WAIT_MS).record(0.0);
                return Ok(Lease::new(Arc::clone(shared), grant));
            }

            if deadline <= started {
                counter!(METRIC_ACQUIRE_TIMEOUT_TOTAL).increment(1);
                return Err(PoolError::Timeout {
                    waited: Duration::ZERO,
                    last_spawn_error: state.last_spawn_error.clone(),
                });
            }
            if state.waiters.len() >= config.max_waiters {
                return Err(PoolError::Exhausted);
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push_back(Waiter { id, tx });

            let spawn = (state.starting < state.waiters.len() && state.can_spawn(config, started))
                .then(|| state.reserve_spawn(started));
            state.publish();
            (id, rx, spawn)
        };

        if let Some(generation) = spawn {
            shared.start_spawn(generation);
        }

        let mut pending = PendingWaiter {
            shared: Arc::clone(shared),
            id,
            rx,
            settled: false,
        };
        let received = timeout_at(deadline, &mut pending.rx).await;
        let result = match received {
            Ok(Ok(grant)) => Ok(grant),
            Ok(Err(_)) => Err(PoolError::PoolClosed),
            Err(_) => pending.expire(started),
        };
        pending.settled = true;

        let waited = started.elapsed();
        match result {
            Ok(grant) => {
                histogram!(METRIC_ACQUIRE_WAIT_MS).record(waited.as_secs_f64() * 1000.0);
                Ok(Lease::new(Arc::clone(shared), grant))
            }
            Err(err) => {
                if matches!(err, PoolError::Timeout { .. }) {
                    counter!(METRIC_ACQUIRE_TIMEOUT_TOTAL).increment(1);
                }
                debug!(
                    target = "rasterd::pool",
                    op = "pool::acquire",
                    result = "error",
                    waited_ms = waited.as_millis() as u64,
                    error = %err,
                    "Acquire failed"
                );
                Err(err)
            }
        }
    }

    /// [`acquire`](Self::acquire) with a deadline relative to now.
    pub async fn acquire_within(&self, wait: Duration) -> Result<Lease, PoolError> {
        self.acquire(Instant::now() + wait).await
    }

    /// End a lease. A healthy worker goes back to the pool; anything else is
    /// destroyed.
    pub fn release(&self, lease: Lease, outcome: LeaseOutcome) {
        lease.release(outcome);
    }

    pub fn readiness(&self) -> ReadinessSnapshot {
        self.shared.lock("readiness").snapshot()
    }

    pub fn workers(&self) -> Vec<WorkerSummary> {
        self.shared
            .lock("workers")
            .workers
            .values()
            .map(WorkerHandle::summary)
            .collect()
    }

    /// Close the pool.
    ///
    /// Waiters fail with [`PoolError::PoolClosed`] and idle workers are killed
    /// at once. Outstanding leases get `grace` to come back before their
    /// processes are killed too.
    pub async fn shutdown(&self, grace: Duration) {
        let started = Instant::now();
        {
            let mut state = self.shared.lock("shutdown");
            if state.closed {
                debug!(
                    target = "rasterd::pool",
                    op = "pool::shutdown",
                    result = "noop",
                    "Worker pool already closed"
                );
                return;
            }
            state.closed = true;
            state.ready = false;
            let waiting = state.waiters.len();
            state.waiters.clear();
            let idle: Vec<u64> = state.idle.iter().copied().collect();
            for generation in idle {
                state.retire(generation, "shutdown");
            }
            state.publish();
            info!(
                target = "rasterd::pool",
                op = "pool::shutdown",
                waiters_failed = waiting,
                leased = state.leased(),
                starting = state.starting,
                grace_ms = grace.as_millis() as u64,
                "Worker pool closing"
            );
        }
        self.shared.cancel.cancel();

        let grace_deadline = started + grace;
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let state = self.shared.lock("shutdown.drain");
                if state.leased() == 0 && state.starting == 0 {
                    break;
                }
            }
            if timeout_at(grace_deadline, drained).await.is_err() {
                break;
            }
        }

        let controls: Vec<ProcessControl> = {
            let mut state = self.shared.lock("shutdown.force");
            let overdue: Vec<u64> = state
                .workers
                .iter()
                .filter(|(_, handle)| handle.state() == WorkerState::Leased)
                .map(|(generation, _)| *generation)
                .collect();
            for generation in overdue {
                warn!(
                    target = "rasterd::pool",
                    op = "pool::shutdown",
                    generation,
                    "Lease outlived shutdown grace, killing worker"
                );
                state.retire(generation, "shutdown");
            }
            state
                .workers
                .values()
                .filter_map(|handle| handle.control().cloned())
                .collect()
        };

        let exits = join_all(controls.iter().map(ProcessControl::wait_exit));
        if timeout(EXIT_WAIT, exits).await.is_err() {
            warn!(
                target = "rasterd::pool",
                op = "pool::shutdown",
                "Some workers were not reaped in time"
            );
        }

        let mut state = self.shared.lock("shutdown.purge");
        state.workers.retain(|_, handle| !handle.is_purgeable());
        state.publish();
        info!(
            target = "rasterd::pool",
            op = "pool::shutdown",
            result = "closed",
            remaining = state.workers.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker pool shut down"
        );
    }
}
