use std::time::Duration;

use crate::worker::WorkerCommand;

use super::error::PoolError;

/// Sizing and timing policy for a [`super::WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers kept warm and idle at all times.
    pub min_idle: usize,
    /// Idle workers above this count are retired, oldest first.
    pub max_idle: usize,
    /// Hard cap on live processes, including starting and dying ones.
    pub max_total: usize,
    pub command: WorkerCommand,
    pub startup_timeout: Duration,
    pub lease_timeout: Duration,
    pub idle_timeout: Duration,
    pub maintenance_interval: Duration,
    /// Callers allowed to queue for a worker before acquire fails fast.
    pub max_waiters: usize,
    pub spawn_backoff_initial: Duration,
    pub spawn_backoff_max: Duration,
}

impl PoolConfig {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            min_idle: 4,
            max_idle: 4,
            max_total: 4,
            command,
            startup_timeout: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(180),
            idle_timeout: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(1),
            max_waiters: 64,
            spawn_backoff_initial: Duration::from_millis(500),
            spawn_backoff_max: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_idle > self.max_idle {
            return Err(invalid(format!(
                "min_idle ({}) must not exceed max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        if self.max_idle > self.max_total {
            return Err(invalid(format!(
                "max_idle ({}) must not exceed max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if self.command.program.as_os_str().is_empty() {
            return Err(invalid("worker program must not be empty"));
        }

        for (name, value) in [
            ("startup_timeout", self.startup_timeout),
            ("lease_timeout", self.lease_timeout),
            ("idle_timeout", self.idle_timeout),
            ("maintenance_interval", self.maintenance_interval),
            ("spawn_backoff_initial", self.spawn_backoff_initial),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }

        if self.spawn_backoff_initial > self.spawn_backoff_max {
            return Err(invalid(format!(
                "spawn_backoff_initial ({:?}) must not exceed spawn_backoff_max ({:?})",
                self.spawn_backoff_initial, self.spawn_backoff_max
            )));
        }

        Ok(())
    }

    /// Delay before the next spawn attempt after `failures` consecutive failures.
    pub(crate) fn spawn_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.spawn_backoff_initial
            .saturating_mul(1_u32 << exponent)
            .min(self.spawn_backoff_max)
    }
}

fn invalid(reason: impl Into<String>) -> PoolError {
    PoolError::InvalidConfig(reason.into())
}
