//! The pool's bookkeeping record for one worker.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::worker::{ProcessControl, WorkerProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Idle,
    Leased,
    Dead,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Leased => "leased",
            WorkerState::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LeaseWindow {
    pub(crate) acquired_at: Instant,
    pub(crate) deadline: Instant,
}

/// Read-only view of a worker handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub generation: u64,
    pub pid: Option<u32>,
    pub state: WorkerState,
}

/// A worker as the pool sees it.
///
/// The process itself sits here only while the worker is idle; a lease takes
/// it out and gives it back. `control` stays behind so the pool can always
/// kill the process.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    generation: u64,
    state: WorkerState,
    control: Option<ProcessControl>,
    process: Option<WorkerProcess>,
    spawned_at: Instant,
    last_heartbeat: Instant,
    lease: Option<LeaseWindow>,
}

impl WorkerHandle {
    pub(crate) fn starting(generation: u64, now: Instant) -> Self {
        Self {
            generation,
            state: WorkerState::Starting,
            control: None,
            process: None,
            spawned_at: now,
            last_heartbeat: now,
            lease: None,
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn lease_window(&self) -> Option<LeaseWindow> {
        self.lease
    }

    pub(crate) fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    pub(crate) fn control(&self) -> Option<&ProcessControl> {
        self.control.as_ref()
    }

    pub(crate) fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            generation: self.generation,
            pid: self.control.as_ref().map(ProcessControl::pid),
            state: self.state,
        }
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.control
            .as_ref()
            .is_some_and(ProcessControl::has_exited)
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.spawned_at)
    }

    /// Record the process that a Starting handle was waiting for.
    pub(crate) fn bind(&mut self, control: ProcessControl, spawned_at: Instant) {
        self.control = Some(control);
        self.spawned_at = spawned_at;
    }

    pub(crate) fn park(&mut self, process: WorkerProcess, now: Instant) {
        self.state = WorkerState::Idle;
        self.process = Some(process);
        self.last_heartbeat = now;
        self.lease = None;
    }

    pub(crate) fn mark_leased(&mut self, now: Instant, lease_timeout: Duration) -> LeaseWindow {
        let window = LeaseWindow {
            acquired_at: now,
            deadline: now + lease_timeout,
        };
        self.state = WorkerState::Leased;
        self.process = None;
        self.lease = Some(window);
        window
    }

    /// Idle → Leased, handing out the process.
    pub(crate) fn check_out(
        &mut self,
        now: Instant,
        lease_timeout: Duration,
    ) -> Option<(WorkerProcess, LeaseWindow)> {
        if self.state != WorkerState::Idle {
            return None;
        }
        let process = self.process.take()?;
        Some((process, self.mark_leased(now, lease_timeout)))
    }

    /// Any state → Dead. The process, wherever it currently lives, is killed.
    pub(crate) fn kill(&mut self) {
        if let Some(control) = &self.control {
            control.terminate();
        }
        self.process = None;
        self.lease = None;
        self.state = WorkerState::Dead;
    }

    /// Dead handles stay counted until their process has been reaped.
    pub(crate) fn is_purgeable(&self) -> bool {
        self.state == WorkerState::Dead
            && self.control.as_ref().is_none_or(ProcessControl::has_exited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_labels_match_their_serialized_form() {
        for state in [
            WorkerState::Starting,
            WorkerState::Idle,
            WorkerState::Leased,
            WorkerState::Dead,
        ] {
            let json = serde_json::to_value(state).expect("serialize state");
            assert_eq!(json, serde_json::Value::from(state.as_str()));
        }
    }
}
