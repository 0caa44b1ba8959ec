use std::{fmt, sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::worker::{DocumentRef, RenderedPage, WorkerError, WorkerProcess};

use super::{Grant, Shared};

/// How a lease holder judged the worker when handing it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Healthy,
    Unhealthy,
}

/// Exclusive checkout of one worker.
///
/// Dropping a lease without calling [`Lease::release`] destroys the worker.
#[must_use = "a dropped lease destroys its worker"]
pub struct Lease {
    shared: Arc<Shared>,
    generation: u64,
    process: Option<WorkerProcess>,
    acquired_at: Instant,
    deadline: Instant,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("generation", &self.generation)
            .field("pid", &self.pid())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Lease {
    pub(super) fn new(shared: Arc<Shared>, grant: Grant) -> Self {
        Self {
            shared,
            generation: grant.generation,
            process: Some(grant.process),
            acquired_at: grant.window.acquired_at,
            deadline: grant.window.deadline,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(WorkerProcess::pid)
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Past this instant the pool kills the worker.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn open_document(
        &mut self,
        document: &[u8],
        timeout: Duration,
    ) -> Result<DocumentRef, WorkerError> {
        self.process("open_document")?
            .open_document(document, timeout)
            .await
    }

    pub async fn render_page(
        &mut self,
        document: &DocumentRef,
        page_index: u32,
        dpi: u32,
        quality: u8,
        timeout: Duration,
    ) -> Result<RenderedPage, WorkerError> {
        self.process("render_page")?
            .render_page(document, page_index, dpi, quality, timeout)
            .await
    }

    pub async fn close_document(
        &mut self,
        document: &DocumentRef,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        self.process("close_document")?
            .close_document(document, timeout)
            .await
    }

    pub fn release(mut self, outcome: LeaseOutcome) {
        self.finish(outcome);
    }

    fn process(&mut self, operation: &'static str) -> Result<&mut WorkerProcess, WorkerError> {
        self.process
            .as_mut()
            .ok_or_else(|| WorkerError::crashed(operation, "lease no longer holds a worker"))
    }

    fn finish(&mut self, outcome: LeaseOutcome) {
        if let Some(process) = self.process.take() {
            self.shared
                .give_back(self.generation, process, outcome, self.acquired_at.elapsed());
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.finish(LeaseOutcome::Unhealthy);
    }
}
