use std::{io, time::Duration};

use thiserror::Error;

/// A worker process could not be brought to the ready state.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to launch worker `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("worker {0} pipe was not captured")]
    MissingPipe(&'static str),
    #[error("worker did not report readiness within {0:?}")]
    StartupTimeout(Duration),
    #[error("worker reported startup failure: {0}")]
    StartupFailed(String),
    #[error("worker exited before reporting readiness")]
    Exited,
    #[error("unexpected worker handshake: {0}")]
    Handshake(String),
}

/// Failure of a single call against a running worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker call `{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("worker crashed during `{operation}`: {detail}")]
    Crashed {
        operation: &'static str,
        detail: String,
    },
    #[error("worker protocol error during `{operation}`: {detail}")]
    Protocol {
        operation: &'static str,
        detail: String,
    },
    #[error("document could not be opened: {0}")]
    Open(String),
    #[error("page could not be rendered: {0}")]
    Render(String),
}

impl WorkerError {
    pub(crate) fn crashed(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::Crashed {
            operation,
            detail: detail.into(),
        }
    }

    pub(crate) fn protocol(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::Protocol {
            operation,
            detail: detail.into(),
        }
    }

    /// True when the engine rejected the input rather than the worker failing.
    pub fn is_document_error(&self) -> bool {
        matches!(self, WorkerError::Open(_) | WorkerError::Render(_))
    }
}
