use std::time::Duration;

use thiserror::Error;

/// Failure to obtain or manage a worker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error("no worker became available within {waited:?}{}", spawn_detail(.last_spawn_error))]
    Timeout {
        waited: Duration,
        last_spawn_error: Option<String>,
    },
    #[error("worker pool is exhausted")]
    Exhausted,
    #[error("worker pool is closed")]
    PoolClosed,
}

impl PoolError {
    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Timeout { .. } | PoolError::Exhausted)
    }
}

fn spawn_detail(last_spawn_error: &Option<String>) -> String {
    match last_spawn_error {
        Some(err) => format!(" (last spawn error: {err})"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_mentions_last_spawn_error() {
        let err = PoolError::Timeout {
            waited: Duration::from_millis(250),
            last_spawn_error: Some("worker reported startup failure: no pdfium".to_string()),
        };
        let message = err.to_string();
        assert!(message.starts_with("no worker became available within 250ms"));
        assert!(message.contains("no pdfium"));
        assert!(err.is_retryable());
    }

    #[test]
    fn closed_and_invalid_pools_are_final() {
        assert!(!PoolError::PoolClosed.is_retryable());
        assert!(!PoolError::InvalidConfig("min_idle".into()).is_retryable());
        assert!(PoolError::Exhausted.is_retryable());
    }
}
