use std::{borrow::Cow, error::Error as StdError};

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::render::RenderError, domain::error::DomainError, infra::error::InfraError,
    pool::PoolError, worker::WorkerError,
};

/// Diagnostic attached to error responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Plain-text error response with a separate internal report.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: Cow<'static, str>,
    retry_after: Option<u64>,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: impl Into<Cow<'static, str>>,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message: public_message.into(),
            retry_after: None,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: impl Into<Cow<'static, str>>,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message: public_message.into(),
            retry_after: None,
            report,
        }
    }

    /// Ask the client to come back after `seconds`.
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn public_message(&self) -> &str {
        &self.public_message
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message.into_owned()).into_response();
        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        self.report.attach(&mut response);
        response
    }
}

const RENDER_ERROR_SOURCE: &str = "application::render::RenderError";
/// Seconds a client should wait after the pool turned it away.
const BUSY_RETRY_AFTER_SECS: u64 = 1;

impl From<RenderError> for HttpError {
    fn from(error: RenderError) -> Self {
        match &error {
            RenderError::InvalidRequest(DomainError::Validation { message }) => {
                HttpError::from_error(
                    RENDER_ERROR_SOURCE,
                    StatusCode::BAD_REQUEST,
                    format!("err: {message}"),
                    &error,
                )
            }
            RenderError::Pool(PoolError::Timeout { .. } | PoolError::Exhausted) => {
                HttpError::from_error(
                    RENDER_ERROR_SOURCE,
                    StatusCode::SERVICE_UNAVAILABLE,
                    "pdfium err: no rendering worker available",
                    &error,
                )
                .with_retry_after(BUSY_RETRY_AFTER_SECS)
            }
            RenderError::Pool(PoolError::PoolClosed) => HttpError::from_error(
                RENDER_ERROR_SOURCE,
                StatusCode::SERVICE_UNAVAILABLE,
                "pdfium err: service is shutting down",
                &error,
            ),
            RenderError::Pool(PoolError::InvalidConfig(_)) => HttpError::from_error(
                RENDER_ERROR_SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "pdfium err: service misconfigured",
                &error,
            ),
            RenderError::Worker(err @ (WorkerError::Open(_) | WorkerError::Render(_))) => {
                HttpError::from_error(
                    RENDER_ERROR_SOURCE,
                    StatusCode::BAD_REQUEST,
                    format!("pdfium err: {err}"),
                    &error,
                )
            }
            RenderError::Worker(WorkerError::Crashed { .. }) => HttpError::from_error(
                RENDER_ERROR_SOURCE,
                StatusCode::BAD_GATEWAY,
                "pdfium err: rendering worker crashed",
                &error,
            ),
            RenderError::Worker(WorkerError::Timeout { .. }) => HttpError::from_error(
                RENDER_ERROR_SOURCE,
                StatusCode::GATEWAY_TIMEOUT,
                "pdfium err: rendering timed out",
                &error,
            ),
            RenderError::Worker(WorkerError::Protocol { .. }) => HttpError::from_error(
                RENDER_ERROR_SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "pdfium err: internal error",
                &error,
            ),
        }
    }
}

/// Errors that end the process.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer failure")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn report_collects_the_source_chain() {
        let err = Outer(std::io::Error::other("disk on fire"));
        let report = ErrorReport::from_error("tests", StatusCode::INTERNAL_SERVER_ERROR, &err);
        assert_eq!(report.messages, vec!["outer failure", "disk on fire"]);
    }

    #[test]
    fn http_error_sets_retry_after_and_report() {
        let response = HttpError::new(
            "tests",
            StatusCode::SERVICE_UNAVAILABLE,
            "busy",
            "no worker available",
        )
        .with_retry_after(2)
        .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
            Some("2")
        );
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert_eq!(report.messages, vec!["no worker available"]);
    }

    #[test]
    fn render_errors_map_to_statuses() {
        let cases = [
            (
                RenderError::InvalidRequest(DomainError::validation("dpi must be a positive integer, got 0")),
                StatusCode::BAD_REQUEST,
                "err: dpi must be a positive integer, got 0",
            ),
            (
                RenderError::Worker(WorkerError::Open("invalid xref table".into())),
                StatusCode::BAD_REQUEST,
                "pdfium err: document could not be opened: invalid xref table",
            ),
            (
                RenderError::Pool(PoolError::Exhausted),
                StatusCode::SERVICE_UNAVAILABLE,
                "pdfium err: no rendering worker available",
            ),
            (
                RenderError::Pool(PoolError::PoolClosed),
                StatusCode::SERVICE_UNAVAILABLE,
                "pdfium err: service is shutting down",
            ),
            (
                RenderError::Worker(WorkerError::crashed("render_page", "output channel closed")),
                StatusCode::BAD_GATEWAY,
                "pdfium err: rendering worker crashed",
            ),
            (
                RenderError::Worker(WorkerError::Timeout {
                    operation: "render_page",
                    timeout: std::time::Duration::from_secs(60),
                }),
                StatusCode::GATEWAY_TIMEOUT,
                "pdfium err: rendering timed out",
            ),
        ];

        for (error, status, message) in cases {
            let http = HttpError::from(error);
            assert_eq!(http.status(), status);
            assert_eq!(http.public_message(), message);
        }
    }

    #[test]
    fn busy_pool_asks_clients_to_retry() {
        let response = HttpError::from(RenderError::Pool(PoolError::Timeout {
            waited: std::time::Duration::from_secs(30),
            last_spawn_error: None,
        }))
        .into_response();
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }
}
