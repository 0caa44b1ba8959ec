//! HTTP surface: multipart render endpoint plus liveness and readiness probes.

mod middleware;
mod probes;
mod render;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::render::RenderService;

pub use middleware::RequestContext;

/// Room left in the body limit for multipart boundaries and the small form fields.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct HttpState {
    pub render: Arc<RenderService>,
    pub max_document_bytes: usize,
}

impl HttpState {
    pub fn new(render: RenderService, max_document_bytes: usize) -> Self {
        Self {
            render: Arc::new(render),
            max_document_bytes,
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    let body_limit = state
        .max_document_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route(
            "/render",
            post(render::render_page).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/readyz", get(probes::readyz))
        .route("/livez", get(probes::livez))
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
