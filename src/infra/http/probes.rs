use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::application::error::ErrorReport;

use super::HttpState;

/// 200 once the pool has reached its warm size, 503 before that and after shutdown.
pub(super) async fn readyz(State(state): State<HttpState>) -> Response {
    let snapshot = state.render.pool().readiness();
    if snapshot.ready {
        return (StatusCode::OK, Json(snapshot)).into_response();
    }

    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(snapshot)).into_response();
    ErrorReport::from_message(
        "infra::http::readyz",
        StatusCode::SERVICE_UNAVAILABLE,
        format!(
            "worker pool not ready: {} idle, {} starting, {} total",
            snapshot.idle, snapshot.starting, snapshot.total
        ),
    )
    .attach(&mut response);
    response
}

pub(super) async fn livez() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
