//! Health check handler.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::state::ApiState;
use crate::api::types::HealthResponse;

/// Health check endpoint.
///
/// Reports the server version and whether the container runtime answers.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Server is running", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let (status, runtime_reachable, runtime_error) = match state.runtime().ping().await {
        Ok(()) => ("ok", true, None),
        Err(e) => {
            tracing::warn!(error = %e, "container runtime unreachable");
            ("degraded", false, Some(e.to_string()))
        }
    };

    Json(HealthResponse {
        status,
        version: crate::VERSION,
        runtime_reachable,
        runtime_error,
    })
}
