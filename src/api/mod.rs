//! HTTP API server for sandboxd.
//!
//! Serves the websocket session endpoint plus status, validation, policy
//! and operator views.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! sandboxd serve --listen 127.0.0.1:8080
//!
//! # Check a command against the denylist
//! curl -X POST http://localhost:8080/api/v1/policy/check \
//!   -H "Content-Type: application/json" \
//!   -d '{"command": "ls -la"}'
//!
//! # Inspect a learner's sandbox
//! curl 'http://localhost:8080/api/v1/sandbox/status?user=alice&os=kali'
//! ```

pub mod error;
pub mod handlers;
pub mod state;
pub mod supervisor;
pub mod types;
pub mod validation;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::ApiState;

/// OpenAPI documentation for the sandboxd API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "sandboxd API",
        version = "0.1.0",
        description = "Per-learner container sandboxes behind a JSON terminal protocol.",
        license(name = "Apache-2.0", url = "https://www.apache.org/licenses/LICENSE-2.0")
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Sessions", description = "Websocket terminal sessions"),
        (name = "Sandboxes", description = "Sandbox status"),
        (name = "Validation", description = "Command validation"),
        (name = "Policy", description = "Command denylist"),
        (name = "Admin", description = "Operator views")
    ),
    paths(
        handlers::health::health,
        handlers::sandbox::connect,
        handlers::sandbox::status,
        handlers::validate::validate,
        handlers::validate::check_policy,
        handlers::admin::list_sessions,
        handlers::admin::list_commands,
        handlers::admin::list_containers,
    ),
    components(schemas(
        // Request types
        types::PolicyCheckRequest,
        crate::validation::ValidationRequest,
        // Response types
        types::HealthResponse,
        types::SandboxStatus,
        types::PolicyCheckResponse,
        types::SessionsResponse,
        types::CommandsResponse,
        types::ContainersResponse,
        types::ApiErrorResponse,
        crate::telemetry::AuditLogEntry,
        crate::telemetry::ActiveSession,
        sandboxd_protocol::ValidationResult,
    ))
)]
pub struct ApiDoc;

/// Timeout for plain request/response endpoints. Websocket sessions are
/// long-lived and are not covered.
const API_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Create the API router with all endpoints.
///
/// `cors_origins` specifies allowed CORS origins. If empty, defaults to
/// localhost:8080 and localhost:3000 (both http and 127.0.0.1 variants).
pub fn create_router(state: Arc<ApiState>, cors_origins: Vec<String>) -> Router {
    // Health check route
    let health_route = Router::new().route("/health", get(handlers::health::health));

    // Websocket routes (no timeout - sessions stay open)
    let session_routes = Router::new()
        .route("/ws/sandbox", get(handlers::sandbox::connect))
        .route("/sandbox/exec", get(handlers::sandbox::connect));

    // API v1 routes
    let api_v1 = Router::new()
        .route("/sandbox/status", get(handlers::sandbox::status))
        .route("/validate", post(handlers::validate::validate))
        .route("/policy/check", post(handlers::validate::check_policy))
        .route("/admin/sessions", get(handlers::admin::list_sessions))
        .route("/admin/commands", get(handlers::admin::list_commands))
        .route("/admin/containers", get(handlers::admin::list_containers))
        .layer(TimeoutLayer::new(Duration::from_secs(
            API_REQUEST_TIMEOUT_SECS,
        )));

    let origins = parse_origins(&cors_origins);
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static(validation::USER_HEADER),
        ])
        .allow_credentials(true);

    // Combine all routes
    Router::new()
        .merge(health_route)
        .merge(session_routes)
        .nest("/api/v1", api_v1)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS origins: configured ones, or localhost defaults.
fn parse_origins(cors_origins: &[String]) -> Vec<axum::http::HeaderValue> {
    let default_origins = || {
        [
            "http://localhost:8080",
            "http://127.0.0.1:8080",
            "http://localhost:3000",
            "http://127.0.0.1:3000",
        ]
        .into_iter()
        .map(axum::http::HeaderValue::from_static)
        .collect::<Vec<_>>()
    };

    if cors_origins.is_empty() {
        return default_origins();
    }

    let mut valid = Vec::new();
    for origin in cors_origins {
        match origin.parse() {
            Ok(v) => valid.push(v),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "invalid CORS origin, skipping");
            }
        }
    }
    if valid.is_empty() {
        tracing::warn!("no valid CORS origins provided, falling back to defaults");
        default_origins()
    } else {
        valid
    }
}
