//! Validation and policy helper handlers.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sandboxd_protocol::ValidationResult;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{ApiErrorResponse, PolicyCheckRequest, PolicyCheckResponse};
use crate::validation::ValidationRequest;

/// Judge a command/output pair.
///
/// Runs the same validator a live session would. 204 means no validator
/// applies to the activity.
#[utoipa::path(
    post,
    path = "/api/v1/validate",
    tag = "Validation",
    request_body = ValidationRequest,
    responses(
        (status = 200, description = "Validator verdict", body = ValidationResult),
        (status = 204, description = "No validator for this activity"),
        (status = 400, description = "Invalid request", body = ApiErrorResponse)
    )
)]
pub async fn validate(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ValidationRequest>,
) -> Result<Response, ApiError> {
    if request.activity.trim().is_empty() {
        return Err(ApiError::BadRequest("activity cannot be empty".into()));
    }

    match state.validation().validate(request).await {
        Some(result) => Ok(Json(result).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Check a command against the denylist.
#[utoipa::path(
    post,
    path = "/api/v1/policy/check",
    tag = "Policy",
    request_body = PolicyCheckRequest,
    responses(
        (status = 200, description = "Command allowed", body = PolicyCheckResponse),
        (status = 403, description = "Command denied", body = ApiErrorResponse)
    )
)]
pub async fn check_policy(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<PolicyCheckRequest>,
) -> Result<Json<PolicyCheckResponse>, ApiError> {
    if state.policy().is_allowed(&request.command) {
        Ok(Json(PolicyCheckResponse { allowed: true }))
    } else {
        Err(ApiError::denied(request.command.trim()))
    }
}

#[cfg(test)]
mod tests {
    use crate::api::create_router;
    use crate::api::state::tests::test_state;
    use crate::error::Result;
    use crate::validation::ValidationRequest;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use sandboxd_protocol::ValidationResult;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn post_json(
        app: axum::Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_policy_check() {
        let t = test_state(Duration::from_secs(60));
        let app = create_router(t.state.clone(), Vec::new());

        let (status, body) = post_json(
            app.clone(),
            "/api/v1/policy/check",
            serde_json::json!({"command": "ls -la"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["allowed"], true);

        let (status, body) = post_json(
            app,
            "/api/v1/policy/check",
            serde_json::json!({"command": "rm -rf /"}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "[denied] rm -rf /");
    }

    #[tokio::test]
    async fn test_validate_verdict_and_no_opinion() {
        let t = test_state(Duration::from_secs(60));
        t.state.validation().register(
            "lab",
            Some("one"),
            Arc::new(|req: &ValidationRequest| -> Result<Option<ValidationResult>> {
                Ok(Some(if req.output.contains("root") {
                    ValidationResult::passed()
                } else {
                    ValidationResult::failed("Run whoami as root.")
                }))
            }),
        );
        let app = create_router(t.state.clone(), Vec::new());

        let (status, body) = post_json(
            app.clone(),
            "/api/v1/validate",
            serde_json::json!({"activity": "lab", "chapter": "one", "command": "whoami", "output": "root\n"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let result: ValidationResult = serde_json::from_slice(&body).unwrap();
        assert_eq!(result, ValidationResult::passed());

        let (status, body) = post_json(
            app,
            "/api/v1/validate",
            serde_json::json!({"activity": "elsewhere", "command": "whoami"}),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }
}
