//! API error types with HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;

use crate::error::{Error, RuntimeErrorKind};

/// API error type with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found (404).
    NotFound(String),
    /// Conflict - resource already exists or invalid state (409).
    Conflict(String),
    /// Bad request - invalid input (400).
    BadRequest(String),
    /// Refused by policy (403).
    Forbidden(String),
    /// Container engine unreachable or provisioning impossible (503).
    Unavailable(String),
    /// Request timeout (408).
    Timeout,
    /// Internal server error (500).
    Internal(String),
}

impl ApiError {
    /// Convert any displayable error to an internal API error.
    pub fn internal(err: impl Display) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap a database-layer error with a consistent message prefix.
    pub fn database(err: impl Display) -> Self {
        Self::Internal(format!("database error: {}", err))
    }

    /// The `[denied] <cmd>` refusal.
    pub fn denied(command: &str) -> Self {
        Self::Forbidden(format!("[denied] {}", command))
    }
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "DENIED", msg),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg)
            }
            ApiError::Timeout => (
                StatusCode::REQUEST_TIMEOUT,
                "TIMEOUT",
                "request timed out".to_string(),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match &err {
            Error::PolicyDenied { command } => ApiError::denied(command),
            Error::ProtocolMalformed(reason) => ApiError::BadRequest(reason.clone()),
            Error::ProvisioningFailed { .. } => ApiError::Unavailable(err.to_string()),
            Error::Timeout { .. } => ApiError::Timeout,
            Error::Database { .. } => ApiError::database(&err),
            // Structured runtime errors map by kind
            Error::Runtime { reason, kind, .. } => match kind {
                RuntimeErrorKind::NotFound => ApiError::NotFound(reason.clone()),
                RuntimeErrorKind::Conflict => ApiError::Conflict(reason.clone()),
                RuntimeErrorKind::Unavailable => ApiError::Unavailable(reason.clone()),
                _ => ApiError::Internal(err.to_string()),
            },
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("task failed: {}", err))
    }
}
