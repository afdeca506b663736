//! Operator views over telemetry and the registry.

use axum::{
    extract::{Query, State},
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{
    ApiErrorResponse, CommandsQuery, CommandsResponse, ContainersResponse, SandboxStatus,
    SessionsResponse,
};

/// Upper bound for audit log reads.
const MAX_AUDIT_READ: usize = 1000;

/// List connected sessions.
#[utoipa::path(
    get,
    path = "/api/v1/admin/sessions",
    tag = "Admin",
    responses(
        (status = 200, description = "Active sessions", body = SessionsResponse)
    )
)]
pub async fn list_sessions(State(state): State<Arc<ApiState>>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.telemetry().active_sessions(),
    })
}

/// Recent commands, newest first.
///
/// Without `limit`, reads the in-memory recent list (20 per user). With
/// `limit`, reads the durable audit log.
#[utoipa::path(
    get,
    path = "/api/v1/admin/commands",
    tag = "Admin",
    params(CommandsQuery),
    responses(
        (status = 200, description = "Recent commands", body = CommandsResponse),
        (status = 500, description = "Audit log unreadable", body = ApiErrorResponse)
    )
)]
pub async fn list_commands(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<CommandsQuery>,
) -> Result<Json<CommandsResponse>, ApiError> {
    let commands = match query.limit {
        Some(limit) => {
            let limit = limit.min(MAX_AUDIT_READ);
            let state = state.clone();
            let mut entries = tokio::task::spawn_blocking(move || state.telemetry().audit_tail(limit))
                .await?
                .map_err(ApiError::database)?;
            if let Some(user) = &query.user {
                entries.retain(|e| &e.user_id == user);
            }
            entries
        }
        None => state.telemetry().recent_commands(query.user.as_deref()),
    };
    Ok(Json(CommandsResponse { commands }))
}

/// Registered containers.
#[utoipa::path(
    get,
    path = "/api/v1/admin/containers",
    tag = "Admin",
    responses(
        (status = 200, description = "Registered containers", body = ContainersResponse)
    )
)]
pub async fn list_containers(State(state): State<Arc<ApiState>>) -> Json<ContainersResponse> {
    Json(ContainersResponse {
        containers: state
            .registry()
            .list()
            .iter()
            .map(SandboxStatus::from)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use crate::api::create_router;
    use crate::api::state::tests::test_state;
    use crate::config::now_millis;
    use crate::os::OsFlavor;
    use crate::telemetry::AuditLogEntry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get_json(app: axum::Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn entry(user: &str, cmd: &str, allowed: bool) -> AuditLogEntry {
        AuditLogEntry {
            user_id: user.to_string(),
            os: "kali".to_string(),
            cmd: cmd.to_string(),
            allowed,
            timestamp: now_millis(),
            exit_code: None,
            duration_ms: None,
        }
    }

    #[tokio::test]
    async fn test_admin_views() {
        let t = test_state(Duration::from_secs(60));
        let telemetry = t.state.telemetry();
        let id = telemetry.begin_session("alice", "kali");
        telemetry.record(entry("alice", "ls", true));
        telemetry.record(entry("bob", "reboot", false));
        t.state
            .registry()
            .ensure_container("alice", OsFlavor::Kali)
            .await
            .unwrap();
        let app = create_router(t.state.clone(), Vec::new());

        let sessions = get_json(app.clone(), "/api/v1/admin/sessions").await;
        assert_eq!(sessions["sessions"][0]["username"], "alice");

        let commands = get_json(app.clone(), "/api/v1/admin/commands?user=bob").await;
        assert_eq!(commands["commands"].as_array().unwrap().len(), 1);
        assert_eq!(commands["commands"][0]["cmd"], "reboot");

        let durable = get_json(app.clone(), "/api/v1/admin/commands?limit=10").await;
        assert_eq!(durable["commands"].as_array().unwrap().len(), 2);
        assert_eq!(t.db.recent_audit(10).unwrap().len(), 2);

        let containers = get_json(app, "/api/v1/admin/containers").await;
        assert_eq!(containers["containers"][0]["owner"], "alice");

        telemetry.end_session(id);
        assert!(telemetry.active_sessions().is_empty());
    }
}
