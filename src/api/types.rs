//! JSON request and response types for the API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::{IntoParams, ToSchema};

use crate::config::{ContainerKind, ContainerRecord, Readiness, RecordState};
use crate::os::truncate_id;
use crate::telemetry::{ActiveSession, AuditLogEntry};

// ============================================================================
// Health
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status: "ok", or "degraded" when the runtime is unreachable.
    #[schema(example = "ok")]
    pub status: &'static str,
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: &'static str,
    /// Whether the container runtime answered a ping.
    pub runtime_reachable: bool,
    /// Runtime error, when unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_error: Option<String>,
}

// ============================================================================
// Sandbox Status
// ============================================================================

/// Query for the sandbox status endpoint.
#[derive(Debug, Deserialize, IntoParams)]
pub struct StatusQuery {
    /// Owner username.
    #[param(example = "alice")]
    pub user: String,
    /// Requested flavor (`kali`, `windows`, `macos`). Defaults to `kali`.
    #[serde(default)]
    #[param(example = "kali")]
    pub os: Option<String>,
}

/// Redacted view of a container record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    /// Owner username.
    pub owner: String,
    /// Requested flavor.
    #[schema(example = "windows")]
    pub requested_os: String,
    /// Flavor actually running.
    #[schema(example = "kali")]
    pub os: String,
    /// Container id, truncated to 12 characters.
    #[schema(example = "3f2a9c1b7d4e")]
    pub container: String,
    /// Image reference.
    pub image: String,
    /// Record state.
    #[schema(value_type = String, example = "running")]
    pub state: RecordState,
    /// How the flavor is provided.
    #[schema(value_type = String, example = "fallback")]
    pub kind: ContainerKind,
    /// Requested flavor when a fallback was substituted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<String>,
    /// Readiness flags.
    #[schema(value_type = Object)]
    pub readiness: Readiness,
    /// Published ports by service name.
    pub ports: BTreeMap<String, u16>,
    /// Whether the container pre-existed and was re-attached.
    pub adopted: bool,
    /// Creation time (unix seconds).
    pub created_at: u64,
    /// Last use (unix seconds).
    pub last_used_at: u64,
}

impl From<&ContainerRecord> for SandboxStatus {
    fn from(record: &ContainerRecord) -> Self {
        Self {
            owner: record.owner.clone(),
            requested_os: record.requested_os().as_str().to_string(),
            os: record.os.as_str().to_string(),
            container: truncate_id(&record.id).to_string(),
            image: record.image.clone(),
            state: record.state,
            kind: record.kind,
            fallback_from: record.fallback_from.map(|os| os.as_str().to_string()),
            readiness: record.readiness,
            ports: record.ports.clone(),
            adopted: record.adopted,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
        }
    }
}

/// Query for the websocket endpoint.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ConnectQuery {
    /// Flavor to start with instead of the stored preference.
    #[serde(default)]
    pub os: Option<String>,
}

// ============================================================================
// Policy
// ============================================================================

/// Request to check a command against the denylist.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PolicyCheckRequest {
    /// Command line as typed.
    #[schema(example = "ls -la")]
    pub command: String,
}

/// Policy check result for an allowed command.
#[derive(Debug, Serialize, ToSchema)]
pub struct PolicyCheckResponse {
    /// Always true; denied commands are answered with 403.
    pub allowed: bool,
}

// ============================================================================
// Admin
// ============================================================================

/// Active sessions.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionsResponse {
    /// Live sessions, oldest first.
    pub sessions: Vec<ActiveSession>,
}

/// Query for the recent commands view.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct CommandsQuery {
    /// Restrict to one user.
    #[serde(default)]
    pub user: Option<String>,
    /// Read this many entries from the durable audit log instead of the
    /// in-memory recent list.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Recent commands.
#[derive(Debug, Serialize, ToSchema)]
pub struct CommandsResponse {
    /// Entries, newest first.
    pub commands: Vec<AuditLogEntry>,
}

/// Registered containers.
#[derive(Debug, Serialize, ToSchema)]
pub struct ContainersResponse {
    /// Redacted records.
    pub containers: Vec<SandboxStatus>,
}

// ============================================================================
// Error Types
// ============================================================================

/// API error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorResponse {
    /// Error message.
    #[schema(example = "no sandbox for alice (kali)")]
    pub error: String,
    /// Error code.
    #[schema(example = "NOT_FOUND")]
    pub code: String,
}
