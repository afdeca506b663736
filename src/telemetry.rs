//! Audit log and live session bookkeeping.
//!
//! Every command decision (allowed or denied) becomes an [`AuditLogEntry`].
//! Entries go to the append-only redb audit table and to a short per-user
//! list of recent commands kept in memory for the admin views.

use crate::config::now_secs;
use crate::db::SandboxDb;
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// One audited command decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// Username.
    pub user_id: String,
    /// Flavor the session targeted.
    pub os: String,
    /// Command as submitted.
    pub cmd: String,
    /// Whether the policy allowed it.
    pub allowed: bool,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Exit code, for one-shot executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Wall time of the execution in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A connected session as seen by the admin views.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    /// Telemetry session id.
    pub id: u64,
    /// Username.
    pub username: String,
    /// Current flavor.
    pub os: String,
    /// Current activity, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    /// Connect time, unix seconds.
    pub started_at: u64,
    /// Last inbound message, unix seconds.
    pub last_seen_at: u64,
}

/// Audit sink and session tracker shared by all connections.
#[derive(Debug)]
pub struct Telemetry {
    db: Option<SandboxDb>,
    sessions: RwLock<HashMap<u64, ActiveSession>>,
    next_session: AtomicU64,
    recent: Mutex<HashMap<String, VecDeque<AuditLogEntry>>>,
    recent_limit: usize,
}

impl Telemetry {
    /// Create a sink. `recent_limit` caps the per-user recent command list.
    pub fn new(db: Option<SandboxDb>, recent_limit: usize) -> Self {
        Self {
            db,
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            recent: Mutex::new(HashMap::new()),
            recent_limit: recent_limit.max(1),
        }
    }

    /// Record a command decision. Persistence failures are logged.
    pub fn record(&self, entry: AuditLogEntry) {
        tracing::info!(
            user = %entry.user_id,
            os = %entry.os,
            allowed = entry.allowed,
            exit_code = ?entry.exit_code,
            cmd = %entry.cmd,
            "command audited"
        );

        if let Some(db) = &self.db {
            if let Err(e) = db.append_audit(&entry) {
                tracing::warn!(user = %entry.user_id, error = %e, "failed to persist audit entry");
            }
        }

        let mut recent = self.recent.lock();
        let list = recent.entry(entry.user_id.clone()).or_default();
        list.push_front(entry);
        list.truncate(self.recent_limit);
    }

    /// Recent commands, newest first. `user` restricts to one username.
    pub fn recent_commands(&self, user: Option<&str>) -> Vec<AuditLogEntry> {
        let recent = self.recent.lock();
        let mut entries: Vec<AuditLogEntry> = match user {
            Some(user) => recent
                .get(user)
                .map(|list| list.iter().cloned().collect())
                .unwrap_or_default(),
            None => recent.values().flat_map(|l| l.iter().cloned()).collect(),
        };
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }

    /// Most recent persisted audit entries, newest first.
    pub fn audit_tail(&self, limit: usize) -> Result<Vec<AuditLogEntry>> {
        match &self.db {
            Some(db) => db.recent_audit(limit),
            None => Ok(self.recent_commands(None).into_iter().take(limit).collect()),
        }
    }

    /// Register a connected session and return its id.
    pub fn begin_session(&self, username: &str, os: &str) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let now = now_secs();
        self.sessions.write().insert(
            id,
            ActiveSession {
                id,
                username: username.to_string(),
                os: os.to_string(),
                activity: None,
                started_at: now,
                last_seen_at: now,
            },
        );
        id
    }

    /// Update a session's last-seen time and, when given, its flavor and activity.
    pub fn touch(&self, id: u64, os: Option<&str>, activity: Option<Option<&str>>) {
        if let Some(session) = self.sessions.write().get_mut(&id) {
            session.last_seen_at = now_secs();
            if let Some(os) = os {
                session.os = os.to_string();
            }
            if let Some(activity) = activity {
                session.activity = activity.map(str::to_string);
            }
        }
    }

    /// Forget a session.
    pub fn end_session(&self, id: u64) {
        self.sessions.write().remove(&id);
    }

    /// Connected sessions, oldest first.
    pub fn active_sessions(&self) -> Vec<ActiveSession> {
        let mut sessions: Vec<ActiveSession> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|s| (s.started_at, s.id));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, cmd: &str, ts: i64) -> AuditLogEntry {
        AuditLogEntry {
            user_id: user.to_string(),
            os: "kali".to_string(),
            cmd: cmd.to_string(),
            allowed: true,
            timestamp: ts,
            exit_code: None,
            duration_ms: None,
        }
    }

    #[test]
    fn test_recent_commands_are_capped_per_user() {
        let telemetry = Telemetry::new(None, 2);
        telemetry.record(entry("alice", "ls", 1));
        telemetry.record(entry("alice", "pwd", 2));
        telemetry.record(entry("alice", "id", 3));
        telemetry.record(entry("bob", "whoami", 4));

        let alice = telemetry.recent_commands(Some("alice"));
        assert_eq!(
            alice.iter().map(|e| e.cmd.as_str()).collect::<Vec<_>>(),
            vec!["id", "pwd"]
        );
        assert_eq!(telemetry.recent_commands(None)[0].cmd, "whoami");
        assert!(telemetry.recent_commands(Some("carol")).is_empty());
    }

    #[test]
    fn test_record_persists_to_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = SandboxDb::open_at(&dir.path().join("db.redb")).unwrap();
        let telemetry = Telemetry::new(Some(db.clone()), 20);

        let mut denied = entry("alice", "reboot", 5);
        denied.allowed = false;
        telemetry.record(denied);

        let tail = telemetry.audit_tail(10).unwrap();
        assert_eq!(tail.len(), 1);
        assert!(!tail[0].allowed);
        assert_eq!(db.recent_audit(10).unwrap(), tail);
    }

    #[test]
    fn test_session_lifecycle() {
        let telemetry = Telemetry::new(None, 20);
        let a = telemetry.begin_session("alice", "kali");
        let b = telemetry.begin_session("bob", "windows");
        assert_ne!(a, b);

        telemetry.touch(a, Some("macos"), Some(Some("intro")));
        let sessions = telemetry.active_sessions();
        assert_eq!(sessions.len(), 2);
        let alice = sessions.iter().find(|s| s.id == a).unwrap();
        assert_eq!(alice.os, "macos");
        assert_eq!(alice.activity.as_deref(), Some("intro"));

        telemetry.end_session(a);
        assert_eq!(telemetry.active_sessions().len(), 1);
    }

    #[test]
    fn test_audit_entry_wire_format() {
        let mut e = entry("alice", "ls", 7);
        e.exit_code = Some(0);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["exitCode"], 0);
        assert!(json.get("durationMs").is_none());
    }
}
