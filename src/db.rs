//! Database module for persistent state storage.
//!
//! redb holds everything that must survive a restart: container records
//! (so a restarted server re-attaches instead of duplicating), the
//! append-only audit log, preferred flavors, and earned achievements.

use crate::config::ContainerRecord;
use crate::error::{Error, Result};
use crate::telemetry::AuditLogEntry;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Container records (`owner::flavor` -> JSON ContainerRecord).
const CONTAINERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Audit log (sequence number -> JSON AuditLogEntry).
const AUDIT_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_logs");

/// Preferred flavor per user.
const PREFERENCES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("preferences");

/// Achievements per user (username -> JSON array).
const ACHIEVEMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("achievements");

/// Thread-safe database handle for sandboxd state.
#[derive(Clone)]
pub struct SandboxDb {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for SandboxDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SandboxDb {
    /// Open the database at a specific path.
    ///
    /// Creates parent directories and tables if they don't exist.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::database("create directory", e.to_string()))?;
        }

        let db = Database::create(path)
            .map_err(|e| Error::database("open", format!("{}: {}", path.display(), e)))?;

        let instance = Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        };
        instance.init_tables()?;
        Ok(instance)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_tables(&self) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::database("begin write", e.to_string()))?;

        write_txn
            .open_table(CONTAINERS_TABLE)
            .map_err(|e| Error::database("create containers table", e.to_string()))?;
        write_txn
            .open_table(AUDIT_TABLE)
            .map_err(|e| Error::database("create audit table", e.to_string()))?;
        write_txn
            .open_table(PREFERENCES_TABLE)
            .map_err(|e| Error::database("create preferences table", e.to_string()))?;
        write_txn
            .open_table(ACHIEVEMENTS_TABLE)
            .map_err(|e| Error::database("create achievements table", e.to_string()))?;

        write_txn
            .commit()
            .map_err(|e| Error::database("commit table creation", e.to_string()))?;
        Ok(())
    }

    // ========================================================================
    // Container Records
    // ========================================================================

    /// Insert or replace a container record.
    pub fn put_container(&self, key: &str, record: &ContainerRecord) -> Result<()> {
        let json = serde_json::to_vec(record)
            .map_err(|e| Error::database("serialize container record", e.to_string()))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::database("begin write", e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(CONTAINERS_TABLE)
                .map_err(|e| Error::database("open containers table", e.to_string()))?;
            table
                .insert(key, json.as_slice())
                .map_err(|e| Error::database("insert container", format!("{}: {}", key, e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::database("commit container insert", e.to_string()))?;
        Ok(())
    }

    /// Get a container record.
    pub fn get_container(&self, key: &str) -> Result<Option<ContainerRecord>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::database("begin read", e.to_string()))?;
        let table = read_txn
            .open_table(CONTAINERS_TABLE)
            .map_err(|e| Error::database("open containers table", e.to_string()))?;

        match table.get(key) {
            Ok(Some(guard)) => {
                let record = serde_json::from_slice(guard.value()).map_err(|e| {
                    Error::database("deserialize container record", format!("{}: {}", key, e))
                })?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Error::database("get container", format!("{}: {}", key, e))),
        }
    }

    /// Remove a container record, returning whether it existed.
    pub fn remove_container(&self, key: &str) -> Result<bool> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::database("begin write", e.to_string()))?;
        let removed = {
            let mut table = write_txn
                .open_table(CONTAINERS_TABLE)
                .map_err(|e| Error::database("open containers table", e.to_string()))?;
            let removed = table
                .remove(key)
                .map_err(|e| Error::database("remove container", format!("{}: {}", key, e)))?;
            removed.is_some()
        };
        write_txn
            .commit()
            .map_err(|e| Error::database("commit container removal", e.to_string()))?;
        Ok(removed)
    }

    /// List all container records.
    pub fn list_containers(&self) -> Result<Vec<(String, ContainerRecord)>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::database("begin read", e.to_string()))?;
        let table = read_txn
            .open_table(CONTAINERS_TABLE)
            .map_err(|e| Error::database("open containers table", e.to_string()))?;

        let mut records = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| Error::database("iterate containers", e.to_string()))?
        {
            let (key, value) =
                entry.map_err(|e| Error::database("read container entry", e.to_string()))?;
            let key = key.value().to_string();
            let record: ContainerRecord = serde_json::from_slice(value.value()).map_err(|e| {
                Error::database("deserialize container record", format!("{}: {}", key, e))
            })?;
            records.push((key, record));
        }
        Ok(records)
    }

    // ========================================================================
    // Audit Log
    // ========================================================================

    /// Append an audit entry, returning its sequence number.
    pub fn append_audit(&self, entry: &AuditLogEntry) -> Result<u64> {
        let json = serde_json::to_vec(entry)
            .map_err(|e| Error::database("serialize audit entry", e.to_string()))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::database("begin write", e.to_string()))?;
        let seq = {
            let mut table = write_txn
                .open_table(AUDIT_TABLE)
                .map_err(|e| Error::database("open audit table", e.to_string()))?;
            let next = match table
                .last()
                .map_err(|e| Error::database("read audit tail", e.to_string()))?
            {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };
            table
                .insert(next, json.as_slice())
                .map_err(|e| Error::database("append audit", e.to_string()))?;
            next
        };
        write_txn
            .commit()
            .map_err(|e| Error::database("commit audit append", e.to_string()))?;
        Ok(seq)
    }

    /// Most recent audit entries, newest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::database("begin read", e.to_string()))?;
        let table = read_txn
            .open_table(AUDIT_TABLE)
            .map_err(|e| Error::database("open audit table", e.to_string()))?;

        let mut entries = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| Error::database("iterate audit", e.to_string()))?
            .rev()
            .take(limit)
        {
            let (_, value) =
                entry.map_err(|e| Error::database("read audit entry", e.to_string()))?;
            let entry: AuditLogEntry = serde_json::from_slice(value.value())
                .map_err(|e| Error::database("deserialize audit entry", e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    // ========================================================================
    // Preferences
    // ========================================================================

    /// Stored preferred flavor name for a user.
    pub fn get_preferred_os(&self, username: &str) -> Result<Option<String>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::database("begin read", e.to_string()))?;
        let table = read_txn
            .open_table(PREFERENCES_TABLE)
            .map_err(|e| Error::database("open preferences table", e.to_string()))?;

        match table.get(username) {
            Ok(Some(guard)) => Ok(Some(guard.value().to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::database(
                "get preference",
                format!("{}: {}", username, e),
            )),
        }
    }

    /// Store the preferred flavor name for a user.
    pub fn set_preferred_os(&self, username: &str, os: &str) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::database("begin write", e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(PREFERENCES_TABLE)
                .map_err(|e| Error::database("open preferences table", e.to_string()))?;
            table
                .insert(username, os)
                .map_err(|e| Error::database("set preference", format!("{}: {}", username, e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::database("commit preference", e.to_string()))?;
        Ok(())
    }

    // ========================================================================
    // Achievements
    // ========================================================================

    /// Achievements earned by a user.
    pub fn get_achievements(&self, username: &str) -> Result<BTreeSet<String>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::database("begin read", e.to_string()))?;
        let table = read_txn
            .open_table(ACHIEVEMENTS_TABLE)
            .map_err(|e| Error::database("open achievements table", e.to_string()))?;

        match table.get(username) {
            Ok(Some(guard)) => serde_json::from_slice(guard.value())
                .map_err(|e| Error::database("deserialize achievements", e.to_string())),
            Ok(None) => Ok(BTreeSet::new()),
            Err(e) => Err(Error::database(
                "get achievements",
                format!("{}: {}", username, e),
            )),
        }
    }

    /// Merge achievements into a user's set, returning the ones that were new.
    pub fn add_achievements(
        &self,
        username: &str,
        achievements: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::database("begin write", e.to_string()))?;
        let added = {
            let mut table = write_txn
                .open_table(ACHIEVEMENTS_TABLE)
                .map_err(|e| Error::database("open achievements table", e.to_string()))?;

            let mut current: BTreeSet<String> = match table
                .get(username)
                .map_err(|e| Error::database("get achievements", e.to_string()))?
            {
                Some(guard) => serde_json::from_slice(guard.value())
                    .map_err(|e| Error::database("deserialize achievements", e.to_string()))?,
                None => BTreeSet::new(),
            };

            let added: BTreeSet<String> = achievements
                .iter()
                .filter(|a| current.insert((*a).clone()))
                .cloned()
                .collect();

            if !added.is_empty() {
                let json = serde_json::to_vec(&current)
                    .map_err(|e| Error::database("serialize achievements", e.to_string()))?;
                table.insert(username, json.as_slice()).map_err(|e| {
                    Error::database("insert achievements", format!("{}: {}", username, e))
                })?;
            }
            added
        };
        write_txn
            .commit()
            .map_err(|e| Error::database("commit achievements", e.to_string()))?;
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerKind, Readiness, RecordState};
    use crate::os::OsFlavor;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, SandboxDb) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("test.redb");
        let db = SandboxDb::open_at(&path).unwrap();
        (dir, db)
    }

    fn record(owner: &str) -> ContainerRecord {
        ContainerRecord {
            owner: owner.to_string(),
            os: OsFlavor::Kali,
            id: "deadbeefcafe0001".to_string(),
            name: format!("sandbox-{}-Kali", owner),
            image: "kalilinux/kali-rolling".to_string(),
            created_at: 10,
            last_used_at: 10,
            state: RecordState::Running,
            kind: ContainerKind::Native,
            fallback_from: None,
            readiness: Readiness {
                shell: true,
                ..Default::default()
            },
            ports: Default::default(),
            adopted: false,
        }
    }

    #[test]
    fn test_container_crud() {
        let (_dir, db) = temp_db();

        db.put_container("alice::kali", &record("alice")).unwrap();
        let got = db.get_container("alice::kali").unwrap().unwrap();
        assert_eq!(got, record("alice"));

        let mut updated = got.clone();
        updated.last_used_at = 99;
        db.put_container("alice::kali", &updated).unwrap();
        assert_eq!(
            db.get_container("alice::kali").unwrap().unwrap().last_used_at,
            99
        );

        db.put_container("bob::kali", &record("bob")).unwrap();
        let all = db.list_containers().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "alice::kali");

        assert!(db.remove_container("alice::kali").unwrap());
        assert!(!db.remove_container("alice::kali").unwrap());
        assert!(db.get_container("alice::kali").unwrap().is_none());
    }

    #[test]
    fn test_audit_is_append_only_and_ordered() {
        let (_dir, db) = temp_db();

        for (i, cmd) in ["ls", "whoami", "reboot"].iter().enumerate() {
            let seq = db
                .append_audit(&AuditLogEntry {
                    user_id: "alice".to_string(),
                    os: "kali".to_string(),
                    cmd: cmd.to_string(),
                    allowed: *cmd != "reboot",
                    timestamp: i as i64,
                    exit_code: None,
                    duration_ms: None,
                })
                .unwrap();
            assert_eq!(seq, i as u64 + 1);
        }

        let recent = db.recent_audit(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].cmd, "reboot");
        assert!(!recent[0].allowed);
        assert_eq!(recent[1].cmd, "whoami");
    }

    #[test]
    fn test_audit_concurrent_appends() {
        let (_dir, db) = temp_db();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    db.append_audit(&AuditLogEntry {
                        user_id: format!("user-{}", i),
                        os: "kali".to_string(),
                        cmd: "ls".to_string(),
                        allowed: true,
                        timestamp: 0,
                        exit_code: Some(0),
                        duration_ms: Some(5),
                    })
                    .unwrap()
                })
            })
            .collect();

        let mut seqs: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_preferences() {
        let (_dir, db) = temp_db();
        assert!(db.get_preferred_os("alice").unwrap().is_none());
        db.set_preferred_os("alice", "windows").unwrap();
        db.set_preferred_os("alice", "macos").unwrap();
        assert_eq!(db.get_preferred_os("alice").unwrap().as_deref(), Some("macos"));
    }

    #[test]
    fn test_achievements_merge() {
        let (_dir, db) = temp_db();
        let first: BTreeSet<String> = ["scanner".to_string()].into_iter().collect();
        let added = db.add_achievements("alice", &first).unwrap();
        assert_eq!(added, first);

        let second: BTreeSet<String> = ["scanner".to_string(), "cracker".to_string()]
            .into_iter()
            .collect();
        let added = db.add_achievements("alice", &second).unwrap();
        assert_eq!(added.len(), 1);
        assert!(added.contains("cracker"));
        assert_eq!(db.get_achievements("alice").unwrap(), second);
        assert!(db.get_achievements("bob").unwrap().is_empty());
    }
}
