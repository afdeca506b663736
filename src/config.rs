//! Server configuration and persisted container records.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment overrides, then CLI flags (applied by `sandboxd serve`).
//! Durations in the file use humantime syntax (`"750ms"`, `"20m"`).

use crate::error::{Error, Result};
use crate::os::OsFlavor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ============================================================================
// Container Records
// ============================================================================

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Creation or readiness probing in progress.
    #[default]
    Provisioning,
    /// Container is running and usable.
    Running,
    /// Container exists but is stopped.
    Stopped,
    /// Container was removed.
    Removed,
    /// Flavor could not be provisioned on this host.
    Unavailable,
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordState::Provisioning => write!(f, "provisioning"),
            RecordState::Running => write!(f, "running"),
            RecordState::Stopped => write!(f, "stopped"),
            RecordState::Removed => write!(f, "removed"),
            RecordState::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// How a record's container came to back its flavor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerKind {
    /// The requested flavor runs natively.
    #[default]
    Native,
    /// Another flavor substitutes for the requested one.
    Fallback,
    /// A full VM runs inside the container.
    ProvisionedVm,
    /// Stand-in container for a flavor this host cannot run.
    Placeholder,
}

impl std::fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerKind::Native => write!(f, "native"),
            ContainerKind::Fallback => write!(f, "fallback"),
            ContainerKind::ProvisionedVm => write!(f, "provisioned-vm"),
            ContainerKind::Placeholder => write!(f, "placeholder"),
        }
    }
}

/// Capability flags reported for a container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Readiness {
    /// A shell can be attached.
    #[serde(default)]
    pub shell: bool,
    /// The guest answers on its ssh port.
    #[serde(default)]
    pub ssh: bool,
    /// The guest remote desktop port is published.
    #[serde(default)]
    pub remote_desktop: bool,
}

/// Persisted record for one `(owner, flavor)` sandbox.
///
/// `os` is the flavor actually running; when it differs from what was asked
/// for, `fallback_from` holds the requested flavor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerRecord {
    /// Owning username.
    pub owner: String,
    /// Flavor running in the container.
    pub os: OsFlavor,
    /// Runtime-assigned container id.
    pub id: String,
    /// Deterministic container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Creation (or adoption) time, unix seconds.
    pub created_at: u64,
    /// Last time a session used the container, unix seconds.
    pub last_used_at: u64,
    /// Lifecycle state.
    #[serde(default)]
    pub state: RecordState,
    /// Provisioning kind.
    #[serde(default)]
    pub kind: ContainerKind,
    /// Flavor originally requested, when a fallback was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<OsFlavor>,
    /// Capability flags.
    #[serde(default)]
    pub readiness: Readiness,
    /// Published ports by service name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, u16>,
    /// Whether an existing container was re-attached instead of created.
    #[serde(default)]
    pub adopted: bool,
}

impl ContainerRecord {
    /// Flavor the owner asked for.
    pub fn requested_os(&self) -> OsFlavor {
        self.fallback_from.unwrap_or(self.os)
    }

    /// Whether the record backs a usable shell.
    pub fn is_running(&self) -> bool {
        self.state == RecordState::Running
    }
}

/// Current time in unix seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current time in unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Server Configuration
// ============================================================================

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
/// Default container name prefix.
pub const DEFAULT_NAME_PREFIX: &str = "sandbox";
/// Default memory limit per container (512 MiB).
pub const DEFAULT_MEMORY_BYTES: i64 = 512 * 1024 * 1024;
/// Default CPU quota per container (half a core).
pub const DEFAULT_NANO_CPUS: i64 = 500_000_000;
/// Marker written once the bootstrap script has completed.
pub const BOOTSTRAP_MARKER: &str = "/.sandbox_provisioned";

/// Bootstrap script run once as root inside native Kali containers.
pub const DEFAULT_BOOTSTRAP: &str = "set -e; \
[ -f /.sandbox_provisioned ] && exit 0; \
export DEBIAN_FRONTEND=noninteractive; \
apt-get update -y >/dev/null 2>&1 || true; \
apt-get install -y --no-install-recommends nmap curl iproute2 net-tools dnsutils >/dev/null 2>&1 || true; \
touch /.sandbox_provisioned";

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Database path; defaults to the local data directory.
    pub database: Option<PathBuf>,
    /// Denylist file; when unreadable every command is denied.
    pub denylist: Option<PathBuf>,
    /// Keep containers running after their sessions close.
    pub keep_containers: bool,
    /// Container runtime socket; defaults to the platform default.
    pub docker_socket: Option<PathBuf>,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Prefix for deterministic container names.
    pub name_prefix: String,
    /// Root of loose lesson trees holding validators.
    pub lessons_dir: Option<PathBuf>,
    /// Root of packaged lesson archives, consulted last.
    pub archive_dir: Option<PathBuf>,
    /// Run the policy self-test probe when a session becomes ready.
    pub self_test: bool,
    /// Bootstrap script for native Kali containers; `None` disables it.
    pub bootstrap: Option<String>,
    /// Image per flavor.
    pub images: ImageMap,
    /// Resource limits for created containers.
    pub limits: ContainerLimits,
    /// Deadlines and periodic intervals.
    pub timeouts: Timeouts,
    /// Per-session settings.
    pub session: SessionSettings,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            database: None,
            denylist: None,
            keep_containers: false,
            docker_socket: None,
            cors_origins: Vec::new(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            lessons_dir: None,
            archive_dir: None,
            self_test: false,
            bootstrap: Some(DEFAULT_BOOTSTRAP.to_string()),
            images: ImageMap::default(),
            limits: ContainerLimits::default(),
            timeouts: Timeouts::default(),
            session: SessionSettings::default(),
        }
    }
}

/// Image reference per flavor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ImageMap {
    /// Primary Linux image.
    pub kali: String,
    /// Windows image. Windows-only images fall back on non-Windows hosts.
    pub windows: String,
    /// macOS image. `dockur/macos` images run a VM and need KVM.
    pub macos: String,
}

impl Default for ImageMap {
    fn default() -> Self {
        Self {
            kali: "kalilinux/kali-rolling".to_string(),
            windows: "mcr.microsoft.com/powershell:latest".to_string(),
            macos: "alpine:latest".to_string(),
        }
    }
}

impl ImageMap {
    /// Image for a flavor.
    pub fn for_os(&self, os: OsFlavor) -> &str {
        match os {
            OsFlavor::Kali => &self.kali,
            OsFlavor::Windows => &self.windows,
            OsFlavor::Macos => &self.macos,
        }
    }
}

/// Resource limits applied to every created container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerLimits {
    /// Memory limit in bytes.
    pub memory_bytes: i64,
    /// CPU quota in billionths of a core.
    pub nano_cpus: i64,
    /// `uid:gid` the shell runs as.
    pub user: String,
    /// Network mode.
    pub network_mode: String,
    /// Soft limit for open files and processes.
    pub ulimit_soft: i64,
    /// Hard limit for open files and processes.
    pub ulimit_hard: i64,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            nano_cpus: DEFAULT_NANO_CPUS,
            user: "1000:1000".to_string(),
            network_mode: "bridge".to_string(),
            ulimit_soft: 1024,
            ulimit_hard: 2048,
        }
    }
}

/// Deadlines and intervals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Deadline for creating and starting a container.
    #[serde(with = "humantime_serde")]
    pub provision: Duration,
    /// Deadline for opening an exec instance.
    #[serde(with = "humantime_serde")]
    pub exec_start: Duration,
    /// Grace period given to a container when it is stopped.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Unused containers older than this are removed.
    #[serde(with = "humantime_serde")]
    pub idle: Duration,
    /// How often idle containers are reaped.
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// How long a VM-backed flavor may take to answer on ssh.
    #[serde(with = "humantime_serde")]
    pub vm_readiness: Duration,
    /// Poll interval while waiting for a VM-backed flavor.
    #[serde(with = "humantime_serde")]
    pub vm_probe_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            provision: Duration::from_secs(300),
            exec_start: Duration::from_secs(30),
            stop_grace: Duration::from_secs(2),
            idle: Duration::from_secs(20 * 60),
            reap_interval: Duration::from_secs(60),
            vm_readiness: Duration::from_secs(180),
            vm_probe_interval: Duration::from_millis(2500),
        }
    }
}

/// Settings owned by each session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    /// Delay before validating an interactive command.
    #[serde(with = "humantime_serde")]
    pub validation_delay: Duration,
    /// Capacity of the output ring buffer in bytes.
    pub ring_capacity: usize,
    /// Maximum commands kept in a session's history.
    pub history_limit: usize,
    /// Maximum recent commands kept per user for telemetry.
    pub recent_commands: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            validation_delay: Duration::from_millis(750),
            ring_capacity: 8192,
            history_limit: 100,
            recent_commands: 20,
        }
    }
}

impl SandboxConfig {
    /// Load configuration from an optional TOML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config("load config", format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::config("parse config", format!("{}: {}", path.display(), e)))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SANDBOX_KEEP_CONTAINERS") {
            self.keep_containers = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("SANDBOX_DENYLIST") {
            self.denylist = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KALI_IMAGE") {
            self.images.kali = v;
        }
        if let Some(v) = lookup("WIN_IMAGE") {
            self.images.windows = v;
        }
        if let Some(v) = lookup("MAC_IMAGE") {
            self.images.macos = v;
        }
    }

    /// Database path, falling back to the local data directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_local_dir().ok_or_else(|| {
            Error::config("resolve database path", "could not determine local data directory")
        })?;
        Ok(data_dir.join("sandboxd").join("sandboxd.redb"))
    }
}

/// Serde adapter for humantime durations.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
