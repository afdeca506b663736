//! Container runtime abstraction.
//!
//! The registry and exec bridge talk to the container engine only through
//! [`ContainerRuntime`]. [`docker::DockerRuntime`] is the production
//! implementation; tests use an in-memory fake.

pub mod docker;

#[cfg(test)]
pub(crate) mod fake;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;

pub use docker::DockerRuntime;

/// Label carrying the owning username.
pub const LABEL_OWNER: &str = "sandboxd.owner";
/// Label carrying the flavor a container was created for.
pub const LABEL_OS: &str = "sandboxd.os";
/// Label marking containers managed by sandboxd.
pub const LABEL_MANAGED: &str = "sandboxd.managed";

/// What a container runtime reports about a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Full container id.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// Whether the container is running.
    pub running: bool,
    /// Image reference, when known.
    pub image: Option<String>,
    /// Published host ports keyed by `"<port>/<proto>"`.
    pub published: BTreeMap<String, u16>,
}

/// A port published from the container to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    /// Service name reported to clients (e.g. `ssh`).
    pub service: String,
    /// Container port.
    pub container_port: u16,
    /// Host port.
    pub host_port: u16,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    /// Deterministic name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables (`KEY=value`).
    pub env: Vec<String>,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// `uid:gid` for the main process; `None` keeps the image default.
    pub user: Option<String>,
    /// Memory limit in bytes.
    pub memory_bytes: i64,
    /// CPU quota in billionths of a core.
    pub nano_cpus: i64,
    /// Network mode.
    pub network_mode: String,
    /// Soft and hard limits for open files and processes.
    pub ulimits: (i64, i64),
    /// Run privileged with all capabilities (VM-backed flavors).
    pub privileged: bool,
    /// Host devices to pass through.
    pub devices: Vec<String>,
    /// Ports to publish.
    pub ports: Vec<PublishedPort>,
}

/// Output side of an exec instance.
pub type OutputStream = BoxStream<'static, Result<Bytes>>;

/// Input side of an attached exec instance.
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// A started exec instance.
pub struct AttachedExec {
    /// Runtime exec id, used for resize and exit code lookup.
    pub exec_id: String,
    /// Combined stdout/stderr.
    pub output: OutputStream,
    /// Stdin, present only when requested.
    pub input: Option<InputSink>,
}

impl std::fmt::Debug for AttachedExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedExec")
            .field("exec_id", &self.exec_id)
            .field("input", &self.input.is_some())
            .finish_non_exhaustive()
    }
}

/// Parameters for starting an exec instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecRequest {
    /// Argv to run.
    pub cmd: Vec<String>,
    /// Allocate a TTY and attach stdin.
    pub tty: bool,
    /// Override the user (e.g. `0:0` for bootstrap work).
    pub user: Option<String>,
    /// Extra environment.
    pub env: Vec<String>,
}

/// Operations sandboxd needs from a container engine.
///
/// Errors use [`crate::Error::Runtime`] with a [`crate::error::RuntimeErrorKind`]
/// so callers can tell a missing container from a name conflict.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Find a container (running or stopped) by exact name.
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>>;

    /// Inspect a container by id or name.
    async fn inspect(&self, id: &str) -> Result<ContainerSummary>;

    /// Pull an image.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container, returning its id. A taken name is reported with
    /// `RuntimeErrorKind::Conflict`.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a container. Starting a running container is not an error.
    async fn start(&self, id: &str) -> Result<()>;

    /// Stop a container, waiting up to `grace` before killing it.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Force-remove a container.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Start an exec instance inside a running container.
    async fn exec(&self, id: &str, request: ExecRequest) -> Result<AttachedExec>;

    /// Resize the TTY of an exec instance.
    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()>;

    /// Exit code of a finished exec instance.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>>;

    /// All containers carrying [`LABEL_MANAGED`].
    async fn list_managed(&self) -> Result<Vec<ContainerSummary>>;
}
