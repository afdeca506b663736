//! Error types for sandboxd.
//!
//! # Error Message Style Guide
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: all lowercase
//! - **Context**: include the owner, flavor, container id or command when known
//!
//! ```text
//! "provisioning failed: kali for alice: image pull refused"
//! "exec failed: ls -la: connection reset"
//! "database operation failed: append audit: disk full"
//! ```
//!
//! Errors are grouped by how the session layer treats them. Policy denials
//! and fatal exec errors are reported to the client, transient exec errors
//! are retried once, validator faults are folded into a failing result.

use std::time::Duration;
use thiserror::Error;

/// Classification for container runtime errors, used for retry decisions
/// and HTTP status mapping without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeErrorKind {
    /// Container or exec instance does not exist (404).
    NotFound,
    /// Name already in use or conflicting state (409).
    Conflict,
    /// Container exists but is not running.
    NotRunning,
    /// Runtime daemon could not be reached.
    Unavailable,
    /// Anything else.
    #[default]
    Other,
}

/// Result type alias using sandboxd's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sandboxd operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Policy
    // ========================================================================
    /// Command matched the denylist.
    #[error("command denied by policy: {command}")]
    PolicyDenied {
        /// The rejected command line.
        command: String,
    },

    // ========================================================================
    // Provisioning
    // ========================================================================
    /// Container could not be created, adopted or started.
    #[error("provisioning failed: {os} for {owner}: {reason}")]
    ProvisioningFailed {
        /// Owner of the requested sandbox.
        owner: String,
        /// Requested flavor.
        os: String,
        /// Reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Exec
    // ========================================================================
    /// The runtime reported the container as missing or not ready.
    #[error("exec not ready: {reason}")]
    ExecTransient {
        /// Reason reported by the runtime.
        reason: String,
    },

    /// Any other exec failure.
    #[error("exec failed: {command}: {reason}")]
    ExecFatal {
        /// Command being executed.
        command: String,
        /// Reason for the failure.
        reason: String,
    },

    /// The interactive shell has already ended.
    #[error("interactive shell ended")]
    ShellEnded,

    // ========================================================================
    // Validation
    // ========================================================================
    /// A validator could not be loaded or raised while running.
    #[error("validator failed: {validator}: {reason}")]
    ValidatorFault {
        /// Where the validator came from.
        validator: String,
        /// Reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Protocol
    // ========================================================================
    /// Inbound message could not be parsed.
    #[error("malformed message: {0}")]
    ProtocolMalformed(String),

    // ========================================================================
    // Container Runtime
    // ========================================================================
    /// Container runtime call failed.
    #[error("runtime operation failed: {operation}: {reason}")]
    Runtime {
        /// The operation that failed (e.g., "create", "start", "exec").
        operation: String,
        /// The reason for the failure.
        reason: String,
        /// Classification of the failure.
        kind: RuntimeErrorKind,
    },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {}", humantime::format_duration(*after))]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// Deadline that was exceeded.
        after: Duration,
    },

    // ========================================================================
    // Configuration
    // ========================================================================
    /// Configuration operation failed.
    #[error("config operation failed: {operation}: {reason}")]
    Config {
        /// The operation that failed (e.g., "load", "parse").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Database
    // ========================================================================
    /// Database operation failed.
    #[error("database operation failed: {operation}: {reason}")]
    Database {
        /// The operation that failed (e.g., "open", "read", "write").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // I/O
    // ========================================================================
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a policy denial.
    pub fn policy_denied(command: impl Into<String>) -> Self {
        Self::PolicyDenied {
            command: command.into(),
        }
    }

    /// Create a provisioning failure.
    pub fn provisioning(
        owner: impl Into<String>,
        os: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ProvisioningFailed {
            owner: owner.into(),
            os: os.into(),
            reason: reason.into(),
        }
    }

    /// Create a transient exec error.
    pub fn exec_transient(reason: impl Into<String>) -> Self {
        Self::ExecTransient {
            reason: reason.into(),
        }
    }

    /// Create a fatal exec error.
    pub fn exec_fatal(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecFatal {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a validator fault.
    pub fn validator(validator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidatorFault {
            validator: validator.into(),
            reason: reason.into(),
        }
    }

    /// Create a runtime error with the default classification.
    pub fn runtime(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::runtime_kind(operation, reason, RuntimeErrorKind::Other)
    }

    /// Create a runtime error with an explicit classification.
    pub fn runtime_kind(
        operation: impl Into<String>,
        reason: impl Into<String>,
        kind: RuntimeErrorKind,
    ) -> Self {
        Self::Runtime {
            operation: operation.into(),
            reason: reason.into(),
            kind,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a config error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a database error.
    pub fn database(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Runtime classification, if this is a runtime error.
    pub fn runtime_error_kind(&self) -> Option<RuntimeErrorKind> {
        match self {
            Error::Runtime { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether an exec failure means the container is gone or not ready yet,
    /// so re-provisioning and retrying once may succeed.
    pub fn is_exec_transient(&self) -> bool {
        match self {
            Error::ExecTransient { .. } | Error::ShellEnded => true,
            Error::Runtime { kind, reason, .. } => match kind {
                RuntimeErrorKind::NotFound | RuntimeErrorKind::NotRunning => true,
                _ => mentions_not_ready(reason),
            },
            Error::ExecFatal { reason, .. } => mentions_not_ready(reason),
            _ => false,
        }
    }

    /// Whether a provisioning attempt may succeed when repeated once.
    pub fn is_provisioning_retryable(&self) -> bool {
        match self {
            Error::ProvisioningFailed { .. } | Error::Timeout { .. } => true,
            Error::Runtime { kind, .. } => *kind == RuntimeErrorKind::Conflict,
            _ => false,
        }
    }

    /// Convert a runtime-level error raised while executing `command` into
    /// the exec taxonomy.
    pub fn into_exec(self, command: &str) -> Self {
        if self.is_exec_transient() {
            match self {
                Error::ExecTransient { .. } | Error::ShellEnded => self,
                other => Error::exec_transient(other.to_string()),
            }
        } else {
            match self {
                Error::ExecFatal { .. } | Error::PolicyDenied { .. } | Error::Timeout { .. } => {
                    self
                }
                other => Error::exec_fatal(command, other.to_string()),
            }
        }
    }
}

/// Runtime messages that indicate a container that is gone or still booting.
fn mentions_not_ready(reason: &str) -> bool {
    const MARKERS: &[&str] = &["not initialized", "No such container", "not available"];
    MARKERS.iter().any(|m| reason.contains(m))
}
