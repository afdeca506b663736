//! Wire protocol for sandboxd terminal sessions.
//!
//! A session is a persistent duplex connection (a websocket in practice)
//! carrying one JSON object per text frame. Every message has a `type`
//! discriminator in kebab-case.
//!
//! ```text
//! client                                   server
//!   | -- {"type":"set-os","os":"kali"} ----> |
//!   | <--- {"type":"ready","os":"kali",...} - |
//!   | -- {"type":"command","command":"ls"} -> |
//!   | <--- {"type":"command-start",...} ----- |
//!   | <--- {"type":"data","data":"..."} ----- |
//!   | <--- {"type":"command-end",...} ------- |
//!   | <--- {"type":"validation",...} -------- |
//! ```

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum accepted size of a single inbound text frame (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Notice codes carried by [`ServerEvent::Notice`].
pub mod notice {
    /// The requested OS flavor was substituted by another one.
    pub const OS_FALLBACK: &str = "os-fallback";
    /// A VM-backed flavor was provisioned and published ports.
    pub const OS_PROVISIONED: &str = "os-provisioned";
}

// ============================================================================
// Session Mode
// ============================================================================

/// How commands are executed for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// A persistent shell is attached and stdin/stdout stream continuously.
    #[default]
    Interactive,
    /// Each command is a discrete execution with an exit code.
    Exec,
}

impl SessionMode {
    /// Parse a client-supplied mode. Only `exec` selects [`SessionMode::Exec`];
    /// anything else means interactive.
    pub fn from_wire(mode: &str) -> Self {
        if mode.trim().eq_ignore_ascii_case("exec") {
            SessionMode::Exec
        } else {
            SessionMode::Interactive
        }
    }

    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Interactive => "interactive",
            SessionMode::Exec => "exec",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Validation Result
// ============================================================================

/// Outcome of running a validator over a command/output pair.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Whether the step was satisfied.
    pub pass: bool,
    /// Hint shown to the learner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Ordered menu entries to present next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu: Option<Vec<String>>,
    /// Achievements unlocked by this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub achievements: Option<BTreeSet<String>>,
    /// Whether the learner must still submit a flag.
    #[serde(default)]
    pub flag_required: bool,
}

impl ValidationResult {
    /// A passing result with no extras.
    pub fn passed() -> Self {
        Self {
            pass: true,
            ..Default::default()
        }
    }

    /// A failing result carrying a hint.
    pub fn failed(hint: impl Into<String>) -> Self {
        Self {
            pass: false,
            hint: Some(hint.into()),
            ..Default::default()
        }
    }
}

// ============================================================================
// Client -> Server
// ============================================================================

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Select the session mode (`interactive` or `exec`).
    NegotiateMode {
        /// Requested mode, see [`SessionMode::from_wire`].
        mode: String,
    },

    /// Set the activity used to scope validation.
    SetActivity {
        /// Activity identifier; empty or missing clears it.
        #[serde(default, alias = "value")]
        activity: Option<String>,
    },

    /// Set the chapter used to narrow validation.
    SetChapter {
        /// Chapter identifier; empty or missing clears it.
        #[serde(default, alias = "value")]
        chapter: Option<String>,
    },

    /// Set the current curriculum step.
    SetStep {
        /// Step number, as a JSON number or numeric string.
        #[serde(default, alias = "value")]
        step: Option<serde_json::Value>,
    },

    /// Switch the OS flavor backing the session.
    SetOs {
        /// Requested flavor name.
        os: String,
    },

    /// Liveness probe.
    Heartbeat {
        /// Client timestamp, echoed nowhere.
        #[serde(default)]
        ts: Option<i64>,
    },

    /// Raw bytes typed into the interactive shell.
    Stdin {
        /// Typed data.
        data: String,
    },

    /// Interrupt the foreground process.
    Interrupt,

    /// Resize the pseudo terminal.
    Resize {
        /// Terminal rows.
        rows: u16,
        /// Terminal columns.
        cols: u16,
    },

    /// Run a command.
    Command {
        /// Command line.
        command: String,
    },
}

/// Interpret a `set-step` value: integers and numeric strings are accepted.
pub fn parse_step(value: Option<&serde_json::Value>) -> Option<u32> {
    match value? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.trunc() as u64))
            .and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => {
            let digits: String = s
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// A container is attached and the session accepts commands.
    Ready {
        /// Resolved flavor.
        os: String,
        /// Truncated container id.
        container: String,
    },

    /// Confirms the negotiated mode.
    Mode {
        /// Active mode.
        mode: SessionMode,
    },

    /// Out-of-band information about provisioning.
    Notice {
        /// One of the codes in [`notice`].
        code: String,
        /// Flavor originally requested.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Flavor actually used.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        /// Published ports by service name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ports: Option<BTreeMap<String, u16>>,
    },

    /// Terminal output produced by the container.
    Data {
        /// Output text (lossy UTF-8).
        data: String,
    },

    /// Server-generated status line.
    Text {
        /// Line text.
        data: String,
    },

    /// A command was dispatched.
    CommandStart {
        /// Command line.
        command: String,
        /// Mode used to run it.
        mode: SessionMode,
    },

    /// A command finished.
    CommandEnd {
        /// Command line.
        command: String,
        /// Exit code, if the runtime reported one.
        #[serde(rename = "exitCode")]
        exit_code: Option<i64>,
    },

    /// Validation outcome for the last command.
    Validation {
        /// Validator result.
        data: ValidationResult,
    },

    /// Echo of `set-activity`.
    ActivitySet {
        /// Stored value.
        value: Option<String>,
    },

    /// Echo of `set-chapter`.
    ChapterSet {
        /// Stored value.
        value: Option<String>,
    },

    /// Echo of `set-step`.
    StepSet {
        /// Stored value.
        value: Option<u32>,
    },

    /// Reply to `heartbeat`.
    Pong {
        /// Server time in unix milliseconds.
        ts: i64,
    },

    /// A command or provisioning step failed.
    Error {
        /// Human-readable message.
        error: String,
        /// Command that triggered the failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        /// Number of attempts made.
        attempt: u32,
    },

    /// A command was rejected by policy.
    Denied {
        /// Rejected command line.
        command: String,
        /// Server time in unix milliseconds.
        ts: i64,
    },

    /// Acknowledges `interrupt`.
    InterruptAck,
}

impl ServerEvent {
    /// Convenience constructor for status lines.
    pub fn text(data: impl Into<String>) -> Self {
        ServerEvent::Text { data: data.into() }
    }
}

// ============================================================================
// Wire Format Helpers
// ============================================================================

/// Encode an event as a JSON text frame.
pub fn encode_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Decode a client text frame.
pub fn decode_client_message(frame: &str) -> Result<ClientMessage, DecodeError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::TooLarge(frame.len()));
    }
    serde_json::from_str(frame).map_err(DecodeError::Json)
}

/// Error decoding a client frame.
#[derive(Debug)]
pub enum DecodeError {
    /// Frame size exceeds maximum.
    TooLarge(usize),
    /// JSON parse error or unknown message type.
    Json(serde_json::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TooLarge(size) => write!(f, "frame too large: {} bytes", size),
            DecodeError::Json(e) => write!(f, "JSON decode error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}
