//! sandboxd - per-learner container sandboxes
//!
//! sandboxd gives every learner an isolated shell in a container of the
//! OS flavor their lesson asks for, streamed to the browser over a JSON
//! websocket protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  HTTP API / websocket (axum)                    │
//! ├─────────────────────────────────────────────────┤
//! │  SessionController (one task per connection)    │
//! ├───────────────┬───────────────┬─────────────────┤
//! │ CommandPolicy │ ExecBridge    │ ValidationRunner│
//! ├───────────────┴───────────────┴─────────────────┤
//! │  ContainerRegistry (one container per user+os)  │
//! ├─────────────────────────────────────────────────┤
//! │  ContainerRuntime (Docker via bollard)          │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - Lazy, deduplicated container provisioning with flavor fallback
//! - Interactive shells and exec-per-command execution
//! - Command denylist with line gating on raw keystrokes
//! - Lesson validators with heuristic output attribution
//! - Audit log, recent commands and active session views
//! - Idle reaping and restart-safe container adoption

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod exec;
pub mod os;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod stores;
pub mod telemetry;
pub mod validation;

// Re-export main types for convenience
pub use config::{ContainerRecord, RecordState, SandboxConfig};
pub use db::SandboxDb;
pub use error::{Error, Result};
pub use exec::ExecBridge;
pub use os::{OsFlavor, SandboxKey};
pub use policy::CommandPolicy;
pub use registry::ContainerRegistry;
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use session::{SessionController, SessionServices};
pub use telemetry::Telemetry;
pub use validation::ValidationRunner;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
