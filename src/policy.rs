//! Command policy: decides whether a command may run at all.
//!
//! The policy is built once at startup from a set of built-in substring
//! patterns plus an optional denylist file:
//!
//! ```json
//! { "unwantedCommands": ["nc -lvnp 4444"], "patterns": ["curl http://169.254."] }
//! ```
//!
//! `unwantedCommands` entries must match the whole command, `patterns`
//! entries match anywhere in it. Matching is case-sensitive after
//! whitespace normalization. A configured denylist that cannot be read or
//! parsed denies every command.

use serde::Deserialize;
use std::path::Path;

/// Patterns denied everywhere, regardless of the denylist file.
pub const DEFAULT_DENIED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "shutdown",
    "reboot",
    "mkfs",
    "dd if=",
    ":(){:|:&};:",
];

/// A single deny rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyRule {
    /// Denies any command containing the pattern.
    Substring(String),
    /// Denies a command equal to the entry.
    Exact(String),
}

impl DenyRule {
    fn matches(&self, normalized: &str) -> bool {
        match self {
            DenyRule::Substring(pattern) => normalized.contains(pattern.as_str()),
            DenyRule::Exact(entry) => normalized == entry,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DenylistFile {
    #[serde(default)]
    unwanted_commands: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

/// Allow/deny decision for command strings.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    rules: Vec<DenyRule>,
    /// Set when the denylist failed to load; every command is denied.
    load_failure: Option<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CommandPolicy {
    /// Policy with only the built-in patterns.
    pub fn builtin() -> Self {
        Self {
            rules: DEFAULT_DENIED_PATTERNS
                .iter()
                .map(|p| DenyRule::Substring(normalize(p)))
                .collect(),
            load_failure: None,
        }
    }

    /// Build the policy, reading the denylist file if one is configured.
    ///
    /// Never fails: an unreadable or malformed file produces a policy that
    /// denies everything.
    pub fn load(denylist: Option<&Path>) -> Self {
        let mut policy = Self::builtin();
        let Some(path) = denylist else {
            return policy;
        };

        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| {
                serde_json::from_str::<DenylistFile>(&content).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(file) => {
                policy.extend(
                    file.unwanted_commands
                        .iter()
                        .map(|c| DenyRule::Exact(normalize(c))),
                );
                policy.extend(file.patterns.iter().map(|p| DenyRule::Substring(normalize(p))));
                tracing::info!(
                    path = %path.display(),
                    rules = policy.rules.len(),
                    "command denylist loaded"
                );
            }
            Err(reason) => {
                tracing::error!(
                    path = %path.display(),
                    error = %reason,
                    "denylist unavailable, denying all commands"
                );
                policy.load_failure = Some(reason);
            }
        }
        policy
    }

    /// Add rules. Empty entries are ignored.
    pub fn extend(&mut self, rules: impl IntoIterator<Item = DenyRule>) {
        self.rules.extend(rules.into_iter().filter(|r| match r {
            DenyRule::Substring(s) | DenyRule::Exact(s) => !s.is_empty(),
        }));
    }

    /// Whether `command` may run.
    pub fn is_allowed(&self, command: &str) -> bool {
        if self.load_failure.is_some() {
            return false;
        }
        let normalized = normalize(command);
        !self.rules.iter().any(|rule| rule.matches(&normalized))
    }

    /// Reason the denylist failed to load, if it did.
    pub fn load_failure(&self) -> Option<&str> {
        self.load_failure.as_deref()
    }

    /// Number of active rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Collapse whitespace runs to single spaces and trim the ends.
fn normalize(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accumulates interactive keystrokes into lines so each completed line can
/// be checked before the shell sees its terminator.
#[derive(Debug, Default)]
pub struct LineGate {
    line: String,
}

/// What to forward to the shell for one chunk of typed input.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GateOutput {
    /// Bytes to write to the shell.
    pub forward: String,
    /// Completed lines the policy rejected.
    pub denied: Vec<String>,
}

/// Kill-line control byte; clears the shell's pending input.
const KILL_LINE: char = '\u{15}';

impl LineGate {
    /// Feed typed data. Ordinary keystrokes pass through; a line terminator is
    /// forwarded only if the completed line is allowed, otherwise the pending
    /// line is cleared with a kill-line byte.
    pub fn feed(&mut self, policy: &CommandPolicy, data: &str) -> GateOutput {
        let mut out = GateOutput::default();
        for c in data.chars() {
            match c {
                '\r' | '\n' => {
                    let line = std::mem::take(&mut self.line);
                    if line.trim().is_empty() || policy.is_allowed(&line) {
                        out.forward.push(c);
                    } else {
                        out.forward.push(KILL_LINE);
                        out.denied.push(line.trim().to_string());
                    }
                }
                '\u{7f}' | '\u{8}' => {
                    self.line.pop();
                    out.forward.push(c);
                }
                '\u{3}' | KILL_LINE => {
                    self.line.clear();
                    out.forward.push(c);
                }
                c => {
                    if !c.is_control() {
                        self.line.push(c);
                    }
                    out.forward.push(c);
                }
            }
        }
        out
    }
}
