//! OS flavors a sandbox can run, and the deterministic names derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating-system flavor of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFlavor {
    /// Primary Linux flavor (Kali rolling).
    #[default]
    Kali,
    /// Windows flavor (PowerShell image or a Windows-only image).
    Windows,
    /// macOS flavor (VM-backed image or a placeholder).
    Macos,
}

impl OsFlavor {
    /// All flavors, in display order.
    pub const ALL: [OsFlavor; 3] = [OsFlavor::Kali, OsFlavor::Windows, OsFlavor::Macos];

    /// Parse a client-supplied flavor name. Unknown names yield `None`.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "kali" | "linux" | "primary-linux" => Some(OsFlavor::Kali),
            "windows" | "win" => Some(OsFlavor::Windows),
            "macos" | "osx" | "mac" => Some(OsFlavor::Macos),
            _ => None,
        }
    }

    /// Parse a flavor name, treating unknown input as the default flavor.
    pub fn normalize(input: &str) -> Self {
        Self::parse(input).unwrap_or_default()
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFlavor::Kali => "kali",
            OsFlavor::Windows => "windows",
            OsFlavor::Macos => "macos",
        }
    }

    /// Capitalized label used in container names.
    pub fn label(&self) -> &'static str {
        match self {
            OsFlavor::Kali => "Kali",
            OsFlavor::Windows => "Windows",
            OsFlavor::Macos => "Macos",
        }
    }
}

impl fmt::Display for OsFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying one sandbox: `(owner, flavor)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxKey {
    /// Owning username.
    pub owner: String,
    /// Requested flavor.
    pub os: OsFlavor,
}

impl SandboxKey {
    /// Build a key.
    pub fn new(owner: impl Into<String>, os: OsFlavor) -> Self {
        Self {
            owner: owner.into(),
            os,
        }
    }

    /// Storage key, `owner::flavor`.
    pub fn storage_key(&self) -> String {
        format!("{}::{}", self.owner, self.os)
    }

    /// Parse a storage key produced by [`SandboxKey::storage_key`].
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let (owner, os) = key.rsplit_once("::")?;
        Some(Self::new(owner, OsFlavor::parse(os)?))
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.os)
    }
}

/// Deterministic container name for `(owner, flavor)`.
///
/// Characters outside `[A-Za-z0-9_.-]` become `_` so the result is always a
/// valid runtime name, and two processes derive the same name for the same key.
pub fn container_name(prefix: &str, owner: &str, os: OsFlavor) -> String {
    let raw = if prefix.is_empty() {
        format!("{}-{}", owner, os.label())
    } else {
        format!("{}-{}-{}", prefix, owner, os.label())
    };
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Shell used to run commands, chosen from the image a container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    /// `bash -l`
    Bash,
    /// `sh -l` (busybox images)
    Sh,
    /// `pwsh`
    Pwsh,
}

impl ShellKind {
    /// Pick the shell for an image reference.
    pub fn for_image(image: &str) -> Self {
        let image = image.to_ascii_lowercase();
        if image.contains("powershell") || image.contains("windows") {
            ShellKind::Pwsh
        } else if image.contains("alpine") || image.contains("busybox") {
            ShellKind::Sh
        } else {
            ShellKind::Bash
        }
    }

    /// Argv for a login shell attached to a TTY.
    pub fn interactive_argv(&self) -> Vec<String> {
        let argv: &[&str] = match self {
            ShellKind::Bash => &["bash", "-l"],
            ShellKind::Sh => &["sh", "-l"],
            ShellKind::Pwsh => &["pwsh", "-NoLogo"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Argv running `command` once and exiting with its status.
    pub fn one_shot_argv(&self, command: &str) -> Vec<String> {
        let mut argv: Vec<String> = match self {
            ShellKind::Bash => vec!["bash".into(), "-lc".into()],
            ShellKind::Sh => vec!["sh".into(), "-lc".into()],
            ShellKind::Pwsh => vec![
                "pwsh".into(),
                "-NoLogo".into(),
                "-NoProfile".into(),
                "-Command".into(),
            ],
        };
        argv.push(command.to_string());
        argv
    }
}

/// Shorten a container id for display.
pub fn truncate_id(id: &str) -> &str {
    const CONTAINER_ID_WIDTH: usize = 12;
    match id.char_indices().nth(CONTAINER_ID_WIDTH) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(OsFlavor::parse("osx"), Some(OsFlavor::Macos));
        assert_eq!(OsFlavor::parse(" Windows "), Some(OsFlavor::Windows));
        assert_eq!(OsFlavor::parse("primary-linux"), Some(OsFlavor::Kali));
        assert_eq!(OsFlavor::parse("beos"), None);
        assert_eq!(OsFlavor::normalize("beos"), OsFlavor::Kali);
    }

    #[test]
    fn test_container_name_is_deterministic_and_sanitized() {
        let a = container_name("sandbox", "alice smith", OsFlavor::Windows);
        let b = container_name("sandbox", "alice smith", OsFlavor::Windows);
        assert_eq!(a, b);
        assert_eq!(a, "sandbox-alice_smith-Windows");
        assert_eq!(container_name("", "bob", OsFlavor::Kali), "bob-Kali");
        assert_ne!(
            container_name("sandbox", "bob", OsFlavor::Kali),
            container_name("sandbox", "bob", OsFlavor::Macos)
        );
    }

    #[test]
    fn test_storage_key_roundtrip_with_colons_in_owner() {
        let key = SandboxKey::new("team::alice", OsFlavor::Macos);
        assert_eq!(
            SandboxKey::from_storage_key(&key.storage_key()),
            Some(key)
        );
    }

    #[test]
    fn test_shell_for_image() {
        assert_eq!(ShellKind::for_image("kalilinux/kali-rolling"), ShellKind::Bash);
        assert_eq!(ShellKind::for_image("alpine:latest"), ShellKind::Sh);
        assert_eq!(
            ShellKind::for_image("mcr.microsoft.com/powershell:latest"),
            ShellKind::Pwsh
        );
        assert_eq!(
            ShellKind::Bash.one_shot_argv("echo hi"),
            vec!["bash", "-lc", "echo hi"]
        );
    }

    #[test]
    fn test_truncate_id() {
        assert_eq!(truncate_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(truncate_id("short"), "short");
    }
}
