//! Command policy commands.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use sandboxd::config::SandboxConfig;
use sandboxd::policy::CommandPolicy;
use sandboxd::Error;

/// Inspect the command denylist.
#[derive(Subcommand, Debug)]
pub enum PolicyCmd {
    /// Check whether a command would be allowed
    Check(CheckCmd),
}

impl PolicyCmd {
    /// Run the policy subcommand.
    pub fn run(self) -> sandboxd::Result<()> {
        match self {
            PolicyCmd::Check(cmd) => cmd.run(),
        }
    }
}

/// Check a command against the denylist.
#[derive(Args, Debug)]
pub struct CheckCmd {
    /// Command line to check.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Denylist file [default: the configured one, else built-in rules].
    #[arg(long, value_name = "PATH")]
    denylist: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(short, long, value_name = "PATH", env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,
}

impl CheckCmd {
    fn run(self) -> sandboxd::Result<()> {
        let denylist = match self.denylist {
            Some(path) => Some(path),
            None => SandboxConfig::load(self.config.as_deref())?.denylist,
        };

        let policy = CommandPolicy::load(denylist.as_deref());
        if let Some(reason) = policy.load_failure() {
            eprintln!("warning: denylist unreadable ({}), denying everything", reason);
        }

        let command = self.command.join(" ");
        if policy.is_allowed(&command) {
            println!("allowed");
            Ok(())
        } else {
            println!("[denied] {}", command.trim());
            Err(Error::policy_denied(command.trim()))
        }
    }
}
