//! Per-user state the session needs from outside: earned achievements and
//! the preferred flavor. [`SandboxDb`] implements both.

use crate::db::SandboxDb;
use crate::error::Result;
use crate::os::OsFlavor;
use std::collections::BTreeSet;

/// Achievements earned by passing validations.
pub trait ProgressStore: Send + Sync {
    /// Merge achievements, returning the ones the user did not have yet.
    fn add_achievements(&self, user: &str, achievements: &BTreeSet<String>)
        -> Result<BTreeSet<String>>;

    /// Achievements a user has earned.
    fn achievements(&self, user: &str) -> Result<BTreeSet<String>>;
}

/// Preferred flavor per user.
pub trait PreferenceStore: Send + Sync {
    /// Stored flavor; unknown stored names read as `None`.
    fn preferred_os(&self, user: &str) -> Result<Option<OsFlavor>>;

    /// Remember a flavor.
    fn set_preferred_os(&self, user: &str, os: OsFlavor) -> Result<()>;
}

impl ProgressStore for SandboxDb {
    fn add_achievements(
        &self,
        user: &str,
        achievements: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        SandboxDb::add_achievements(self, user, achievements)
    }

    fn achievements(&self, user: &str) -> Result<BTreeSet<String>> {
        self.get_achievements(user)
    }
}

impl PreferenceStore for SandboxDb {
    fn preferred_os(&self, user: &str) -> Result<Option<OsFlavor>> {
        Ok(self
            .get_preferred_os(user)?
            .and_then(|name| OsFlavor::parse(&name)))
    }

    fn set_preferred_os(&self, user: &str, os: OsFlavor) -> Result<()> {
        SandboxDb::set_preferred_os(self, user, os.as_str())
    }
}
