//! When interactive output is judged.
//!
//! An interactive shell gives no end-of-command signal, so output is
//! attributed to a command by waiting and reading what arrived after it
//! was written.

use super::ring::{Mark, RingBuffer};
use std::fmt::Debug;
use std::time::Duration;

/// Strategy for attributing interactive output to a command.
pub trait ValidationTiming: Send + Sync + Debug {
    /// Wait after writing a command before judging its output.
    fn settle_delay(&self) -> Duration;

    /// Output attributed to the command written at `mark`.
    fn attribute(&self, ring: &RingBuffer, mark: Mark) -> String {
        ring.since(mark)
    }
}

/// Fixed trailing window after the command is written.
#[derive(Debug, Clone, Copy)]
pub struct TrailingWindow {
    delay: Duration,
}

impl TrailingWindow {
    /// Window of `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for TrailingWindow {
    fn default() -> Self {
        Self::new(Duration::from_millis(750))
    }
}

impl ValidationTiming for TrailingWindow {
    fn settle_delay(&self) -> Duration {
        self.delay
    }
}
