//! Container supervisor for idle reaping.
//!
//! The supervisor runs as a background task that periodically removes
//! containers no session has used for longer than the idle timeout.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::api::state::ApiState;
use crate::os::SandboxKey;

/// Container supervisor.
pub struct Supervisor {
    state: Arc<ApiState>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a new supervisor checking every `interval`.
    pub fn new(state: Arc<ApiState>, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            state,
            interval,
            shutdown_rx,
        }
    }

    /// Run the supervisor loop.
    ///
    /// This method blocks until shutdown is signaled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        // Don't catch up on missed ticks
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        tracing::info!(
            interval = %humantime::format_duration(self.interval),
            idle_timeout = %humantime::format_duration(self.state.idle_timeout()),
            "supervisor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        tracing::info!("supervisor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Remove idle containers once.
    pub async fn sweep(&self) -> Vec<SandboxKey> {
        let reaped = self
            .state
            .registry()
            .reap_idle(self.state.idle_timeout())
            .await;
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "reaped idle containers");
        }
        reaped
    }
}
