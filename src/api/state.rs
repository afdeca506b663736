//! API server state management.

use crate::policy::CommandPolicy;
use crate::registry::ContainerRegistry;
use crate::runtime::ContainerRuntime;
use crate::session::SessionServices;
use crate::telemetry::Telemetry;
use crate::validation::ValidationRunner;
use std::sync::Arc;
use std::time::Duration;

/// Shared API server state.
#[derive(Debug)]
pub struct ApiState {
    /// Everything a websocket session is handed.
    services: SessionServices,
    /// How long an unleased container may sit unused.
    idle_timeout: Duration,
    /// Outbound event buffer per connection.
    outbound_buffer: usize,
}

/// Default per-connection outbound buffer.
const DEFAULT_OUTBOUND_BUFFER: usize = 256;

impl ApiState {
    /// Create API state around session services.
    pub fn new(services: SessionServices, idle_timeout: Duration) -> Self {
        Self {
            services,
            idle_timeout,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }

    /// Services handed to each session.
    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    /// The container registry.
    pub fn registry(&self) -> &ContainerRegistry {
        &self.services.registry
    }

    /// The container runtime behind the registry.
    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.services.registry.runtime()
    }

    /// The command policy.
    pub fn policy(&self) -> &CommandPolicy {
        &self.services.policy
    }

    /// The validation runner.
    pub fn validation(&self) -> &ValidationRunner {
        &self.services.validation
    }

    /// The audit sink.
    pub fn telemetry(&self) -> &Telemetry {
        &self.services.telemetry
    }

    /// Idle timeout for unleased containers.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Outbound event buffer per connection.
    pub fn outbound_buffer(&self) -> usize {
        self.outbound_buffer
    }
}
