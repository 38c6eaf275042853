use std::sync::Arc;
use std::time::Duration;

use warden_capability::mock::MockBackend;
use warden_capability::Backends;
use warden_core::PermissionRegistry;
use warden_events::EventBus;

/// Everything the host orchestrator shares with each sandbox it builds.
///
/// The bus and registry are handles: every sandbox built from clones of one
/// `HostServices` talks to the same bus and the same permission table.
#[derive(Clone)]
pub struct HostServices {
    pub bus: EventBus,
    pub backends: Backends,
    pub permissions: PermissionRegistry,
}

impl HostServices {
    pub fn new(bus: EventBus, backends: Backends, permissions: PermissionRegistry) -> Self {
        Self {
            bus,
            backends,
            permissions,
        }
    }

    /// Services backed entirely by one [`MockBackend`].
    pub fn mock(backend: Arc<MockBackend>) -> Self {
        Self::new(
            EventBus::new(),
            Backends::uniform(backend),
            PermissionRegistry::new(),
        )
    }
}

/// Deadlines applied by a sandbox.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    /// Host-side deadline for one capability call.
    pub call_timeout: Duration,
    /// How long guest code waits for a correlated response.
    pub request_timeout: Duration,
    /// Grace period for the context to exit on deactivation.
    pub shutdown_deadline: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(35),
            shutdown_deadline: Duration::from_secs(2),
        }
    }
}
