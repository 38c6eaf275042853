use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, WardenError};

/// Lifecycle of a plugin as seen by the host orchestrator.
///
/// ```text
/// Uninstalled → Installed → Loaded → Activated → Running → Deactivated
///                                         ↑                     │
///                                         └─────────────────────┘
/// ```
///
/// `Error` is reachable from every other state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginLifecycle {
    Uninstalled,
    Installed,
    Loaded,
    Activated,
    Running,
    Deactivated,
    Error,
}

impl PluginLifecycle {
    pub fn can_transition_to(self, next: PluginLifecycle) -> bool {
        use PluginLifecycle::*;
        match (self, next) {
            (Error, _) => false,
            (_, Error) => true,
            (Uninstalled, Installed)
            | (Installed, Loaded)
            | (Installed, Uninstalled)
            | (Loaded, Activated)
            | (Loaded, Deactivated)
            | (Activated, Running)
            | (Activated, Deactivated)
            | (Running, Deactivated)
            | (Deactivated, Activated)
            | (Deactivated, Uninstalled) => true,
            _ => false,
        }
    }

    /// Validate and perform a transition.
    pub fn transition(self, plugin_id: &str, next: PluginLifecycle) -> Result<PluginLifecycle> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(WardenError::InvalidTransition {
                plugin_id: plugin_id.to_string(),
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// States in which the plugin's context is mounted and serviced.
    pub fn is_active(self) -> bool {
        matches!(self, PluginLifecycle::Activated | PluginLifecycle::Running)
    }

    pub fn is_terminal(self) -> bool {
        self == PluginLifecycle::Error
    }
}

impl fmt::Display for PluginLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginLifecycle::Uninstalled => "uninstalled",
            PluginLifecycle::Installed => "installed",
            PluginLifecycle::Loaded => "loaded",
            PluginLifecycle::Activated => "activated",
            PluginLifecycle::Running => "running",
            PluginLifecycle::Deactivated => "deactivated",
            PluginLifecycle::Error => "error",
        };
        f.write_str(s)
    }
}
