//! # warden-core
//!
//! Core types, protocol messages, and permission primitives for the Warden
//! plugin sandbox. This crate defines the shared vocabulary used by every
//! other crate in the workspace: the `SandboxMessage` wire unit, the
//! permission string grammar, and the plugin lifecycle state machine.

pub mod error;
pub mod lifecycle;
pub mod permission;
pub mod protocol;
pub mod types;

pub use error::{Result, WardenError};
pub use lifecycle::PluginLifecycle;
pub use permission::{Permission, PermissionCategory, PermissionRegistry, PermissionSet};
pub use protocol::{
    ApiError, ApiErrorCode, CallMessage, HostMessage, HostSignal, PluginCall, SandboxMessage,
};
pub use types::*;
