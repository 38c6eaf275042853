//! # warden-config
//!
//! Configuration for the Warden host. Reads `warden.toml` and applies
//! environment variable overrides on top.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ConfigWarning, EventsConfig, FilesystemConfig, LoggingConfig, NetworkConfig, SandboxConfig,
    StorageConfig, WardenConfig, WarningSeverity, WasmConfig,
};
