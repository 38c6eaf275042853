//! # warden-capability
//!
//! Capability-scoped APIs through which plugins reach privileged host
//! operations. Each proxy ([`FileSystemApi`], [`NetworkApi`], [`StorageApi`])
//! is bound to one plugin identifier and forwards to a privileged backend
//! trait. The backends check the plugin's permissions before touching disk,
//! network, or persistent storage.
//!
//! Reference backends:
//!
//! - [`LocalFileSystem`]: per-plugin directory roots, `notify` watches
//! - [`HttpNetwork`]: `reqwest`, per-domain permissions, token-bucket limits
//! - [`MemoryStorage`] / [`SqliteStorage`]: per-plugin key/value stores
//! - [`mock::MockBackend`]: recording backend for tests

pub mod backend;
pub mod filesystem;
pub mod http;
pub mod kv;
pub mod local_fs;
pub mod mock;
pub mod network;
pub mod storage;

pub use backend::{Backends, FileSystemBackend, NetworkBackend, StorageBackend};
pub use filesystem::FileSystemApi;
pub use http::{HttpNetwork, NetworkSettings, RateLimiter};
pub use kv::{MemoryStorage, SqliteStorage};
pub use local_fs::LocalFileSystem;
pub use network::NetworkApi;
pub use storage::StorageApi;
