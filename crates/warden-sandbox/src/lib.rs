//! # warden-sandbox
//!
//! One [`PluginSandbox`] per plugin instance. The sandbox mounts an isolated
//! execution context, validates every message that context sends (origin,
//! plugin id, request id), dispatches it to exactly one capability proxy or
//! event bus operation, and answers it exactly once.
//!
//! Contexts come in two kinds:
//!
//! - **native**: a [`PluginScript`] that only ever holds a [`PluginApi`]
//! - **wasm** (feature `wasm`): a `wasmtime` module whose single outbound
//!   import posts JSON messages to the sandbox
//!
//! ```text
//!  context ──Envelope──▶ router ──▶ handle_api_call ──▶ FileSystemApi / NetworkApi /
//!     ▲                                    │              StorageApi / EventBus
//!     └──────────── HostMessage ◀──────────┘
//! ```

pub mod context;
pub mod guest;
pub mod host;
pub mod sandbox;
#[cfg(feature = "wasm")]
pub mod wasm;

pub use context::{ContextId, ContextPort, Envelope, Inbound};
pub use guest::{GuestResult, PluginApi, PluginScript};
pub use host::{HostServices, SandboxLimits};
pub use sandbox::{PluginSandbox, PluginSource, SandboxStats};
#[cfg(feature = "wasm")]
pub use wasm::{WasmPlugin, WasmSettings};
