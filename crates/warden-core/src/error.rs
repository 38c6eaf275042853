use thiserror::Error;

/// Unified error type for the Warden sandbox and its capability backends.
#[derive(Error, Debug)]
pub enum WardenError {
    // ── Permission errors ──────────────────────────────────────
    #[error("permission denied: plugin '{plugin_id}' lacks '{permission}'")]
    PermissionDenied {
        plugin_id: String,
        permission: String,
    },

    #[error("invalid permission string '{input}': {reason}")]
    InvalidPermission { input: String, reason: String },

    // ── Capability errors ──────────────────────────────────────
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    // ── Sandbox / protocol errors ──────────────────────────────
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid lifecycle transition for '{plugin_id}': {from} -> {to}")]
    InvalidTransition {
        plugin_id: String,
        from: String,
        to: String,
    },

    #[error("timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("execution context failure: {plugin_id}: {reason}")]
    ContextFailure { plugin_id: String, reason: String },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl WardenError {
    /// Map an I/O error onto the capability taxonomy, keeping "not found"
    /// distinguishable for plugins.
    pub fn from_io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => WardenError::NotFound(context.to_string()),
            _ => WardenError::Io(std::io::Error::new(
                err.kind(),
                format!("{}: {}", context, err),
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
