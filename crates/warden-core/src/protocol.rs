//! The sandbox wire protocol.
//!
//! Every exchange between a plugin's isolated context and its sandbox is a
//! [`SandboxMessage`]: `{ type, requestId, pluginId, payload }`. The `type`
//! and `payload` pair is carried by a closed enum, one per direction:
//!
//! - [`PluginCall`]: plugin → host: capability calls and event operations.
//! - [`HostSignal`]: host → plugin: responses, errors, event delivery and
//!   lifecycle signals.
//!
//! Splitting the directions means a plugin can never even encode a host-only
//! message, and the dispatch boundary matches exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::WardenError;
use crate::types::HttpRequest;

/// A single protocol message. `B` is the direction-specific body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxMessage<B> {
    /// Correlates a response with its request. Empty for one-way signals.
    #[serde(default)]
    pub request_id: String,
    /// The originating (plugin → host) or target (host → plugin) plugin.
    pub plugin_id: String,
    #[serde(flatten)]
    pub body: B,
}

/// A message travelling from a plugin's context to its sandbox.
pub type CallMessage = SandboxMessage<PluginCall>;

/// A message travelling from a sandbox into its plugin's context.
pub type HostMessage = SandboxMessage<HostSignal>;

impl<B> SandboxMessage<B> {
    /// Whether this message expects no correlated answer.
    pub fn is_one_way(&self) -> bool {
        self.request_id.is_empty()
    }
}

impl CallMessage {
    pub fn request(
        plugin_id: impl Into<String>,
        request_id: impl Into<String>,
        call: PluginCall,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            plugin_id: plugin_id.into(),
            body: call,
        }
    }
}

impl HostMessage {
    /// A successful answer to `request_id`.
    pub fn response(plugin_id: &str, request_id: &str, payload: Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            plugin_id: plugin_id.to_string(),
            body: HostSignal::Response(payload),
        }
    }

    /// A failed answer to `request_id`.
    pub fn error(plugin_id: &str, request_id: &str, error: ApiError) -> Self {
        Self {
            request_id: request_id.to_string(),
            plugin_id: plugin_id.to_string(),
            body: HostSignal::Error(error),
        }
    }

    /// A one-way signal (lifecycle or event delivery).
    pub fn signal(plugin_id: &str, signal: HostSignal) -> Self {
        Self {
            request_id: String::new(),
            plugin_id: plugin_id.to_string(),
            body: signal,
        }
    }
}

// ── Plugin → host ──────────────────────────────────────────────

/// Every operation a plugin can ask its sandbox to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum PluginCall {
    // Filesystem
    #[serde(rename = "fs.readFile")]
    FsReadFile { path: String },
    #[serde(rename = "fs.writeFile")]
    FsWriteFile { path: String, contents: String },
    #[serde(rename = "fs.listFiles")]
    FsListFiles {
        path: String,
        #[serde(default)]
        pattern: Option<String>,
    },
    #[serde(rename = "fs.deleteFile")]
    FsDeleteFile { path: String },
    #[serde(rename = "fs.createDirectory")]
    FsCreateDirectory { path: String },
    #[serde(rename = "fs.exists")]
    FsExists { path: String },
    #[serde(rename = "fs.watchDirectory")]
    FsWatchDirectory { path: String },
    #[serde(rename = "fs.unwatchDirectory")]
    FsUnwatchDirectory,

    // Network
    #[serde(rename = "http.request")]
    HttpRequest(HttpRequest),
    #[serde(rename = "http.get")]
    HttpGet {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    #[serde(rename = "http.post")]
    HttpPost {
        url: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    #[serde(rename = "http.put")]
    HttpPut {
        url: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    #[serde(rename = "http.delete")]
    HttpDelete {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    #[serde(rename = "http.patch")]
    HttpPatch {
        url: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },

    // Storage
    #[serde(rename = "storage.set")]
    StorageSet { key: String, value: String },
    #[serde(rename = "storage.get")]
    StorageGet { key: String },
    #[serde(rename = "storage.delete")]
    StorageDelete { key: String },
    #[serde(rename = "storage.clear")]
    StorageClear,
    #[serde(rename = "storage.keys")]
    StorageKeys,
    #[serde(rename = "storage.has")]
    StorageHas { key: String },
    #[serde(rename = "storage.size")]
    StorageSize,

    // Events
    #[serde(rename = "event.on")]
    EventOn { event: String },
    #[serde(rename = "event.emit")]
    EventEmit {
        event: String,
        #[serde(default)]
        data: Value,
    },
    /// Drop one registration (`subscription_id` is the request id of the
    /// `event.on` call) or, when absent, every registration for `event`.
    #[serde(rename = "event.off")]
    EventOff {
        event: String,
        #[serde(default)]
        subscription_id: Option<String>,
    },
}

/// The capability group a call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallFamily {
    FileSystem,
    Network,
    Storage,
    Events,
}

impl PluginCall {
    /// The wire `type` string, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            PluginCall::FsReadFile { .. } => "fs.readFile",
            PluginCall::FsWriteFile { .. } => "fs.writeFile",
            PluginCall::FsListFiles { .. } => "fs.listFiles",
            PluginCall::FsDeleteFile { .. } => "fs.deleteFile",
            PluginCall::FsCreateDirectory { .. } => "fs.createDirectory",
            PluginCall::FsExists { .. } => "fs.exists",
            PluginCall::FsWatchDirectory { .. } => "fs.watchDirectory",
            PluginCall::FsUnwatchDirectory => "fs.unwatchDirectory",
            PluginCall::HttpRequest(_) => "http.request",
            PluginCall::HttpGet { .. } => "http.get",
            PluginCall::HttpPost { .. } => "http.post",
            PluginCall::HttpPut { .. } => "http.put",
            PluginCall::HttpDelete { .. } => "http.delete",
            PluginCall::HttpPatch { .. } => "http.patch",
            PluginCall::StorageSet { .. } => "storage.set",
            PluginCall::StorageGet { .. } => "storage.get",
            PluginCall::StorageDelete { .. } => "storage.delete",
            PluginCall::StorageClear => "storage.clear",
            PluginCall::StorageKeys => "storage.keys",
            PluginCall::StorageHas { .. } => "storage.has",
            PluginCall::StorageSize => "storage.size",
            PluginCall::EventOn { .. } => "event.on",
            PluginCall::EventEmit { .. } => "event.emit",
            PluginCall::EventOff { .. } => "event.off",
        }
    }

    pub fn family(&self) -> CallFamily {
        match self.method().split_once('.').map(|(family, _)| family) {
            Some("fs") => CallFamily::FileSystem,
            Some("http") => CallFamily::Network,
            Some("storage") => CallFamily::Storage,
            _ => CallFamily::Events,
        }
    }
}

// ── Host → plugin ──────────────────────────────────────────────

/// Everything a sandbox sends into a plugin's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum HostSignal {
    #[serde(rename = "api.response")]
    Response(Value),
    #[serde(rename = "api.error")]
    Error(ApiError),
    #[serde(rename = "event.triggered")]
    EventTriggered {
        event: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename = "plugin.activate")]
    Activate,
    #[serde(rename = "plugin.deactivate")]
    Deactivate,
}

// ── Errors on the wire ─────────────────────────────────────────

/// Machine-readable class of an `api.error` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorCode {
    PermissionDenied,
    NotFound,
    InvalidInput,
    Network,
    Storage,
    Parse,
    Protocol,
    Timeout,
    Cancelled,
    Internal,
}

/// The payload of an `api.error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ApiErrorCode,
    /// Human-readable description, shown to plugin authors.
    pub message: String,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(operation: &str, timeout_ms: u64) -> Self {
        Self::new(
            ApiErrorCode::Timeout,
            format!("{} timed out after {}ms", operation, timeout_ms),
        )
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Cancelled, reason)
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Protocol, reason)
    }
}

impl From<&WardenError> for ApiError {
    fn from(err: &WardenError) -> Self {
        let code = match err {
            WardenError::PermissionDenied { .. } => ApiErrorCode::PermissionDenied,
            WardenError::NotFound(_) => ApiErrorCode::NotFound,
            WardenError::InvalidPath(_)
            | WardenError::InvalidInput(_)
            | WardenError::InvalidPermission { .. } => ApiErrorCode::InvalidInput,
            WardenError::Network(_) => ApiErrorCode::Network,
            WardenError::Storage(_) => ApiErrorCode::Storage,
            WardenError::Serialization(_) => ApiErrorCode::Parse,
            WardenError::Protocol(_) => ApiErrorCode::Protocol,
            WardenError::Timeout { .. } => ApiErrorCode::Timeout,
            WardenError::Cancelled(_) => ApiErrorCode::Cancelled,
            WardenError::Io(_)
            | WardenError::InvalidTransition { .. }
            | WardenError::ContextFailure { .. }
            | WardenError::Config(_)
            | WardenError::Other(_) => ApiErrorCode::Internal,
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        ApiError::from(&err)
    }
}
