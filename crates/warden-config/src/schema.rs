use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, read from `warden.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub sandbox: SandboxConfig,
    pub events: EventsConfig,
    pub filesystem: FilesystemConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub wasm: WasmConfig,
    pub logging: LoggingConfig,
}

// ── Sandbox ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Host-side deadline for a single capability call.
    pub call_timeout_ms: u64,
    /// How long the guest waits for a correlated response.
    pub request_timeout_ms: u64,
    /// Grace period for the isolated context to exit on deactivation.
    pub shutdown_deadline_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            request_timeout_ms: 35_000,
            shutdown_deadline_ms: 2_000,
        }
    }
}

impl SandboxConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}

// ── Events ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Emits slower than this are logged as warnings.
    pub latency_warn_ms: u64,
    /// "concurrent" or "serialized".
    pub delivery: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            latency_warn_ms: 20,
            delivery: "concurrent".into(),
        }
    }
}

// ── Filesystem ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Per-plugin roots live at `<root>/<plugin_id>`.
    pub root: PathBuf,
    /// Allow `watchDirectory`. When false, no watcher is wired to the bus.
    pub watch: bool,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("plugin-data"),
            watch: true,
        }
    }
}

// ── Network ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub timeout_secs: u64,
    /// Token bucket size per plugin.
    pub burst: u32,
    pub refill_per_sec: f64,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            burst: 60,
            refill_per_sec: 10.0,
            user_agent: format!("warden/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "sqlite" or "memory".
    pub backend: String,
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".into(),
            db_path: PathBuf::from("plugin-storage.db"),
        }
    }
}

// ── WASM ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// Fuel granted for instantiation and again for every delivered message.
    pub fuel_per_message: u64,
    pub max_memory_bytes: usize,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            fuel_per_message: 500_000_000,
            max_memory_bytes: 32 * 1024 * 1024,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty", "compact" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{} {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];
const VALID_DELIVERY: [&str; 2] = ["concurrent", "serialized"];
const VALID_BACKENDS: [&str; 2] = ["sqlite", "memory"];

impl WardenConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Sandbox timeouts ───
        for (field, value) in [
            ("sandbox.call_timeout_ms", self.sandbox.call_timeout_ms),
            ("sandbox.request_timeout_ms", self.sandbox.request_timeout_ms),
            ("sandbox.shutdown_deadline_ms", self.sandbox.shutdown_deadline_ms),
        ] {
            if value == 0 {
                warnings.push(ConfigWarning {
                    field: field.into(),
                    message: "must be greater than zero".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
        }
        if self.sandbox.request_timeout_ms < self.sandbox.call_timeout_ms {
            warnings.push(ConfigWarning {
                field: "sandbox.request_timeout_ms".into(),
                message: format!(
                    "{}ms is shorter than call_timeout_ms ({}ms); guests will give up before the host answers",
                    self.sandbox.request_timeout_ms, self.sandbox.call_timeout_ms
                ),
                severity: WarningSeverity::Warning,
                hint: Some("Set request_timeout_ms a few seconds above call_timeout_ms".into()),
            });
        }

        // ── Events ───
        if !VALID_DELIVERY.contains(&self.events.delivery.as_str()) {
            warnings.push(ConfigWarning {
                field: "events.delivery".into(),
                message: format!("unknown delivery policy '{}'", self.events.delivery),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", VALID_DELIVERY.join(", "))),
            });
        }
        if self.events.latency_warn_ms == 0 {
            warnings.push(ConfigWarning {
                field: "events.latency_warn_ms".into(),
                message: "0 logs a latency warning for every emit".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Network ───
        if self.network.timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "network.timeout_secs".into(),
                message: "must be greater than zero".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }
        if self.network.burst == 0 || self.network.refill_per_sec <= 0.0 {
            warnings.push(ConfigWarning {
                field: "network.burst".into(),
                message: "token bucket must allow at least one request".into(),
                severity: WarningSeverity::Error,
                hint: Some("Use burst >= 1 and refill_per_sec > 0".into()),
            });
        }

        // ── Storage ───
        if !VALID_BACKENDS.contains(&self.storage.backend.as_str()) {
            warnings.push(ConfigWarning {
                field: "storage.backend".into(),
                message: format!("unknown storage backend '{}'", self.storage.backend),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", VALID_BACKENDS.join(", "))),
            });
        } else if self.storage.backend == "sqlite" && self.storage.db_path.as_os_str().is_empty() {
            warnings.push(ConfigWarning {
                field: "storage.db_path".into(),
                message: "sqlite backend needs a database path".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        } else if self.storage.backend == "memory" {
            warnings.push(ConfigWarning {
                field: "storage.backend".into(),
                message: "plugin storage will not survive a restart".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── WASM ───
        if self.wasm.fuel_per_message == 0 {
            warnings.push(ConfigWarning {
                field: "wasm.fuel_per_message".into(),
                message: "modules will trap on their first instruction".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Logging ───
        if !VALID_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", VALID_LEVELS.join(", "))),
            });
        }
        if !VALID_FORMATS.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", VALID_FORMATS.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
