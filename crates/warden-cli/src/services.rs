//! Builds the host-side services a sandbox needs from `warden.toml`.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use warden_capability::{
    Backends, FileSystemBackend, HttpNetwork, LocalFileSystem, MemoryStorage, NetworkSettings,
    SqliteStorage, StorageBackend,
};
use warden_config::WardenConfig;
use warden_core::{PermissionRegistry, Result, WardenError};
use warden_events::{BusConfig, DeliveryPolicy, EventBus};
use warden_sandbox::{HostServices, SandboxLimits};

pub fn sandbox_limits(config: &WardenConfig) -> SandboxLimits {
    SandboxLimits {
        call_timeout: config.sandbox.call_timeout(),
        request_timeout: config.sandbox.request_timeout(),
        shutdown_deadline: config.sandbox.shutdown_deadline(),
    }
}

pub fn bus_config(config: &WardenConfig) -> Result<BusConfig> {
    let delivery = config
        .events
        .delivery
        .parse::<DeliveryPolicy>()
        .map_err(WardenError::Config)?;
    Ok(BusConfig {
        latency_warn: Duration::from_millis(config.events.latency_warn_ms),
        delivery,
    })
}

pub fn network_settings(config: &WardenConfig) -> NetworkSettings {
    NetworkSettings {
        timeout: Duration::from_secs(config.network.timeout_secs),
        burst: config.network.burst,
        refill_per_sec: config.network.refill_per_sec,
        user_agent: config.network.user_agent.clone(),
    }
}

#[cfg(feature = "wasm")]
pub fn wasm_settings(config: &WardenConfig) -> warden_sandbox::WasmSettings {
    warden_sandbox::WasmSettings {
        fuel_per_message: config.wasm.fuel_per_message,
        max_memory_bytes: config.wasm.max_memory_bytes,
    }
}

/// Construct the bus, permission registry and concrete backends.
pub fn build_services(config: &WardenConfig) -> Result<HostServices> {
    let permissions = PermissionRegistry::new();
    let bus = EventBus::with_config(bus_config(config)?);

    let mut filesystem = LocalFileSystem::new(&config.filesystem.root, permissions.clone());
    if config.filesystem.watch {
        filesystem = filesystem.with_event_bus(bus.clone());
    }
    let filesystem: Arc<dyn FileSystemBackend> = Arc::new(filesystem);

    let network = Arc::new(HttpNetwork::new(
        permissions.clone(),
        network_settings(config),
    )?);

    let storage: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "memory" => Arc::new(MemoryStorage::with_permissions(permissions.clone())),
        "sqlite" => Arc::new(
            SqliteStorage::open(&config.storage.db_path)?.with_permissions(permissions.clone()),
        ),
        other => {
            return Err(WardenError::Config(format!(
                "unknown storage backend '{}'",
                other
            )));
        }
    };

    info!(
        fs_root = %config.filesystem.root.display(),
        storage = %config.storage.backend,
        delivery = %config.events.delivery,
        "host services ready"
    );

    Ok(HostServices::new(
        bus,
        Backends::new(filesystem, network, storage),
        permissions,
    ))
}
