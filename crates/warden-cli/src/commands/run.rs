use std::path::PathBuf;

use warden_config::WardenConfig;
use warden_core::WardenError;

#[cfg(feature = "wasm")]
pub(super) async fn cmd_run(
    config: WardenConfig,
    module: PathBuf,
    id: String,
    permissions: Vec<String>,
) -> warden_core::Result<()> {
    use tracing::info;
    use warden_sandbox::{PluginSandbox, PluginSource};

    use crate::services;

    let bytes = tokio::fs::read(&module)
        .await
        .map_err(|e| WardenError::from_io(module.display(), e))?;

    println!("warden v{}", env!("CARGO_PKG_VERSION"));
    println!("   Plugin: {} ({})", id, module.display());
    println!("   Storage: {}", config.storage.backend);

    // Services and limits are built once; config edits apply on restart.
    let host = services::build_services(&config)?;
    let source = PluginSource::Wasm {
        bytes,
        settings: services::wasm_settings(&config),
    };
    let sandbox = PluginSandbox::new(
        &id,
        source,
        permissions,
        host,
        services::sandbox_limits(&config),
    )?;
    sandbox.activate()?;
    println!("   Running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!(plugin_id = %id, "shutting down");
    sandbox.deactivate().await;

    let stats = sandbox.stats();
    println!(
        "   Calls: {} dispatched, {} rejected, {} errors, {} cancelled",
        stats.dispatched, stats.rejected, stats.errors, stats.cancelled
    );
    Ok(())
}

#[cfg(not(feature = "wasm"))]
pub(super) async fn cmd_run(
    _config: WardenConfig,
    module: PathBuf,
    _id: String,
    _permissions: Vec<String>,
) -> warden_core::Result<()> {
    eprintln!("warden was built without WebAssembly support.");
    eprintln!("   Rebuild with: cargo build --release --features wasm");
    Err(WardenError::Config(format!(
        "cannot run {}: the 'wasm' feature is disabled",
        module.display()
    )))
}
