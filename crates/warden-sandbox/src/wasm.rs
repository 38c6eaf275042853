//! WebAssembly execution context.
//!
//! ## Guest ABI
//!
//! Imports (module `warden`):
//!
//! - `send(ptr: u32, len: u32)`: post a JSON `SandboxMessage` to the sandbox
//! - `log(level: u32, ptr: u32, len: u32)`: write a UTF-8 line to the host log
//!   (0 trace, 1 debug, 2 info, 3 warn, 4+ error)
//!
//! Exports:
//!
//! - `memory`: linear memory
//! - `warden_malloc(size: u32) -> u32`: allocate `size` bytes, return pointer
//! - `warden_on_message(ptr: u32, len: u32)`: handle one JSON host message
//!
//! No other import is linked, so `send` is the guest's only way out.

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use wasmtime::*;

use crate::context::ContextPort;
use warden_core::{HostMessage, HostSignal, Result, WardenError};

/// Resource ceilings for one WASM context.
#[derive(Debug, Clone, Copy)]
pub struct WasmSettings {
    /// Fuel granted for instantiation and for each delivered message.
    pub fuel_per_message: u64,
    pub max_memory_bytes: usize,
}

impl Default for WasmSettings {
    fn default() -> Self {
        Self {
            fuel_per_message: 500_000_000,
            max_memory_bytes: 32 * 1024 * 1024,
        }
    }
}

struct GuestState {
    plugin_id: String,
    port: ContextPort,
    limits: StoreLimits,
}

/// A compiled plugin module, instantiated afresh for every activation.
pub struct WasmPlugin {
    plugin_id: String,
    engine: Engine,
    module: Module,
    settings: WasmSettings,
}

fn context_failure(plugin_id: &str, what: &str, e: impl std::fmt::Display) -> WardenError {
    WardenError::ContextFailure {
        plugin_id: plugin_id.to_string(),
        reason: format!("{}: {}", what, e),
    }
}

impl WasmPlugin {
    pub fn compile(plugin_id: &str, bytes: &[u8], settings: WasmSettings) -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.consume_fuel(true);

        let engine = Engine::new(&config)
            .map_err(|e| context_failure(plugin_id, "failed to create WASM engine", e))?;
        let module = Module::new(&engine, bytes)
            .map_err(|e| context_failure(plugin_id, "failed to compile wasm", e))?;

        debug!(plugin_id, bytes = bytes.len(), "compiled plugin module");
        Ok(Self {
            plugin_id: plugin_id.to_string(),
            engine,
            module,
            settings,
        })
    }

    fn linker(&self) -> Result<Linker<GuestState>> {
        let mut linker = Linker::new(&self.engine);
        linker
            .func_wrap(
                "warden",
                "send",
                |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
                    let raw = read_guest(&mut caller, ptr, len)?;
                    if let Err(e) = caller.data().port.send_raw(&raw) {
                        debug!(plugin_id = %caller.data().plugin_id, error = %e, "dropping guest message");
                    }
                    Ok(())
                },
            )
            .map_err(|e| context_failure(&self.plugin_id, "failed to link send", e))?;
        linker
            .func_wrap(
                "warden",
                "log",
                |mut caller: Caller<'_, GuestState>,
                 level: u32,
                 ptr: u32,
                 len: u32|
                 -> wasmtime::Result<()> {
                    let raw = read_guest(&mut caller, ptr, len)?;
                    let line = String::from_utf8_lossy(&raw);
                    let plugin_id = caller.data().plugin_id.as_str();
                    match level {
                        0 => trace!(plugin_id, "{}", line),
                        1 => debug!(plugin_id, "{}", line),
                        2 => info!(plugin_id, "{}", line),
                        3 => warn!(plugin_id, "{}", line),
                        _ => error!(plugin_id, "{}", line),
                    }
                    Ok(())
                },
            )
            .map_err(|e| context_failure(&self.plugin_id, "failed to link log", e))?;
        Ok(linker)
    }

    /// Instantiate the module and feed it host messages until deactivation.
    pub(crate) async fn run(
        &self,
        port: ContextPort,
        mut inbound: mpsc::UnboundedReceiver<HostMessage>,
    ) -> Result<()> {
        let plugin_id = self.plugin_id.as_str();
        let limits = StoreLimitsBuilder::new()
            .memory_size(self.settings.max_memory_bytes)
            .build();
        let mut store = Store::new(
            &self.engine,
            GuestState {
                plugin_id: self.plugin_id.clone(),
                port,
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.settings.fuel_per_message)
            .map_err(|e| context_failure(plugin_id, "failed to set fuel", e))?;

        let instance = self
            .linker()?
            .instantiate_async(&mut store, &self.module)
            .await
            .map_err(|e| context_failure(plugin_id, "failed to instantiate WASM module", e))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| context_failure(plugin_id, "missing export", "memory"))?;
        let malloc = instance
            .get_typed_func::<u32, u32>(&mut store, "warden_malloc")
            .map_err(|e| context_failure(plugin_id, "missing export 'warden_malloc'", e))?;
        let on_message = instance
            .get_typed_func::<(u32, u32), ()>(&mut store, "warden_on_message")
            .map_err(|e| context_failure(plugin_id, "missing export 'warden_on_message'", e))?;

        while let Some(message) = inbound.recv().await {
            let last = matches!(message.body, HostSignal::Deactivate);
            let bytes = serde_json::to_vec(&message)?;

            store
                .set_fuel(self.settings.fuel_per_message)
                .map_err(|e| context_failure(plugin_id, "failed to set fuel", e))?;
            if let Err(trap) = deliver(&mut store, memory, &malloc, &on_message, &bytes).await {
                // A trap is confined to this message; the instance keeps serving.
                warn!(plugin_id, error = %trap, "guest trapped while handling message");
            }
            if last {
                break;
            }
        }
        debug!(plugin_id, "wasm context exited");
        Ok(())
    }
}

async fn deliver(
    store: &mut Store<GuestState>,
    memory: Memory,
    malloc: &TypedFunc<u32, u32>,
    on_message: &TypedFunc<(u32, u32), ()>,
    bytes: &[u8],
) -> wasmtime::Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| Error::msg("message too large"))?;
    let ptr = malloc.call_async(&mut *store, len).await?;
    memory
        .write(&mut *store, ptr as usize, bytes)
        .map_err(|e| Error::msg(format!("guest buffer out of bounds: {}", e)))?;
    on_message.call_async(&mut *store, (ptr, len)).await
}

fn read_guest(caller: &mut Caller<'_, GuestState>, ptr: u32, len: u32) -> wasmtime::Result<Vec<u8>> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| Error::msg("guest does not export 'memory'"))?;
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| Error::msg("guest buffer overflows"))?;
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| Error::msg("guest buffer out of bounds"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_module_is_context_failure() {
        let err = WasmPlugin::compile("p", b"definitely not wasm", WasmSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, WardenError::ContextFailure { .. }));
    }
}
