use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{ContextId, ContextPort, Envelope, Inbound};
use crate::guest::{self, PluginApi, PluginScript};
use crate::host::{HostServices, SandboxLimits};
#[cfg(feature = "wasm")]
use crate::wasm::{WasmPlugin, WasmSettings};
use warden_capability::{FileSystemApi, NetworkApi, StorageApi};
use warden_core::{
    ApiError, ApiErrorCode, HostMessage, HostSignal, PermissionSet, PluginCall, PluginLifecycle,
    Result, WardenError,
};
use warden_events::{Subscription, handler};

/// The code a sandbox runs.
pub enum PluginSource {
    /// A native plugin. It sees nothing but the [`PluginApi`] it is handed.
    Native(Arc<dyn PluginScript>),
    /// A WebAssembly module, compiled when the sandbox is built.
    #[cfg(feature = "wasm")]
    Wasm {
        bytes: Vec<u8>,
        settings: WasmSettings,
    },
}

enum Program {
    Native(Arc<dyn PluginScript>),
    #[cfg(feature = "wasm")]
    Wasm(Arc<WasmPlugin>),
}

/// A mounted execution context.
struct MountedContext {
    id: ContextId,
    inbound: mpsc::UnboundedSender<HostMessage>,
    task: JoinHandle<()>,
    router: JoinHandle<()>,
}

struct Runtime {
    lifecycle: PluginLifecycle,
    context: Option<MountedContext>,
}

/// One plugin's interest in one event.
struct EventSubscription {
    /// Request ids of the `event.on` calls that registered interest.
    request_ids: HashSet<String>,
    subscription: Subscription,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time counters for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SandboxStats {
    /// Calls handed to a capability or the event bus.
    pub dispatched: u64,
    /// Envelopes dropped by origin, identity or request-id validation.
    pub rejected: u64,
    /// `api.error` answers sent, cancellations excluded.
    pub errors: u64,
    /// In-flight calls answered with `cancelled` on deactivation.
    pub cancelled: u64,
    /// Events with a live bus subscription.
    pub subscriptions: usize,
}

struct SandboxInner {
    plugin_id: String,
    permissions: Vec<String>,
    services: HostServices,
    limits: SandboxLimits,
    program: Program,
    fs: FileSystemApi,
    http: NetworkApi,
    storage: StorageApi,
    runtime: Mutex<Runtime>,
    subscriptions: Mutex<HashMap<String, EventSubscription>>,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    counters: Counters,
}

impl Drop for SandboxInner {
    fn drop(&mut self) {
        if let Some(context) = self.runtime.get_mut().context.take() {
            context.task.abort();
            context.router.abort();
        }
    }
}

/// Owns one plugin's isolated execution context and mediates every
/// capability and event operation that context requests.
///
/// Cloning yields another handle to the same sandbox.
#[derive(Clone)]
pub struct PluginSandbox {
    inner: Arc<SandboxInner>,
}

impl PluginSandbox {
    /// Build a sandbox for `plugin_id`. The manifest permission list is
    /// forwarded to the host's permission registry untouched.
    ///
    /// Fails with `ContextFailure` when the context cannot be prepared
    /// (e.g. the WASM module does not compile).
    pub fn new(
        plugin_id: &str,
        source: PluginSource,
        permissions: Vec<String>,
        services: HostServices,
        limits: SandboxLimits,
    ) -> Result<Self> {
        if plugin_id.is_empty() {
            return Err(WardenError::ContextFailure {
                plugin_id: String::new(),
                reason: "plugin id must not be empty".into(),
            });
        }

        let program = match source {
            PluginSource::Native(script) => Program::Native(script),
            #[cfg(feature = "wasm")]
            PluginSource::Wasm { bytes, settings } => {
                Program::Wasm(Arc::new(WasmPlugin::compile(plugin_id, &bytes, settings)?))
            }
        };

        services
            .permissions
            .grant(plugin_id, PermissionSet::parse_lenient(&permissions));

        let backends = &services.backends;
        let inner = SandboxInner {
            plugin_id: plugin_id.to_string(),
            fs: FileSystemApi::new(plugin_id, Arc::clone(&backends.filesystem)),
            http: NetworkApi::new(plugin_id, Arc::clone(&backends.network)),
            storage: StorageApi::new(plugin_id, Arc::clone(&backends.storage)),
            permissions,
            services,
            limits,
            program,
            runtime: Mutex::new(Runtime {
                lifecycle: PluginLifecycle::Loaded,
                context: None,
            }),
            subscriptions: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        };
        info!(plugin_id, "sandbox created");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    /// The manifest permission list this sandbox was built with.
    pub fn permissions(&self) -> &[String] {
        &self.inner.permissions
    }

    pub fn lifecycle(&self) -> PluginLifecycle {
        self.inner.runtime.lock().lifecycle
    }

    /// Identity of the currently mounted context, if any.
    pub fn context_id(&self) -> Option<ContextId> {
        self.inner.runtime.lock().context.as_ref().map(|c| c.id)
    }

    /// Calls currently being serviced.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Events this plugin holds a bus subscription for.
    pub fn subscribed_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.inner.subscriptions.lock().keys().cloned().collect();
        events.sort();
        events
    }

    pub fn stats(&self) -> SandboxStats {
        let c = &self.inner.counters;
        SandboxStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            subscriptions: self.inner.subscriptions.lock().len(),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Mount the context and signal activation. A no-op while already
    /// active. A deactivated sandbox may be activated again; it gets a
    /// fresh context and its permissions are granted anew.
    ///
    /// Must be called from within a tokio runtime.
    pub fn activate(&self) -> Result<()> {
        let plugin_id = self.plugin_id();
        let mut runtime = self.inner.runtime.lock();
        if runtime.lifecycle.is_active() {
            debug!(plugin_id, "already active");
            return Ok(());
        }
        let activated = runtime
            .lifecycle
            .transition(plugin_id, PluginLifecycle::Activated)?;
        if runtime.lifecycle == PluginLifecycle::Deactivated {
            self.inner.services.permissions.grant(
                plugin_id,
                PermissionSet::parse_lenient(&self.inner.permissions),
            );
        }

        let id = ContextId::fresh();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let port = ContextPort::new(id, out_tx);

        let task = match &self.inner.program {
            Program::Native(script) => {
                let api = PluginApi::new(plugin_id, port, self.inner.limits.request_timeout);
                tokio::spawn(guest::run_native(Arc::clone(script), api, in_rx))
            }
            #[cfg(feature = "wasm")]
            Program::Wasm(module) => {
                let module = Arc::clone(module);
                let plugin_id = plugin_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = module.run(port, in_rx).await {
                        error!(plugin_id = %plugin_id, error = %e, "wasm context failed");
                    }
                })
            }
        };
        let router = tokio::spawn(route(Arc::downgrade(&self.inner), out_rx));

        // The context only starts reading once activation is queued.
        let _ = in_tx.send(HostMessage::signal(plugin_id, HostSignal::Activate));
        runtime.context = Some(MountedContext {
            id,
            inbound: in_tx,
            task,
            router,
        });
        runtime.lifecycle = activated.transition(plugin_id, PluginLifecycle::Running)?;
        info!(plugin_id, context = %id, "plugin activated");
        Ok(())
    }

    /// Signal deactivation, answer every in-flight call with `cancelled`,
    /// release all event subscriptions and unmount the context.
    ///
    /// Idempotent; never fails.
    pub async fn deactivate(&self) {
        let plugin_id = self.plugin_id().to_string();
        let context = {
            let mut runtime = self.inner.runtime.lock();
            match runtime.lifecycle {
                PluginLifecycle::Activated | PluginLifecycle::Running => {
                    runtime.lifecycle = PluginLifecycle::Deactivated;
                }
                // A context that died on its own still needs its bookkeeping released.
                PluginLifecycle::Error if runtime.context.is_some() => {}
                other => {
                    debug!(plugin_id = %plugin_id, state = %other, "deactivate on inactive sandbox");
                    return;
                }
            }
            runtime.context.take()
        };

        let in_flight: Vec<(String, CancellationToken)> =
            self.inner.in_flight.lock().drain().collect();
        for (request_id, token) in &in_flight {
            token.cancel();
            if let Some(ctx) = &context {
                let _ = ctx.inbound.send(HostMessage::error(
                    &plugin_id,
                    request_id,
                    ApiError::cancelled("plugin deactivated"),
                ));
            }
        }
        self.inner
            .counters
            .cancelled
            .fetch_add(in_flight.len() as u64, Ordering::Relaxed);

        if let Some(ctx) = &context {
            let _ = ctx
                .inbound
                .send(HostMessage::signal(&plugin_id, HostSignal::Deactivate));
        }

        let released = self.release_subscriptions();
        let cleared = self.inner.services.bus.clear_plugin(&plugin_id);
        let unwatch = self
            .inner
            .services
            .backends
            .filesystem
            .unwatch_directory(&plugin_id);
        match tokio::time::timeout(self.inner.limits.shutdown_deadline, unwatch).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(plugin_id = %plugin_id, error = %e, "unwatch on deactivate failed"),
            Err(_) => debug!(plugin_id = %plugin_id, "unwatch on deactivate timed out"),
        }
        self.inner.services.backends.network.release_plugin(&plugin_id);

        if let Some(ctx) = context {
            let MountedContext {
                inbound,
                task,
                router,
                ..
            } = ctx;
            drop(inbound);
            let abort = task.abort_handle();
            match tokio::time::timeout(self.inner.limits.shutdown_deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    warn!(plugin_id = %plugin_id, "context panicked during shutdown")
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(
                        plugin_id = %plugin_id,
                        deadline_ms = self.inner.limits.shutdown_deadline.as_millis() as u64,
                        "context did not exit in time; aborting"
                    );
                    abort.abort();
                }
            }
            router.abort();
        }

        self.inner.services.permissions.revoke(&plugin_id);
        info!(
            plugin_id = %plugin_id,
            cancelled = in_flight.len(),
            subscriptions = released,
            bus_entries = cleared,
            "plugin deactivated"
        );
    }

    fn release_subscriptions(&self) -> usize {
        let drained: Vec<EventSubscription> = self
            .inner
            .subscriptions
            .lock()
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in &drained {
            sub.subscription.dispose();
        }
        drained.len()
    }

    /// Forward a host message into the mounted context, if there is one.
    fn deliver(&self, message: HostMessage) {
        let runtime = self.inner.runtime.lock();
        match &runtime.context {
            Some(ctx) => {
                if ctx.inbound.send(message).is_err() {
                    debug!(plugin_id = %self.inner.plugin_id, "context channel closed");
                }
            }
            None => debug!(plugin_id = %self.inner.plugin_id, "no mounted context; message dropped"),
        }
    }

    // ── Routing ────────────────────────────────────────────────

    /// Validate and service one inbound envelope.
    ///
    /// Returns the single answer for a request, or `None` when the envelope
    /// is discarded (wrong origin, wrong plugin id, missing request id,
    /// duplicate request id) or when deactivation already answered it.
    pub async fn handle_api_call(&self, envelope: Envelope) -> Option<HostMessage> {
        let plugin_id = self.plugin_id();

        let mounted = self.context_id();
        if mounted != Some(envelope.origin) {
            warn!(plugin_id, origin = %envelope.origin, "rejecting message from foreign context");
            self.reject();
            return None;
        }

        let message = match envelope.inbound {
            Inbound::Call(message) => message,
            Inbound::Malformed {
                request_id,
                plugin_id: claimed,
                reason,
            } => {
                if claimed.as_deref().is_some_and(|p| p != plugin_id) {
                    warn!(plugin_id, claimed = ?claimed, "rejecting malformed message for another plugin");
                    self.reject();
                    return None;
                }
                warn!(plugin_id, request_id = ?request_id, reason = %reason, "protocol violation");
                let request_id = request_id.filter(|id| !id.is_empty())?;
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Some(HostMessage::error(
                    plugin_id,
                    &request_id,
                    ApiError::protocol(reason),
                ));
            }
        };

        if message.plugin_id != plugin_id {
            warn!(plugin_id, claimed = %message.plugin_id, "rejecting message with mismatched plugin id");
            self.reject();
            return None;
        }
        if message.request_id.is_empty() {
            warn!(plugin_id, method = message.body.method(), "rejecting call without request id");
            self.reject();
            return None;
        }
        let request_id = message.request_id;
        let call = message.body;
        let method = call.method();

        if !self.lifecycle().is_active() {
            return Some(HostMessage::error(
                plugin_id,
                &request_id,
                ApiError::cancelled("plugin is not active"),
            ));
        }

        let token = CancellationToken::new();
        {
            let mut in_flight = self.inner.in_flight.lock();
            if in_flight.contains_key(&request_id) {
                warn!(plugin_id, request_id = %request_id, "rejecting duplicate request id");
                drop(in_flight);
                self.reject();
                return None;
            }
            in_flight.insert(request_id.clone(), token.clone());
        }
        // Deactivation flips the lifecycle before draining `in_flight`, so a
        // call registered after the drain must notice the flip here.
        if !self.lifecycle().is_active() {
            self.inner.in_flight.lock().remove(&request_id)?;
            return Some(HostMessage::error(
                plugin_id,
                &request_id,
                ApiError::cancelled("plugin is not active"),
            ));
        }

        debug!(plugin_id, request_id = %request_id, method, "dispatching");
        self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let timeout = self.inner.limits.call_timeout;
        let work = AssertUnwindSafe(self.dispatch(&request_id, call)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = tokio::time::timeout(timeout, work) => Some(result),
        };

        // Whoever removes the entry owns the answer.
        if self.inner.in_flight.lock().remove(&request_id).is_none() {
            return None;
        }
        let outcome = outcome?;

        let answer = match outcome {
            Ok(Ok(Ok(payload))) => return Some(HostMessage::response(plugin_id, &request_id, payload)),
            Ok(Ok(Err(e))) => {
                warn!(plugin_id, request_id = %request_id, method, error = %e, "capability call failed");
                ApiError::from(&e)
            }
            Ok(Err(_)) => {
                error!(plugin_id, request_id = %request_id, method, "capability handler panicked");
                ApiError::new(ApiErrorCode::Internal, format!("{} failed internally", method))
            }
            Err(_) => {
                warn!(plugin_id, request_id = %request_id, method, timeout_ms = timeout.as_millis() as u64, "capability call timed out");
                ApiError::timeout(method, timeout.as_millis() as u64)
            }
        };
        self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
        Some(HostMessage::error(plugin_id, &request_id, answer))
    }

    fn reject(&self) {
        self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    async fn dispatch(&self, request_id: &str, call: PluginCall) -> Result<Value> {
        let inner = &self.inner;
        let value = match call {
            PluginCall::FsReadFile { path } => Value::String(inner.fs.read_file(&path).await?),
            PluginCall::FsWriteFile { path, contents } => {
                inner.fs.write_file(&path, &contents).await?;
                Value::Null
            }
            PluginCall::FsListFiles { path, pattern } => {
                serde_json::to_value(inner.fs.list_files(&path, pattern.as_deref()).await?)?
            }
            PluginCall::FsDeleteFile { path } => {
                inner.fs.delete_file(&path).await?;
                Value::Null
            }
            PluginCall::FsCreateDirectory { path } => {
                inner.fs.create_directory(&path).await?;
                Value::Null
            }
            PluginCall::FsExists { path } => Value::Bool(inner.fs.exists(&path).await?),
            PluginCall::FsWatchDirectory { path } => {
                inner.fs.watch_directory(&path).await?;
                Value::Null
            }
            PluginCall::FsUnwatchDirectory => {
                inner.fs.unwatch_directory().await?;
                Value::Null
            }

            PluginCall::HttpRequest(request) => serde_json::to_value(inner.http.request(request).await?)?,
            PluginCall::HttpGet { url, headers } => serde_json::to_value(inner.http.get(&url, headers).await?)?,
            PluginCall::HttpPost { url, body, headers } => {
                serde_json::to_value(inner.http.post(&url, body, headers).await?)?
            }
            PluginCall::HttpPut { url, body, headers } => {
                serde_json::to_value(inner.http.put(&url, body, headers).await?)?
            }
            PluginCall::HttpDelete { url, headers } => {
                serde_json::to_value(inner.http.delete(&url, headers).await?)?
            }
            PluginCall::HttpPatch { url, body, headers } => {
                serde_json::to_value(inner.http.patch(&url, body, headers).await?)?
            }

            PluginCall::StorageSet { key, value } => {
                inner.storage.set(&key, &value).await?;
                Value::Null
            }
            PluginCall::StorageGet { key } => match inner.storage.get(&key).await? {
                Some(value) => Value::String(value),
                None => Value::Null,
            },
            PluginCall::StorageDelete { key } => Value::Bool(inner.storage.delete(&key).await?),
            PluginCall::StorageClear => {
                inner.storage.clear().await?;
                Value::Null
            }
            PluginCall::StorageKeys => serde_json::to_value(inner.storage.keys().await?)?,
            PluginCall::StorageHas { key } => Value::Bool(inner.storage.has(&key).await?),
            PluginCall::StorageSize => json!(inner.storage.size().await?),

            PluginCall::EventOn { event } => self.subscribe(&event, request_id),
            PluginCall::EventEmit { event, data } => {
                let report = inner
                    .services
                    .bus
                    .emit_from(&inner.plugin_id, &event, data)
                    .await;
                json!({ "event": report.event, "delivered": report.delivered })
            }
            PluginCall::EventOff {
                event,
                subscription_id,
            } => self.unsubscribe(&event, subscription_id.as_deref()),
        };
        Ok(value)
    }

    // ── Event bookkeeping ──────────────────────────────────────

    /// Register interest in `event`. The first registration subscribes to
    /// the bus; later ones only add bookkeeping.
    fn subscribe(&self, event: &str, request_id: &str) -> Value {
        let mut subscriptions = self.inner.subscriptions.lock();
        if let Some(existing) = subscriptions.get_mut(event) {
            existing.request_ids.insert(request_id.to_string());
            let resolved = existing.subscription.event().to_string();
            debug!(plugin_id = %self.inner.plugin_id, event, interest = existing.request_ids.len(), "reusing subscription");
            return json!({ "subscriptionId": request_id, "event": resolved });
        }

        let weak: Weak<SandboxInner> = Arc::downgrade(&self.inner);
        let local_name = event.to_string();
        let forward = handler(move |data| {
            let weak = weak.clone();
            let event = local_name.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    let sandbox = PluginSandbox { inner };
                    let signal = HostSignal::EventTriggered { event, data };
                    sandbox.deliver(HostMessage::signal(sandbox.plugin_id(), signal));
                }
                Ok(())
            }
        });
        let subscription = self
            .inner
            .services
            .bus
            .on(event, forward, Some(self.inner.plugin_id.as_str()));
        let resolved = subscription.event().to_string();
        subscriptions.insert(
            event.to_string(),
            EventSubscription {
                request_ids: HashSet::from([request_id.to_string()]),
                subscription,
            },
        );
        debug!(plugin_id = %self.inner.plugin_id, event = %resolved, "subscribed to bus");
        json!({ "subscriptionId": request_id, "event": resolved })
    }

    /// Drop one registration (or all of them for `event`). Releases the bus
    /// subscription when the last registration goes.
    fn unsubscribe(&self, event: &str, subscription_id: Option<&str>) -> Value {
        let mut subscriptions = self.inner.subscriptions.lock();
        let Some(entry) = subscriptions.get_mut(event) else {
            return json!({ "removed": false, "released": false });
        };
        let removed = match subscription_id {
            Some(id) => entry.request_ids.remove(id),
            None => {
                let any = !entry.request_ids.is_empty();
                entry.request_ids.clear();
                any
            }
        };
        let released = entry.request_ids.is_empty();
        if released {
            if let Some(entry) = subscriptions.remove(event) {
                entry.subscription.dispose();
                debug!(plugin_id = %self.inner.plugin_id, event, "released bus subscription");
            }
        }
        json!({ "removed": removed, "released": released })
    }
}

/// Service every envelope a context sends until it hangs up. Each call runs
/// on its own task so a slow capability never holds up the next one.
async fn route(sandbox: Weak<SandboxInner>, mut outbound: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = outbound.recv().await {
        let Some(inner) = sandbox.upgrade() else {
            break;
        };
        let sandbox = PluginSandbox { inner };
        tokio::spawn(async move {
            if let Some(answer) = sandbox.handle_api_call(envelope).await {
                sandbox.deliver(answer);
            }
        });
    }

    // Every port is gone: the context exited. Unless that was a deactivation,
    // the plugin is now in the error state.
    if let Some(inner) = sandbox.upgrade() {
        let mut runtime = inner.runtime.lock();
        if runtime.lifecycle.is_active() {
            warn!(plugin_id = %inner.plugin_id, "plugin context exited unexpectedly");
            runtime.lifecycle = PluginLifecycle::Error;
        }
    }
}
