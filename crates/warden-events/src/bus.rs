use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use warden_core::NAMESPACE_SEPARATOR;

/// A subscriber callback. Failures are logged by the bus, never propagated
/// to the emitter.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |data| f(data).boxed())
}

/// Apply the three-tier naming rule: explicit namespace wins, then the
/// plugin namespace, then global.
pub fn resolve_event_name(event: &str, plugin_id: Option<&str>) -> String {
    if event.contains(NAMESPACE_SEPARATOR) {
        return event.to_string();
    }
    match plugin_id {
        Some(plugin) => format!("{}{}{}", plugin, NAMESPACE_SEPARATOR, event),
        None => event.to_string(),
    }
}

/// How successive `emit()` calls on the same event interact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Each emit delivers immediately; a slow handler can be re-entered by a
    /// later emit of the same event. Handlers must tolerate that.
    #[default]
    Concurrent,
    /// Emits of one event are queued behind each other. A handler must not
    /// await an emit of the event it is handling.
    Serialized,
}

impl std::str::FromStr for DeliveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concurrent" => Ok(DeliveryPolicy::Concurrent),
            "serialized" => Ok(DeliveryPolicy::Serialized),
            other => Err(format!(
                "unknown delivery policy '{}' (expected 'concurrent' or 'serialized')",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Emits slower than this log a warning.
    pub latency_warn: Duration,
    pub delivery: DeliveryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            latency_warn: Duration::from_millis(20),
            delivery: DeliveryPolicy::Concurrent,
        }
    }
}

/// Cumulative delivery statistics for one resolved event name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStats {
    pub emit_count: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
    /// Individual handler invocations that failed or panicked.
    pub handler_failures: u64,
    /// Emits that crossed the latency threshold.
    pub slow_emits: u64,
}

impl EventStats {
    pub fn average_latency(&self) -> Duration {
        if self.emit_count == 0 {
            return Duration::ZERO;
        }
        self.total_latency / self.emit_count as u32
    }
}

/// Outcome of a single `emit()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub event: String,
    pub delivered: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

struct Entry {
    id: u64,
    handler: EventHandler,
    owner: Option<String>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    events: HashMap<String, Vec<Entry>>,
    stats: HashMap<String, EventStats>,
    delivery_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Registry {
    fn insert(&mut self, name: &str, handler: EventHandler, owner: Option<String>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.events
            .entry(name.to_string())
            .or_default()
            .push(Entry { id, handler, owner });
        id
    }

    fn remove_where(&mut self, name: &str, pred: impl Fn(&Entry) -> bool) -> bool {
        let Some(entries) = self.events.get_mut(name) else {
            return false;
        };
        let Some(pos) = entries.iter().position(pred) else {
            return false;
        };
        entries.remove(pos);
        if entries.is_empty() {
            self.events.remove(name);
            self.delivery_locks.remove(name);
        }
        true
    }
}

/// Handle returned by `on()`. Disposing it removes exactly that subscription.
pub struct Subscription {
    id: u64,
    event: String,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// The resolved (namespaced) event name.
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the subscription. Returns `false` if it was already gone
    /// (e.g. removed by `clear_plugin`) or the bus no longer exists.
    pub fn dispose(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = registry.lock().remove_where(&self.event, |e| e.id == self.id);
        if removed {
            trace!(event = %self.event, id = self.id, "subscription disposed");
        }
        removed
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.event)
            .finish()
    }
}

/// Namespaced publish/subscribe registry.
///
/// Cloning yields another handle to the same registry. Registry mutations
/// are short critical sections; handlers always run outside the lock.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    config: BusConfig,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Subscribe `handler` to `event`, namespaced by `plugin_id` when the
    /// name has no explicit namespace. The subscription is tagged with
    /// `plugin_id` for `clear_plugin`.
    pub fn on(&self, event: &str, handler: EventHandler, plugin_id: Option<&str>) -> Subscription {
        let name = resolve_event_name(event, plugin_id);
        let id = self
            .registry
            .lock()
            .insert(&name, handler, plugin_id.map(str::to_string));
        debug!(event = %name, id, plugin_id = ?plugin_id, "subscribed");
        Subscription {
            id,
            event: name,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Subscribe to `event` verbatim (no implicit namespace) while still
    /// tagging the subscription with `owner` for `clear_plugin`.
    pub fn on_global(&self, event: &str, handler: EventHandler, owner: &str) -> Subscription {
        let id = self
            .registry
            .lock()
            .insert(event, handler, Some(owner.to_string()));
        debug!(event, id, owner, "subscribed (global)");
        Subscription {
            id,
            event: event.to_string(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove the subscription registered with exactly this handler and
    /// plugin id. Returns whether anything was removed.
    pub fn off(&self, event: &str, handler: &EventHandler, plugin_id: Option<&str>) -> bool {
        let name = resolve_event_name(event, plugin_id);
        let target = Arc::as_ptr(handler) as *const ();
        let removed = self.registry.lock().remove_where(&name, |e| {
            Arc::as_ptr(&e.handler) as *const () == target && e.owner.as_deref() == plugin_id
        });
        if removed {
            debug!(event = %name, "unsubscribed");
        }
        removed
    }

    /// Remove every subscription tagged with `plugin_id`.
    pub fn clear_plugin(&self, plugin_id: &str) -> usize {
        let mut registry = self.registry.lock();
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (name, entries) in registry.events.iter_mut() {
            let before = entries.len();
            entries.retain(|e| e.owner.as_deref() != Some(plugin_id));
            removed += before - entries.len();
            if entries.is_empty() {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            registry.events.remove(&name);
            registry.delivery_locks.remove(&name);
        }
        if removed > 0 {
            debug!(plugin_id, removed, "cleared plugin subscriptions");
        }
        removed
    }

    /// Emit `event` resolved without a plugin namespace.
    pub async fn emit(&self, event: &str, data: Value) -> EmitReport {
        let name = resolve_event_name(event, None);
        self.deliver(name, data).await
    }

    /// Emit on behalf of `plugin_id`: short names land in that plugin's
    /// namespace, explicitly namespaced names are used verbatim.
    pub async fn emit_from(&self, plugin_id: &str, event: &str, data: Value) -> EmitReport {
        let name = resolve_event_name(event, Some(plugin_id));
        self.deliver(name, data).await
    }

    async fn deliver(&self, name: String, data: Value) -> EmitReport {
        let (handlers, lock) = {
            let mut registry = self.registry.lock();
            let handlers: Vec<EventHandler> = match registry.events.get(&name) {
                Some(entries) => entries.iter().map(|e| Arc::clone(&e.handler)).collect(),
                None => Vec::new(),
            };
            let lock = match (self.config.delivery, handlers.is_empty()) {
                (DeliveryPolicy::Serialized, false) => Some(Arc::clone(
                    registry.delivery_locks.entry(name.clone()).or_default(),
                )),
                _ => None,
            };
            (handlers, lock)
        };

        if handlers.is_empty() {
            trace!(event = %name, "emit with no subscribers");
            return EmitReport {
                event: name,
                ..Default::default()
            };
        }

        let _guard = match lock {
            Some(lock) => Some(lock.lock_owned().await),
            None => None,
        };

        let start = Instant::now();
        let outcomes = join_all(
            handlers
                .into_iter()
                .map(|h| invoke(h, data.clone())),
        )
        .await;
        let elapsed = start.elapsed();

        let delivered = outcomes.len();
        let mut failed = 0;
        for outcome in outcomes {
            if let Err(reason) = outcome {
                failed += 1;
                warn!(event = %name, error = %reason, "event handler failed");
            }
        }

        let slow = elapsed > self.config.latency_warn;
        if slow {
            warn!(
                event = %name,
                latency_ms = elapsed.as_millis() as u64,
                threshold_ms = self.config.latency_warn.as_millis() as u64,
                "slow event delivery"
            );
        }

        {
            let mut registry = self.registry.lock();
            let stats = registry.stats.entry(name.clone()).or_default();
            stats.emit_count += 1;
            stats.total_latency += elapsed;
            stats.max_latency = stats.max_latency.max(elapsed);
            stats.handler_failures += failed as u64;
            if slow {
                stats.slow_emits += 1;
            }
        }

        EmitReport {
            event: name,
            delivered,
            failed,
            elapsed,
        }
    }

    /// Number of live subscriptions on a resolved event name.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.registry
            .lock()
            .events
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Resolved names with at least one subscriber, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.lock().events.keys().cloned().collect();
        names.sort();
        names
    }

    /// Statistics for a resolved event name, if it was ever delivered.
    pub fn stats(&self, event: &str) -> Option<EventStats> {
        self.registry.lock().stats.get(event).cloned()
    }

    pub fn all_stats(&self) -> HashMap<String, EventStats> {
        self.registry.lock().stats.clone()
    }
}

/// Run one handler, turning errors and panics into a reason string.
async fn invoke(handler: EventHandler, data: Value) -> Result<(), String> {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(data))) {
        Ok(fut) => fut,
        Err(_) => return Err("handler panicked".into()),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err("handler panicked".into()),
    }
}
