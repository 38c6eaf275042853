//! Plugin-side view of the sandbox.
//!
//! A native plugin implements [`PluginScript`] and is handed a [`PluginApi`]
//! when activated. The API exposes four fixed groups (`fs`, `http`,
//! `storage`, `events`). Every method serializes its arguments into a
//! [`CallMessage`], registers a pending entry under a fresh request id and
//! waits for the correlated answer. The [`ContextPort`] inside the API is the
//! only path from plugin code to the host.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ContextPort;
use warden_core::{
    ApiError, ApiErrorCode, CallMessage, FileInfo, HostMessage, HostSignal, HttpMethod,
    HttpRequest, HttpResponse, PluginCall,
};
use warden_events::EventHandler;

/// Result of a capability call as seen by plugin code.
pub type GuestResult<T> = std::result::Result<T, ApiError>;

/// Native plugin code.
#[async_trait]
pub trait PluginScript: Send + Sync {
    /// Called once the context is mounted. Long-running work may stay in
    /// here; it is aborted when the sandbox deactivates.
    async fn activate(&self, api: PluginApi) -> anyhow::Result<()>;

    /// Called on deactivation. Capability calls are no longer serviced.
    async fn deactivate(&self, _api: PluginApi) -> anyhow::Result<()> {
        Ok(())
    }
}

type Completion = oneshot::Sender<GuestResult<Value>>;

struct GuestShared {
    plugin_id: String,
    port: ContextPort,
    request_timeout: Duration,
    pending: Mutex<HashMap<String, Completion>>,
    /// event name → (subscription id, handler)
    handlers: Mutex<HashMap<String, Vec<(String, EventHandler)>>>,
}

/// Handle through which plugin code reaches its capabilities.
#[derive(Clone)]
pub struct PluginApi {
    shared: Arc<GuestShared>,
}

impl PluginApi {
    pub(crate) fn new(plugin_id: &str, port: ContextPort, request_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(GuestShared {
                plugin_id: plugin_id.to_string(),
                port,
                request_timeout,
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.shared.plugin_id
    }

    pub fn fs(&self) -> GuestFs<'_> {
        GuestFs { api: self }
    }

    pub fn http(&self) -> GuestHttp<'_> {
        GuestHttp { api: self }
    }

    pub fn storage(&self) -> GuestStorage<'_> {
        GuestStorage { api: self }
    }

    pub fn events(&self) -> GuestEvents<'_> {
        GuestEvents { api: self }
    }

    /// Requests still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    async fn call(&self, call: PluginCall) -> GuestResult<Value> {
        self.call_with_id(Uuid::new_v4().to_string(), call).await
    }

    async fn call_with_id(&self, request_id: String, call: PluginCall) -> GuestResult<Value> {
        let method = call.method();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id.clone(), tx);

        let message = CallMessage::request(self.plugin_id(), request_id.as_str(), call);
        if let Err(e) = self.shared.port.send(message) {
            self.shared.pending.lock().remove(&request_id);
            return Err(ApiError::cancelled(e.to_string()));
        }

        match tokio::time::timeout(self.shared.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ApiError::cancelled(format!("{} was abandoned", method))),
            Err(_) => {
                self.shared.pending.lock().remove(&request_id);
                Err(ApiError::timeout(
                    method,
                    self.shared.request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Complete the pending entry for `request_id`. Unknown ids are dropped.
    fn resolve(&self, request_id: &str, result: GuestResult<Value>) {
        match self.shared.pending.lock().remove(request_id) {
            Some(tx) => {
                // The caller may have given up already.
                let _ = tx.send(result);
            }
            None => debug!(
                plugin_id = %self.shared.plugin_id,
                request_id,
                "dropping answer with no pending request"
            ),
        }
    }

    fn reject_all(&self, error: ApiError) -> usize {
        let drained: Vec<_> = self.shared.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    fn handlers_for(&self, event: &str) -> Vec<EventHandler> {
        self.shared
            .handlers
            .lock()
            .get(event)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> GuestResult<T> {
    serde_json::from_value(value).map_err(|e| {
        ApiError::new(
            ApiErrorCode::Parse,
            format!("unexpected {} response: {}", method, e),
        )
    })
}

// ── Capability groups ──────────────────────────────────────────

pub struct GuestFs<'a> {
    api: &'a PluginApi,
}

impl GuestFs<'_> {
    pub async fn read_file(&self, path: &str) -> GuestResult<String> {
        let value = self
            .api
            .call(PluginCall::FsReadFile { path: path.into() })
            .await?;
        decode("fs.readFile", value)
    }

    pub async fn write_file(&self, path: &str, contents: &str) -> GuestResult<()> {
        self.api
            .call(PluginCall::FsWriteFile {
                path: path.into(),
                contents: contents.into(),
            })
            .await
            .map(drop)
    }

    pub async fn list_files(&self, path: &str, pattern: Option<&str>) -> GuestResult<Vec<FileInfo>> {
        let value = self
            .api
            .call(PluginCall::FsListFiles {
                path: path.into(),
                pattern: pattern.map(str::to_string),
            })
            .await?;
        decode("fs.listFiles", value)
    }

    pub async fn delete_file(&self, path: &str) -> GuestResult<()> {
        self.api
            .call(PluginCall::FsDeleteFile { path: path.into() })
            .await
            .map(drop)
    }

    pub async fn create_directory(&self, path: &str) -> GuestResult<()> {
        self.api
            .call(PluginCall::FsCreateDirectory { path: path.into() })
            .await
            .map(drop)
    }

    pub async fn exists(&self, path: &str) -> GuestResult<bool> {
        let value = self
            .api
            .call(PluginCall::FsExists { path: path.into() })
            .await?;
        decode("fs.exists", value)
    }

    /// Changes arrive as the plugin's own `fs.changed` event.
    pub async fn watch_directory(&self, path: &str) -> GuestResult<()> {
        self.api
            .call(PluginCall::FsWatchDirectory { path: path.into() })
            .await
            .map(drop)
    }

    pub async fn unwatch_directory(&self) -> GuestResult<()> {
        self.api.call(PluginCall::FsUnwatchDirectory).await.map(drop)
    }
}

pub struct GuestHttp<'a> {
    api: &'a PluginApi,
}

impl GuestHttp<'_> {
    pub async fn request(&self, request: HttpRequest) -> GuestResult<HttpResponse> {
        let value = self.api.call(PluginCall::HttpRequest(request)).await?;
        decode("http.request", value)
    }

    pub async fn get(&self, url: &str) -> GuestResult<HttpResponse> {
        self.send(PluginCall::HttpGet {
            url: url.into(),
            headers: BTreeMap::new(),
        })
        .await
    }

    pub async fn post(&self, url: &str, body: Option<String>) -> GuestResult<HttpResponse> {
        self.send(PluginCall::HttpPost {
            url: url.into(),
            body,
            headers: BTreeMap::new(),
        })
        .await
    }

    pub async fn put(&self, url: &str, body: Option<String>) -> GuestResult<HttpResponse> {
        self.send(PluginCall::HttpPut {
            url: url.into(),
            body,
            headers: BTreeMap::new(),
        })
        .await
    }

    pub async fn delete(&self, url: &str) -> GuestResult<HttpResponse> {
        self.send(PluginCall::HttpDelete {
            url: url.into(),
            headers: BTreeMap::new(),
        })
        .await
    }

    pub async fn patch(&self, url: &str, body: Option<String>) -> GuestResult<HttpResponse> {
        self.send(PluginCall::HttpPatch {
            url: url.into(),
            body,
            headers: BTreeMap::new(),
        })
        .await
    }

    /// Like `request`, but for a JSON body.
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: HttpMethod,
        url: &str,
        body: &T,
    ) -> GuestResult<HttpResponse> {
        let encoded = serde_json::to_string(body)
            .map_err(|e| ApiError::new(ApiErrorCode::InvalidInput, e.to_string()))?;
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        self.request(
            HttpRequest::new(method, url)
                .with_headers(headers)
                .with_body(encoded),
        )
        .await
    }

    async fn send(&self, call: PluginCall) -> GuestResult<HttpResponse> {
        let method = call.method();
        let value = self.api.call(call).await?;
        decode(method, value)
    }
}

pub struct GuestStorage<'a> {
    api: &'a PluginApi,
}

impl GuestStorage<'_> {
    pub async fn set(&self, key: &str, value: &str) -> GuestResult<()> {
        self.api
            .call(PluginCall::StorageSet {
                key: key.into(),
                value: value.into(),
            })
            .await
            .map(drop)
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> GuestResult<()> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| ApiError::new(ApiErrorCode::InvalidInput, e.to_string()))?;
        self.set(key, &encoded).await
    }

    pub async fn get(&self, key: &str) -> GuestResult<Option<String>> {
        let value = self
            .api
            .call(PluginCall::StorageGet { key: key.into() })
            .await?;
        decode("storage.get", value)
    }

    /// A stored value that does not parse as `T` yields `None`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> GuestResult<Option<T>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(plugin_id = %self.api.plugin_id(), key, error = %e, "stored value is not valid JSON");
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, key: &str) -> GuestResult<bool> {
        let value = self
            .api
            .call(PluginCall::StorageDelete { key: key.into() })
            .await?;
        decode("storage.delete", value)
    }

    pub async fn clear(&self) -> GuestResult<()> {
        self.api.call(PluginCall::StorageClear).await.map(drop)
    }

    pub async fn keys(&self) -> GuestResult<Vec<String>> {
        let value = self.api.call(PluginCall::StorageKeys).await?;
        decode("storage.keys", value)
    }

    pub async fn has(&self, key: &str) -> GuestResult<bool> {
        let value = self
            .api
            .call(PluginCall::StorageHas { key: key.into() })
            .await?;
        decode("storage.has", value)
    }

    pub async fn size(&self) -> GuestResult<usize> {
        let value = self.api.call(PluginCall::StorageSize).await?;
        decode("storage.size", value)
    }
}

pub struct GuestEvents<'a> {
    api: &'a PluginApi,
}

impl GuestEvents<'_> {
    /// Register `handler` for `event` and return the subscription id.
    ///
    /// The handler is installed before the host confirms, so an event
    /// emitted while the registration is in flight is not lost.
    pub async fn on(&self, event: &str, handler: EventHandler) -> GuestResult<String> {
        let id = Uuid::new_v4().to_string();
        self.api
            .shared
            .handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id.clone(), handler));

        let result = self
            .api
            .call_with_id(id.clone(), PluginCall::EventOn {
                event: event.into(),
            })
            .await;
        if let Err(e) = result {
            self.forget(event, Some(&id));
            return Err(e);
        }
        Ok(id)
    }

    /// Drop one registration. Returns whether the host knew it.
    pub async fn off(&self, event: &str, subscription_id: &str) -> GuestResult<bool> {
        self.forget(event, Some(subscription_id));
        self.unregister(event, Some(subscription_id.to_string()))
            .await
    }

    /// Drop every registration this plugin holds for `event`.
    pub async fn off_all(&self, event: &str) -> GuestResult<bool> {
        self.forget(event, None);
        self.unregister(event, None).await
    }

    /// Publish `data`. Short names are namespaced by this plugin's id.
    /// Returns how many subscribers received it.
    pub async fn emit(&self, event: &str, data: Value) -> GuestResult<usize> {
        let value = self
            .api
            .call(PluginCall::EventEmit {
                event: event.into(),
                data,
            })
            .await?;
        Ok(value.get("delivered").and_then(Value::as_u64).unwrap_or(0) as usize)
    }

    async fn unregister(&self, event: &str, subscription_id: Option<String>) -> GuestResult<bool> {
        let value = self
            .api
            .call(PluginCall::EventOff {
                event: event.into(),
                subscription_id,
            })
            .await?;
        Ok(value.get("removed").and_then(Value::as_bool).unwrap_or(false))
    }

    fn forget(&self, event: &str, subscription_id: Option<&str>) {
        let mut handlers = self.api.shared.handlers.lock();
        if let Some(list) = handlers.get_mut(event) {
            match subscription_id {
                Some(id) => list.retain(|(sid, _)| sid != id),
                None => list.clear(),
            }
            if list.is_empty() {
                handlers.remove(event);
            }
        }
    }
}

// ── Runtime loop ───────────────────────────────────────────────

/// Drive a native plugin until deactivation or until the sandbox hangs up.
pub(crate) async fn run_native(
    script: Arc<dyn PluginScript>,
    api: PluginApi,
    mut inbound: mpsc::UnboundedReceiver<HostMessage>,
) {
    let plugin_id = api.plugin_id().to_string();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    loop {
        tokio::select! {
            Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                match done {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(plugin_id = %plugin_id, error = %e, "plugin task failed"),
                    Err(e) if e.is_panic() => warn!(plugin_id = %plugin_id, "plugin task panicked"),
                    Err(_) => {}
                }
            }
            message = inbound.recv() => {
                let Some(message) = message else {
                    debug!(plugin_id = %plugin_id, "sandbox closed the context channel");
                    break;
                };
                if message.plugin_id != plugin_id {
                    warn!(plugin_id = %plugin_id, target = %message.plugin_id, "ignoring message for another plugin");
                    continue;
                }
                match message.body {
                    HostSignal::Response(value) => api.resolve(&message.request_id, Ok(value)),
                    HostSignal::Error(error) => api.resolve(&message.request_id, Err(error)),
                    HostSignal::EventTriggered { event, data } => {
                        for handler in api.handlers_for(&event) {
                            let data = data.clone();
                            tasks.spawn(async move { handler(data).await });
                        }
                    }
                    HostSignal::Activate => {
                        let (script, api) = (Arc::clone(&script), api.clone());
                        tasks.spawn(async move { script.activate(api).await });
                        info!(plugin_id = %plugin_id, "plugin script started");
                    }
                    HostSignal::Deactivate => {
                        if let Err(e) = script.deactivate(api.clone()).await {
                            warn!(plugin_id = %plugin_id, error = %e, "plugin deactivate hook failed");
                        }
                        break;
                    }
                }
            }
        }
    }

    let rejected = api.reject_all(ApiError::cancelled("plugin deactivated"));
    if rejected > 0 {
        debug!(plugin_id = %plugin_id, rejected, "rejected pending requests");
    }
    tasks.shutdown().await;
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextId, Envelope, Inbound};
    use serde_json::json;

    struct Idle;

    #[async_trait]
    impl PluginScript for Idle {
        async fn activate(&self, _api: PluginApi) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        api: PluginApi,
        outbound: mpsc::UnboundedReceiver<Envelope>,
        inbound: mpsc::UnboundedSender<HostMessage>,
    }

    fn harness() -> Harness {
        let (out_tx, outbound) = mpsc::unbounded_channel();
        let (inbound, in_rx) = mpsc::unbounded_channel();
        let port = ContextPort::new(ContextId::fresh(), out_tx);
        let api = PluginApi::new("p", port, Duration::from_secs(5));
        tokio::spawn(run_native(Arc::new(Idle), api.clone(), in_rx));
        Harness {
            api,
            outbound,
            inbound,
        }
    }

    impl Harness {
        fn read(&self, path: &'static str) -> tokio::task::JoinHandle<GuestResult<String>> {
            let api = self.api.clone();
            tokio::spawn(async move { api.fs().read_file(path).await })
        }

        async fn sent_request_id(&mut self) -> String {
            let envelope = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .unwrap()
                .unwrap();
            match envelope.inbound {
                Inbound::Call(message) => message.request_id,
                other => panic!("expected a call, got {:?}", other),
            }
        }

        fn answer(&self, plugin_id: &str, request_id: &str, payload: Value) {
            self.inbound
                .send(HostMessage::response(plugin_id, request_id, payload))
                .unwrap();
        }

        /// Let the runtime loop drain everything sent so far.
        async fn settle(&self) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn answers_complete_out_of_order() {
        let mut h = harness();
        let first = h.read("/a");
        let first_id = h.sent_request_id().await;
        let second = h.read("/b");
        let second_id = h.sent_request_id().await;
        assert_ne!(first_id, second_id);
        assert_eq!(h.api.pending_count(), 2);

        h.answer("p", &second_id, json!("B"));
        assert_eq!(second.await.unwrap().unwrap(), "B");
        assert_eq!(h.api.pending_count(), 1);

        h.answer("p", &first_id, json!("A"));
        assert_eq!(first.await.unwrap().unwrap(), "A");
        assert_eq!(h.api.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_and_misaddressed_answers_are_dropped() {
        let mut h = harness();
        let waiting = h.read("/a");
        let id = h.sent_request_id().await;

        h.answer("p", "no-such-request", json!("stray"));
        h.answer("someone-else", &id, json!("forged"));
        h.settle().await;
        assert_eq!(h.api.pending_count(), 1);
        assert!(!waiting.is_finished());

        h.answer("p", &id, json!("real"));
        assert_eq!(waiting.await.unwrap().unwrap(), "real");
        assert_eq!(h.api.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_answer_for_a_request_is_ignored() {
        let mut h = harness();
        let waiting = h.read("/a");
        let id = h.sent_request_id().await;

        h.answer("p", &id, json!("first"));
        h.inbound
            .send(HostMessage::error("p", &id, ApiError::cancelled("late")))
            .unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), "first");
        h.settle().await;
        assert_eq!(h.api.pending_count(), 0);

        // The loop keeps serving afterwards.
        let next = h.read("/b");
        let next_id = h.sent_request_id().await;
        h.answer("p", &next_id, json!("again"));
        assert_eq!(next.await.unwrap().unwrap(), "again");
    }

    #[tokio::test]
    async fn deactivation_rejects_pending_requests() {
        let mut h = harness();
        let waiting = h.read("/a");
        h.sent_request_id().await;

        h.inbound
            .send(HostMessage::signal("p", HostSignal::Deactivate))
            .unwrap();
        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.code, ApiErrorCode::Cancelled);
        assert_eq!(h.api.pending_count(), 0);
    }
}
