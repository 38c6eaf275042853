//! The single channel between an isolated context and its sandbox.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

use warden_core::{CallMessage, Result, WardenError};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one mounted execution context.
///
/// Stamped onto every envelope by the context's [`ContextPort`]. A sandbox
/// only services envelopes carrying the id of the context it mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a fresh id that no other context has used.
    pub fn fresh() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// What a context put on the wire.
#[derive(Debug, Clone)]
pub enum Inbound {
    Call(CallMessage),
    /// Raw bytes that did not decode as a call. Whatever identifiers could
    /// be recovered are kept so the sandbox can answer with a protocol error.
    Malformed {
        request_id: Option<String>,
        plugin_id: Option<String>,
        reason: String,
    },
}

/// An inbound message together with the context it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: ContextId,
    pub inbound: Inbound,
}

impl Envelope {
    pub fn call(origin: ContextId, message: CallMessage) -> Self {
        Self {
            origin,
            inbound: Inbound::Call(message),
        }
    }

    /// Decode a raw JSON message produced by a guest.
    pub fn decode(origin: ContextId, raw: &[u8]) -> Self {
        let inbound = match serde_json::from_slice::<CallMessage>(raw) {
            Ok(message) => Inbound::Call(message),
            Err(e) => {
                let loose: Option<Value> = serde_json::from_slice(raw).ok();
                let field = |name: &str| {
                    loose
                        .as_ref()
                        .and_then(|v| v.get(name))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };
                Inbound::Malformed {
                    request_id: field("requestId"),
                    plugin_id: field("pluginId"),
                    reason: format!("undecodable message: {}", e),
                }
            }
        };
        Self { origin, inbound }
    }
}

/// The sending half handed to a context. It is the context's only way out.
#[derive(Clone)]
pub struct ContextPort {
    origin: ContextId,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl ContextPort {
    pub(crate) fn new(origin: ContextId, outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { origin, outbound }
    }

    pub fn origin(&self) -> ContextId {
        self.origin
    }

    pub fn send(&self, message: CallMessage) -> Result<()> {
        trace!(origin = %self.origin, request_id = %message.request_id, method = message.body.method(), "context → sandbox");
        self.post(Envelope::call(self.origin, message))
    }

    /// Forward raw guest bytes; decoding failures become `Malformed`.
    pub fn send_raw(&self, raw: &[u8]) -> Result<()> {
        self.post(Envelope::decode(self.origin, raw))
    }

    fn post(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .map_err(|_| WardenError::Cancelled("sandbox is no longer listening".into()))
    }
}
