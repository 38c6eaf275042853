use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::StorageBackend;
use warden_core::Result;

/// Key/value storage bound to one plugin. No method accepts another
/// plugin's identifier, so a plugin only ever sees its own key space.
#[derive(Clone)]
pub struct StorageApi {
    plugin_id: String,
    backend: Arc<dyn StorageBackend>,
}

impl StorageApi {
    pub fn new(plugin_id: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            backend,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        debug!(plugin_id = %self.plugin_id, key, "storage.set");
        self.backend.set(&self.plugin_id, key, value).await
    }

    /// Store `value` JSON-encoded.
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.set(key, &encoded).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(&self.plugin_id, key).await
    }

    /// Fetch and decode a JSON value. A stored value that does not parse as
    /// `T` yields `None` and a warning rather than an error.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(plugin_id = %self.plugin_id, key, error = %e, "stored value is not valid JSON");
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        debug!(plugin_id = %self.plugin_id, key, "storage.delete");
        self.backend.delete(&self.plugin_id, key).await
    }

    pub async fn clear(&self) -> Result<()> {
        debug!(plugin_id = %self.plugin_id, "storage.clear");
        self.backend.clear(&self.plugin_id).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.backend.keys(&self.plugin_id).await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.backend.has(&self.plugin_id, key).await
    }

    pub async fn size(&self) -> Result<usize> {
        self.backend.size(&self.plugin_id).await
    }
}
