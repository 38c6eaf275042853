//! The privileged backend command surface.
//!
//! One method per capability command, each taking the calling plugin's
//! identifier first. Implementations are responsible for permission checks,
//! path confinement, and rate limiting.

use async_trait::async_trait;
use std::sync::Arc;

use warden_core::{FileInfo, HttpRequest, HttpResponse, Result};

#[async_trait]
pub trait FileSystemBackend: Send + Sync {
    async fn read_file(&self, plugin_id: &str, path: &str) -> Result<String>;
    async fn write_file(&self, plugin_id: &str, path: &str, contents: &str) -> Result<()>;
    async fn list_files(
        &self,
        plugin_id: &str,
        path: &str,
        pattern: Option<&str>,
    ) -> Result<Vec<FileInfo>>;
    async fn delete_file(&self, plugin_id: &str, path: &str) -> Result<()>;
    async fn create_directory(&self, plugin_id: &str, path: &str) -> Result<()>;
    async fn exists(&self, plugin_id: &str, path: &str) -> Result<bool>;
    async fn watch_directory(&self, plugin_id: &str, path: &str) -> Result<()>;
    async fn unwatch_directory(&self, plugin_id: &str) -> Result<()>;
}

#[async_trait]
pub trait NetworkBackend: Send + Sync {
    async fn request(&self, plugin_id: &str, request: HttpRequest) -> Result<HttpResponse>;

    /// Drop per-plugin state (rate-limit buckets) when a plugin deactivates.
    fn release_plugin(&self, _plugin_id: &str) {}
}

/// Per-plugin key/value storage. Values are opaque strings; JSON encoding
/// is the caller's concern.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn set(&self, plugin_id: &str, key: &str, value: &str) -> Result<()>;
    async fn get(&self, plugin_id: &str, key: &str) -> Result<Option<String>>;
    /// Returns whether the key existed.
    async fn delete(&self, plugin_id: &str, key: &str) -> Result<bool>;
    async fn clear(&self, plugin_id: &str) -> Result<()>;
    async fn keys(&self, plugin_id: &str) -> Result<Vec<String>>;
    async fn has(&self, plugin_id: &str, key: &str) -> Result<bool>;
    async fn size(&self, plugin_id: &str) -> Result<usize>;
}

/// The three backends a sandbox dispatches into.
#[derive(Clone)]
pub struct Backends {
    pub filesystem: Arc<dyn FileSystemBackend>,
    pub network: Arc<dyn NetworkBackend>,
    pub storage: Arc<dyn StorageBackend>,
}

impl Backends {
    pub fn new(
        filesystem: Arc<dyn FileSystemBackend>,
        network: Arc<dyn NetworkBackend>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            filesystem,
            network,
            storage,
        }
    }

    /// Route every capability to one backend implementing all three traits.
    pub fn uniform<B>(backend: Arc<B>) -> Self
    where
        B: FileSystemBackend + NetworkBackend + StorageBackend + 'static,
    {
        Self {
            filesystem: backend.clone(),
            network: backend.clone(),
            storage: backend,
        }
    }
}
