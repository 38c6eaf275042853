//! Recording backend for deterministic testing.
//!
//! Serves files and HTTP responses from pre-configured tables, keeps storage
//! in memory, and records every command it receives.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::backend::{FileSystemBackend, NetworkBackend, StorageBackend};
use crate::kv::MemoryStorage;
use warden_core::{FileInfo, HttpRequest, HttpResponse, Result, WardenError};

/// A backend implementing all three capability traits.
///
/// # Example
/// ```
/// use warden_capability::mock::MockBackend;
/// let backend = MockBackend::new().with_file("/notes/x.txt", "hello");
/// ```
#[derive(Default)]
pub struct MockBackend {
    files: Mutex<HashMap<String, String>>,
    http: Mutex<HashMap<String, HttpResponse>>,
    storage: MemoryStorage,
    /// Track every command received, as `"<plugin_id> <method> <arg>"`.
    calls: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    delay: Option<Duration>,
    failure: Option<String>,
    panic_on: Option<String>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, contents: &str) -> Self {
        self.files
            .lock()
            .insert(path.to_string(), contents.to_string());
        self
    }

    pub fn with_http_response(self, url: &str, response: HttpResponse) -> Self {
        self.http.lock().insert(url.to_string(), response);
        self
    }

    /// Delay every command (for timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every filesystem and network command with a backend error.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Panic when the given method (e.g. `"fs.exists"`) is invoked.
    pub fn panicking_on(mut self, method: &str) -> Self {
        self.panic_on = Some(method.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Plugins whose network state was released, in order.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    async fn record(&self, plugin_id: &str, method: &str, arg: &str) -> Result<()> {
        self.calls
            .lock()
            .push(format!("{} {} {}", plugin_id, method, arg).trim_end().to_string());
        if self.panic_on.as_deref() == Some(method) {
            panic!("mock backend panic in {}", method);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(message) => Err(WardenError::Storage(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FileSystemBackend for MockBackend {
    async fn read_file(&self, plugin_id: &str, path: &str) -> Result<String> {
        self.record(plugin_id, "fs.readFile", path).await?;
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| WardenError::NotFound(path.to_string()))
    }

    async fn write_file(&self, plugin_id: &str, path: &str, contents: &str) -> Result<()> {
        self.record(plugin_id, "fs.writeFile", path).await?;
        self.files
            .lock()
            .insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn list_files(
        &self,
        plugin_id: &str,
        path: &str,
        _pattern: Option<&str>,
    ) -> Result<Vec<FileInfo>> {
        self.record(plugin_id, "fs.listFiles", path).await?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut files: Vec<FileInfo> = self
            .files
            .lock()
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix))
            .map(|(p, contents)| FileInfo {
                name: p.rsplit('/').next().unwrap_or_default().to_string(),
                path: p.clone(),
                is_directory: false,
                size: contents.len() as u64,
                modified: None,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn delete_file(&self, plugin_id: &str, path: &str) -> Result<()> {
        self.record(plugin_id, "fs.deleteFile", path).await?;
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| WardenError::NotFound(path.to_string()))
    }

    async fn create_directory(&self, plugin_id: &str, path: &str) -> Result<()> {
        self.record(plugin_id, "fs.createDirectory", path).await
    }

    async fn exists(&self, plugin_id: &str, path: &str) -> Result<bool> {
        self.record(plugin_id, "fs.exists", path).await?;
        Ok(self.files.lock().contains_key(path))
    }

    async fn watch_directory(&self, plugin_id: &str, path: &str) -> Result<()> {
        self.record(plugin_id, "fs.watchDirectory", path).await
    }

    async fn unwatch_directory(&self, plugin_id: &str) -> Result<()> {
        self.record(plugin_id, "fs.unwatchDirectory", "").await
    }
}

#[async_trait]
impl NetworkBackend for MockBackend {
    async fn request(&self, plugin_id: &str, request: HttpRequest) -> Result<HttpResponse> {
        self.record(
            plugin_id,
            "http.request",
            &format!("{} {}", request.method, request.url),
        )
        .await?;
        self.http
            .lock()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| WardenError::Network(format!("no route to {}", request.url)))
    }

    fn release_plugin(&self, plugin_id: &str) {
        self.released.lock().push(plugin_id.to_string());
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    async fn set(&self, plugin_id: &str, key: &str, value: &str) -> Result<()> {
        self.record(plugin_id, "storage.set", key).await?;
        self.storage.set(plugin_id, key, value).await
    }

    async fn get(&self, plugin_id: &str, key: &str) -> Result<Option<String>> {
        self.record(plugin_id, "storage.get", key).await?;
        self.storage.get(plugin_id, key).await
    }

    async fn delete(&self, plugin_id: &str, key: &str) -> Result<bool> {
        self.record(plugin_id, "storage.delete", key).await?;
        self.storage.delete(plugin_id, key).await
    }

    async fn clear(&self, plugin_id: &str) -> Result<()> {
        self.record(plugin_id, "storage.clear", "").await?;
        self.storage.clear(plugin_id).await
    }

    async fn keys(&self, plugin_id: &str) -> Result<Vec<String>> {
        self.record(plugin_id, "storage.keys", "").await?;
        self.storage.keys(plugin_id).await
    }

    async fn has(&self, plugin_id: &str, key: &str) -> Result<bool> {
        self.record(plugin_id, "storage.has", key).await?;
        self.storage.has(plugin_id, key).await
    }

    async fn size(&self, plugin_id: &str) -> Result<usize> {
        self.record(plugin_id, "storage.size", "").await?;
        self.storage.size(plugin_id).await
    }
}
