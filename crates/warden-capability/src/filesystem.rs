use std::sync::Arc;
use tracing::debug;

use crate::backend::FileSystemBackend;
use warden_core::{FileInfo, Result};

/// Filesystem capability bound to one plugin.
///
/// Paths are interpreted by the backend relative to the plugin's storage
/// root; this proxy performs no validation of its own.
#[derive(Clone)]
pub struct FileSystemApi {
    plugin_id: String,
    backend: Arc<dyn FileSystemBackend>,
}

impl FileSystemApi {
    pub fn new(plugin_id: impl Into<String>, backend: Arc<dyn FileSystemBackend>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            backend,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        debug!(plugin_id = %self.plugin_id, path, "fs.readFile");
        self.backend.read_file(&self.plugin_id, path).await
    }

    pub async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        debug!(plugin_id = %self.plugin_id, path, bytes = contents.len(), "fs.writeFile");
        self.backend.write_file(&self.plugin_id, path, contents).await
    }

    pub async fn list_files(&self, path: &str, pattern: Option<&str>) -> Result<Vec<FileInfo>> {
        debug!(plugin_id = %self.plugin_id, path, ?pattern, "fs.listFiles");
        self.backend.list_files(&self.plugin_id, path, pattern).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        debug!(plugin_id = %self.plugin_id, path, "fs.deleteFile");
        self.backend.delete_file(&self.plugin_id, path).await
    }

    pub async fn create_directory(&self, path: &str) -> Result<()> {
        debug!(plugin_id = %self.plugin_id, path, "fs.createDirectory");
        self.backend.create_directory(&self.plugin_id, path).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.backend.exists(&self.plugin_id, path).await
    }

    pub async fn watch_directory(&self, path: &str) -> Result<()> {
        debug!(plugin_id = %self.plugin_id, path, "fs.watchDirectory");
        self.backend.watch_directory(&self.plugin_id, path).await
    }

    pub async fn unwatch_directory(&self) -> Result<()> {
        debug!(plugin_id = %self.plugin_id, "fs.unwatchDirectory");
        self.backend.unwatch_directory(&self.plugin_id).await
    }
}
