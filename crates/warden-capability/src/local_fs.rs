use async_trait::async_trait;
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backend::FileSystemBackend;
use warden_core::{FileInfo, PermissionCategory, PermissionRegistry, Result, WardenError};
use warden_events::EventBus;

/// Event (in the plugin's own namespace) published for watched changes.
pub const FS_CHANGED_EVENT: &str = "fs.changed";

/// Disk-backed filesystem capability.
///
/// Each plugin is confined to `<root>/<plugin_id>`. Plugin paths are
/// always relative to that directory, whether or not they start with `/`;
/// `..` components are rejected outright.
pub struct LocalFileSystem {
    root: PathBuf,
    permissions: PermissionRegistry,
    bus: Option<EventBus>,
    watchers: Mutex<HashMap<String, RecommendedWatcher>>,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>, permissions: PermissionRegistry) -> Self {
        Self {
            root: root.into(),
            permissions,
            bus: None,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Enable `watch_directory`, publishing changes onto `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory a plugin is confined to.
    pub fn plugin_root(&self, plugin_id: &str) -> Result<PathBuf> {
        let valid = !plugin_id.is_empty()
            && plugin_id != "."
            && plugin_id != ".."
            && !plugin_id.contains(['/', '\\']);
        if !valid {
            return Err(WardenError::InvalidInput(format!(
                "plugin id '{}' cannot name a storage root",
                plugin_id
            )));
        }
        Ok(self.root.join(plugin_id))
    }

    /// Map a plugin path to `(absolute path, normalized plugin path)`.
    fn resolve(&self, plugin_id: &str, path: &str) -> Result<(PathBuf, String)> {
        let mut parts = Vec::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(WardenError::InvalidPath(format!(
                        "'{}' escapes the plugin directory",
                        path
                    )));
                }
                Component::Prefix(_) => {
                    return Err(WardenError::InvalidPath(format!(
                        "'{}' must be relative to the plugin directory",
                        path
                    )));
                }
            }
        }
        let mut full = self.plugin_root(plugin_id)?;
        full.extend(&parts);
        Ok((full, format!("/{}", parts.join("/"))))
    }

    fn check(&self, plugin_id: &str, action: &str, rel: &str) -> Result<()> {
        self.permissions
            .check(plugin_id, PermissionCategory::Filesystem, action, Some(rel))
    }

    /// Resolve and permission-check in one step.
    fn authorize(&self, plugin_id: &str, action: &str, path: &str) -> Result<(PathBuf, String)> {
        let (full, rel) = self.resolve(plugin_id, path)?;
        self.check(plugin_id, action, &rel)?;
        Ok((full, rel))
    }
}

/// Compile a `*` / `?` glob into an anchored regex over file names.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
        .map_err(|e| WardenError::InvalidInput(format!("bad pattern '{}': {}", pattern, e)))
}

fn change_kind(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Create(_) => Some("create"),
        EventKind::Modify(_) => Some("modify"),
        EventKind::Remove(_) => Some("remove"),
        _ => None,
    }
}

#[async_trait]
impl FileSystemBackend for LocalFileSystem {
    async fn read_file(&self, plugin_id: &str, path: &str) -> Result<String> {
        let (full, rel) = self.authorize(plugin_id, "read", path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| WardenError::from_io(&rel, e))
    }

    async fn write_file(&self, plugin_id: &str, path: &str, contents: &str) -> Result<()> {
        let (full, rel) = self.authorize(plugin_id, "write", path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WardenError::from_io(&rel, e))?;
        }
        tokio::fs::write(&full, contents)
            .await
            .map_err(|e| WardenError::from_io(&rel, e))
    }

    async fn list_files(
        &self,
        plugin_id: &str,
        path: &str,
        pattern: Option<&str>,
    ) -> Result<Vec<FileInfo>> {
        let (full, rel) = self.authorize(plugin_id, "read", path)?;
        let matcher = pattern.map(glob_to_regex).transpose()?;

        let mut entries = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| WardenError::from_io(&rel, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WardenError::from_io(&rel, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if matcher.as_ref().is_some_and(|re| !re.is_match(&name)) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(plugin_id, entry = %name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let child = if rel == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", rel, name)
            };
            files.push(FileInfo {
                name,
                path: child,
                is_directory: meta.is_dir(),
                size: meta.len(),
                modified: meta.modified().ok().map(chrono::DateTime::<chrono::Utc>::from),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn delete_file(&self, plugin_id: &str, path: &str) -> Result<()> {
        let (full, rel) = self.authorize(plugin_id, "delete", path)?;
        if rel == "/" {
            return Err(WardenError::InvalidPath(
                "refusing to delete the plugin root".into(),
            ));
        }
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| WardenError::from_io(&rel, e))?;
        let res = if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        res.map_err(|e| WardenError::from_io(&rel, e))
    }

    async fn create_directory(&self, plugin_id: &str, path: &str) -> Result<()> {
        let (full, rel) = self.authorize(plugin_id, "write", path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| WardenError::from_io(&rel, e))
    }

    async fn exists(&self, plugin_id: &str, path: &str) -> Result<bool> {
        let (full, rel) = self.authorize(plugin_id, "read", path)?;
        tokio::fs::try_exists(&full)
            .await
            .map_err(|e| WardenError::from_io(&rel, e))
    }

    async fn watch_directory(&self, plugin_id: &str, path: &str) -> Result<()> {
        let (full, rel) = self.authorize(plugin_id, "watch", path)?;
        let Some(bus) = self.bus.clone() else {
            return Err(WardenError::InvalidInput(
                "directory watching is disabled on this host".into(),
            ));
        };
        if !tokio::fs::try_exists(&full)
            .await
            .map_err(|e| WardenError::from_io(&rel, e))?
        {
            return Err(WardenError::NotFound(rel));
        }

        let handle = tokio::runtime::Handle::current();
        let plugin = plugin_id.to_string();
        let plugin_root = self.plugin_root(plugin_id)?;
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    let Some(kind) = change_kind(&event.kind) else {
                        return;
                    };
                    let paths: Vec<String> = event
                        .paths
                        .iter()
                        .map(|p| match p.strip_prefix(&plugin_root) {
                            Ok(rel) => format!("/{}", rel.to_string_lossy()),
                            Err(_) => p
                                .file_name()
                                .map(|n| format!("/{}", n.to_string_lossy()))
                                .unwrap_or_default(),
                        })
                        .collect();
                    let bus = bus.clone();
                    let plugin = plugin.clone();
                    handle.spawn(async move {
                        bus.emit_from(
                            &plugin,
                            FS_CHANGED_EVENT,
                            json!({ "kind": kind, "paths": paths }),
                        )
                        .await;
                    });
                }
                Err(e) => warn!(plugin_id = %plugin, error = %e, "file watcher error"),
            },
        )
        .map_err(|e| WardenError::Other(anyhow_from(e)))?;

        watcher
            .watch(&full, RecursiveMode::Recursive)
            .map_err(|e| WardenError::Other(anyhow_from(e)))?;

        // One watch per plugin; a new watch replaces the previous one.
        if self
            .watchers
            .lock()
            .insert(plugin_id.to_string(), watcher)
            .is_some()
        {
            debug!(plugin_id, "replaced existing directory watch");
        }
        info!(plugin_id, path = %rel, "watching directory");
        Ok(())
    }

    async fn unwatch_directory(&self, plugin_id: &str) -> Result<()> {
        if self.watchers.lock().remove(plugin_id).is_some() {
            info!(plugin_id, "stopped watching directory");
        }
        Ok(())
    }
}

fn anyhow_from(e: notify::Error) -> anyhow::Error {
    anyhow::anyhow!("file watcher: {}", e)
}
