use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::backend::StorageBackend;
use warden_core::{PermissionCategory, PermissionRegistry, Result, WardenError};

/// Optional `storage.read` / `storage.write` enforcement shared by both
/// stores. Without a registry every plugin may use its own key space.
#[derive(Clone, Default)]
struct StorageGuard {
    permissions: Option<PermissionRegistry>,
}

impl StorageGuard {
    fn check(&self, plugin_id: &str, action: &str, key: Option<&str>) -> Result<()> {
        match &self.permissions {
            Some(registry) => registry.check(plugin_id, PermissionCategory::Storage, action, key),
            None => Ok(()),
        }
    }
}

// ── In-memory ──────────────────────────────────────────────────

/// Per-plugin maps held in process memory.
#[derive(Default)]
pub struct MemoryStorage {
    guard: StorageGuard,
    data: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_permissions(permissions: PermissionRegistry) -> Self {
        Self {
            guard: StorageGuard {
                permissions: Some(permissions),
            },
            data: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn set(&self, plugin_id: &str, key: &str, value: &str) -> Result<()> {
        self.guard.check(plugin_id, "write", Some(key))?;
        self.data
            .lock()
            .entry(plugin_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, plugin_id: &str, key: &str) -> Result<Option<String>> {
        self.guard.check(plugin_id, "read", Some(key))?;
        Ok(self
            .data
            .lock()
            .get(plugin_id)
            .and_then(|m| m.get(key).cloned()))
    }

    async fn delete(&self, plugin_id: &str, key: &str) -> Result<bool> {
        self.guard.check(plugin_id, "write", Some(key))?;
        Ok(self
            .data
            .lock()
            .get_mut(plugin_id)
            .is_some_and(|m| m.remove(key).is_some()))
    }

    async fn clear(&self, plugin_id: &str) -> Result<()> {
        self.guard.check(plugin_id, "write", None)?;
        self.data.lock().remove(plugin_id);
        Ok(())
    }

    async fn keys(&self, plugin_id: &str) -> Result<Vec<String>> {
        self.guard.check(plugin_id, "read", None)?;
        Ok(self
            .data
            .lock()
            .get(plugin_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn has(&self, plugin_id: &str, key: &str) -> Result<bool> {
        self.guard.check(plugin_id, "read", Some(key))?;
        Ok(self
            .data
            .lock()
            .get(plugin_id)
            .is_some_and(|m| m.contains_key(key)))
    }

    async fn size(&self, plugin_id: &str) -> Result<usize> {
        self.guard.check(plugin_id, "read", None)?;
        Ok(self.data.lock().get(plugin_id).map(BTreeMap::len).unwrap_or(0))
    }
}

// ── SQLite ─────────────────────────────────────────────────────

fn db_err(e: rusqlite::Error) -> WardenError {
    WardenError::Storage(e.to_string())
}

/// Persistent per-plugin storage in a single SQLite table keyed by
/// `(plugin_id, key)`.
pub struct SqliteStorage {
    guard: StorageGuard,
    db: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create the storage database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening plugin storage");
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS plugin_kv (
                plugin_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (plugin_id, key)
            );
            ",
        )
        .map_err(db_err)?;
        Ok(Self {
            guard: StorageGuard::default(),
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_permissions(mut self, permissions: PermissionRegistry) -> Self {
        self.guard.permissions = Some(permissions);
        self
    }
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn set(&self, plugin_id: &str, key: &str, value: &str) -> Result<()> {
        self.guard.check(plugin_id, "write", Some(key))?;
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .lock()
            .execute(
                "INSERT INTO plugin_kv (plugin_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(plugin_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![plugin_id, key, value, now],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, plugin_id: &str, key: &str) -> Result<Option<String>> {
        self.guard.check(plugin_id, "read", Some(key))?;
        self.db
            .lock()
            .query_row(
                "SELECT value FROM plugin_kv WHERE plugin_id = ?1 AND key = ?2",
                params![plugin_id, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
    }

    async fn delete(&self, plugin_id: &str, key: &str) -> Result<bool> {
        self.guard.check(plugin_id, "write", Some(key))?;
        let changed = self
            .db
            .lock()
            .execute(
                "DELETE FROM plugin_kv WHERE plugin_id = ?1 AND key = ?2",
                params![plugin_id, key],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn clear(&self, plugin_id: &str) -> Result<()> {
        self.guard.check(plugin_id, "write", None)?;
        self.db
            .lock()
            .execute("DELETE FROM plugin_kv WHERE plugin_id = ?1", params![plugin_id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn keys(&self, plugin_id: &str) -> Result<Vec<String>> {
        self.guard.check(plugin_id, "read", None)?;
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT key FROM plugin_kv WHERE plugin_id = ?1 ORDER BY key")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![plugin_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    async fn has(&self, plugin_id: &str, key: &str) -> Result<bool> {
        self.guard.check(plugin_id, "read", Some(key))?;
        let found: Option<i64> = self
            .db
            .lock()
            .query_row(
                "SELECT 1 FROM plugin_kv WHERE plugin_id = ?1 AND key = ?2",
                params![plugin_id, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn size(&self, plugin_id: &str) -> Result<usize> {
        self.guard.check(plugin_id, "read", None)?;
        let count: i64 = self
            .db
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM plugin_kv WHERE plugin_id = ?1",
                params![plugin_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_upsert_overwrites() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.set("p", "k", "1").await.unwrap();
        store.set("p", "k", "2").await.unwrap();
        assert_eq!(store.get("p", "k").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.size("p").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_store_isolates_plugins() {
        let store = MemoryStorage::new();
        store.set("a", "k", "from-a").await.unwrap();
        assert_eq!(store.get("b", "k").await.unwrap(), None);
        assert!(!store.has("b", "k").await.unwrap());
        store.clear("b").await.unwrap();
        assert!(store.has("a", "k").await.unwrap());
    }
}
