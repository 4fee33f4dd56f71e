//! Expiring key/value entries shared between processes.
//!
//! Locks and download tokens live here. The SQLite store keeps them in
//! `state.db` next to the archives so the CLI and the server see the same
//! markers; the in-memory store backs tests.

use crate::db::DbError;
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transients (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transients_expires_at ON transients(expires_at);
"#;

pub trait TransientStore: Send + Sync {
    /// Live value for `key`, ignoring entries that expired at or before `now`.
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>>;

    /// Insert or overwrite.
    fn set(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()>;

    /// Insert only if no live entry exists. Returns whether the value was stored.
    fn add(&self, key: &str, value: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<bool>;

    fn delete(&self, key: &str) -> Result<bool>;

    /// Drop every entry that expired at or before `now`.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Every stored key starting with `prefix`, live or expired.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct SqliteTransientStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteTransientStore {
    pub fn open(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| DbError::new(format!("cannot open state store {}: {e}", path.display())))?;

        let conn = pool.get().map_err(DbError::from)?;
        conn.execute_batch(SCHEMA).map_err(DbError::from)?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get().map_err(DbError::from)?)
    }
}

impl TransientStore for SqliteTransientStore {
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM transients WHERE key = ?1 AND expires_at > ?2",
                params![key, now.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()
            .map_err(DbError::from)?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO transients (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at.timestamp_millis()],
        )
        .map_err(DbError::from)?;
        Ok(())
    }

    fn add(
        &self,
        key: &str,
        value: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "INSERT INTO transients (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
                 WHERE transients.expires_at <= ?4",
                params![key, value, expires_at.timestamp_millis(), now.timestamp_millis()],
            )
            .map_err(DbError::from)?;
        Ok(changed == 1)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM transients WHERE key = ?1", params![key])
            .map_err(DbError::from)?;
        Ok(changed > 0)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "DELETE FROM transients WHERE expires_at <= ?1",
                params![now.timestamp_millis()],
            )
            .map_err(DbError::from)?;
        Ok(changed)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key FROM transients WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .map_err(DbError::from)?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(DbError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DbError::from)?;
        Ok(keys)
    }
}

#[derive(Default)]
pub struct MemoryTransientStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryTransientStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransientStore for MemoryTransientStore {
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    fn add(
        &self,
        key: &str,
        value: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock();
        if let Some((_, existing)) = entries.get(key) {
            if *existing > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), expires_at));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - entries.len())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    fn exercise(store: &dyn TransientStore) {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = t0 + ChronoDuration::seconds(10);

        assert!(store.add("k", "first", later, t0).unwrap());
        assert!(!store.add("k", "second", later, t0).unwrap());
        assert_eq!(store.get("k", t0).unwrap().as_deref(), Some("first"));

        // Expired entries are invisible and can be replaced.
        assert_eq!(store.get("k", later).unwrap(), None);
        assert!(store
            .add("k", "third", later + ChronoDuration::seconds(10), later)
            .unwrap());
        assert_eq!(store.get("k", later).unwrap().as_deref(), Some("third"));

        store.set("other", "v", t0 + ChronoDuration::seconds(1)).unwrap();
        store.set("k%_", "v", later).unwrap();
        assert_eq!(store.keys_with_prefix("k").unwrap(), vec!["k", "k%_"]);
        assert_eq!(store.keys_with_prefix("k%").unwrap(), vec!["k%_"]);
        assert_eq!(store.purge_expired(later).unwrap(), 2);
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
    }

    #[test]
    fn test_memory_store_semantics() {
        exercise(&MemoryTransientStore::new());
    }

    #[test]
    fn test_sqlite_store_semantics() {
        let dir = TempDir::new().unwrap();
        let store = SqliteTransientStore::open(&dir.path().join("state.db")).unwrap();
        exercise(&store);
    }
}
