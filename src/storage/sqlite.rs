//! SQLite key/value backend.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::KeyValueStore;
use crate::error::{SyncError, SyncResult};

/// SQLite-based durable storage.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  /// Upper bound on stored key + value bytes
  quota_bytes: Option<u64>,
}

impl SqliteStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// A private, throwaway database.
  pub fn in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  pub fn with_quota(mut self, quota_bytes: u64) -> Self {
    self.quota_bytes = Some(quota_bytes);
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("koinonia").join("cache.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      quota_bytes: None,
    })
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Schema for the key/value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn storage_error(context: &str, err: rusqlite::Error) -> SyncError {
  match err.sqlite_error_code() {
    Some(ErrorCode::DiskFull) => SyncError::quota(format!("{}: {}", context, err)),
    _ => SyncError::storage(format!("{}: {}", context, err)),
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> SyncResult<Option<String>> {
    let conn = self.lock();
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| storage_error("Failed to read key", e))
  }

  fn set(&self, key: &str, value: &str) -> SyncResult<()> {
    let conn = self.lock();

    if let Some(quota) = self.quota_bytes {
      let others: i64 = conn
        .query_row(
          "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
           FROM kv_store WHERE key != ?",
          params![key],
          |row| row.get(0),
        )
        .map_err(|e| storage_error("Failed to measure store", e))?;
      let needed = others as u64 + key.len() as u64 + value.len() as u64;
      if needed > quota {
        return Err(SyncError::quota(format!(
          "{} bytes needed, {} available",
          needed, quota
        )));
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| storage_error("Failed to write key", e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> SyncResult<()> {
    let conn = self.lock();
    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| storage_error("Failed to delete key", e))?;
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> SyncResult<Vec<String>> {
    let conn = self.lock();
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store WHERE substr(key, 1, ?) = ? ORDER BY key")
      .map_err(|e| storage_error("Failed to prepare key scan", e))?;

    let keys = stmt
      .query_map(params![prefix.chars().count() as i64, prefix], |row| {
        row.get::<_, String>(0)
      })
      .map_err(|e| storage_error("Failed to scan keys", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;

  #[test]
  fn test_set_get_remove() {
    let store = SqliteStore::in_memory().unwrap();
    assert_eq!(store.get("missing").unwrap(), None);

    store.set("snapshot:a", "{}").unwrap();
    store.set("snapshot:a", "{\"v\":2}").unwrap();
    assert_eq!(store.get("snapshot:a").unwrap().as_deref(), Some("{\"v\":2}"));

    store.remove("snapshot:a").unwrap();
    assert_eq!(store.get("snapshot:a").unwrap(), None);
  }

  #[test]
  fn test_prefix_scan_is_literal() {
    let store = SqliteStore::in_memory().unwrap();
    store.set("snapshot:a", "1").unwrap();
    store.set("snapshot:b", "2").unwrap();
    store.set("snapshot_x", "3").unwrap();
    store.set("session:identity", "alice").unwrap();

    assert_eq!(
      store.keys_with_prefix("snapshot:").unwrap(),
      vec!["snapshot:a".to_string(), "snapshot:b".to_string()]
    );
  }

  #[test]
  fn test_quota_rejects_oversized_write() {
    let store = SqliteStore::in_memory().unwrap().with_quota(16);
    store.set("a", "12345").unwrap();

    let err = store.set("b", "1234567890123").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageQuota);
    assert_eq!(store.get("b").unwrap(), None);
  }
}
