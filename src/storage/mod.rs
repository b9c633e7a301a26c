//! Durable key/value storage.
//!
//! The engine only needs a scoped string store with `get`/`set`/`remove`
//! and a bounded capacity. Backends:
//! - [`SqliteStore`] for the real application
//! - [`MemoryStore`] for tests and ephemeral sessions
//! - [`NoopStore`] when persistence is disabled

mod durable;
mod sqlite;

pub use durable::{DurableStore, PersistedPartition, PersistedSnapshot};
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::{SyncError, SyncResult};

/// Trait for durable storage backends.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> SyncResult<Option<String>>;

  /// Fails with [`SyncError::StorageQuota`] when the value does not fit.
  fn set(&self, key: &str, value: &str) -> SyncResult<()>;

  fn remove(&self, key: &str) -> SyncResult<()>;

  /// All stored keys starting with `prefix`.
  fn keys_with_prefix(&self, prefix: &str) -> SyncResult<Vec<String>>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
  fn get(&self, key: &str) -> SyncResult<Option<String>> {
    (**self).get(key)
  }

  fn set(&self, key: &str, value: &str) -> SyncResult<()> {
    (**self).set(key, value)
  }

  fn remove(&self, key: &str) -> SyncResult<()> {
    (**self).remove(key)
  }

  fn keys_with_prefix(&self, prefix: &str) -> SyncResult<Vec<String>> {
    (**self).keys_with_prefix(prefix)
  }
}

/// Storage implementation that doesn't store anything.
pub struct NoopStore;

impl KeyValueStore for NoopStore {
  fn get(&self, _key: &str) -> SyncResult<Option<String>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &str) -> SyncResult<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> SyncResult<()> {
    Ok(())
  }

  fn keys_with_prefix(&self, _prefix: &str) -> SyncResult<Vec<String>> {
    Ok(Vec::new())
  }
}

/// In-memory store with an optional byte quota, counted over keys and
/// values like browser local storage.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      entries: Mutex::default(),
      quota_bytes: Some(quota_bytes),
    }
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> SyncResult<Option<String>> {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> SyncResult<()> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(quota) = self.quota_bytes {
      let others: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      let needed = others + key.len() + value.len();
      if needed > quota {
        return Err(SyncError::quota(format!(
          "{} bytes needed, {} available",
          needed, quota
        )));
      }
    }
    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> SyncResult<()> {
    self
      .entries
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(key);
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> SyncResult<Vec<String>> {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    Ok(
      entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
    )
  }
}
