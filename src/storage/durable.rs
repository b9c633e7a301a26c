//! Identity-scoped, TTL-aware snapshot persistence.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use super::KeyValueStore;
use crate::cache::{CacheEntry, PartitionKey};
use crate::clock::Clock;
use crate::error::SyncResult;

const SNAPSHOT_PREFIX: &str = "snapshot:";
const SNAPSHOT_VERSION: u32 = 1;

/// One persisted partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPartition {
  pub key: PartitionKey,
  pub entry: CacheEntry,
}

/// The cache payload written to durable storage for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
  pub version: u32,
  pub identity: Option<String>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
  pub partitions: Vec<PersistedPartition>,
}

impl PersistedSnapshot {
  pub fn new(
    identity: Option<&str>,
    timestamp: DateTime<Utc>,
    partitions: Vec<PersistedPartition>,
  ) -> Self {
    Self {
      version: SNAPSHOT_VERSION,
      identity: identity.map(String::from),
      timestamp,
      partitions,
    }
  }
}

/// Wraps a [`KeyValueStore`] with identity-scoped keys and expiry.
///
/// Persistence is best effort: write failures are logged and swallowed,
/// and anything unreadable on load is treated as absent.
#[derive(Clone)]
pub struct DurableStore {
  kv: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  ttl: Duration,
}

impl DurableStore {
  pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
    Self { kv, clock, ttl }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Underlying key/value store, shared with session bookkeeping.
  pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
    &self.kv
  }

  /// Storage key for an identity's snapshot. The identity is hashed so
  /// usernames never appear in key names.
  pub fn scope(identity: Option<&str>) -> String {
    match identity {
      Some(identity) => {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        format!("{}{}", SNAPSHOT_PREFIX, hex::encode(hasher.finalize()))
      }
      None => format!("{}none", SNAPSHOT_PREFIX),
    }
  }

  pub fn save(&self, identity: Option<&str>, snapshot: &PersistedSnapshot) {
    let key = Self::scope(identity);
    let payload = match serde_json::to_string(snapshot) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(error = %e, "failed to serialize cache snapshot");
        return;
      }
    };

    match self.kv.set(&key, &payload) {
      Ok(()) => debug!(
        partitions = snapshot.partitions.len(),
        bytes = payload.len(),
        "persisted cache snapshot"
      ),
      Err(e) => warn!(error = %e, "skipping cache persistence"),
    }
  }

  /// Read the identity's snapshot, dropping it when absent, corrupt,
  /// written for someone else, or older than the TTL. Individual
  /// partitions older than the TTL are dropped as well.
  pub fn load(&self, identity: Option<&str>) -> Option<PersistedSnapshot> {
    let key = Self::scope(identity);
    let payload = match self.kv.get(&key) {
      Ok(Some(payload)) => payload,
      Ok(None) => return None,
      Err(e) => {
        warn!(error = %e, "failed to read cache snapshot");
        return None;
      }
    };

    let mut snapshot: PersistedSnapshot = match serde_json::from_str(&payload) {
      Ok(snapshot) => snapshot,
      Err(e) => {
        warn!(error = %e, "discarding corrupt cache snapshot");
        self.discard(&key);
        return None;
      }
    };

    if snapshot.identity.as_deref() != identity {
      warn!("discarding cache snapshot written for another identity");
      self.discard(&key);
      return None;
    }

    let now = self.clock.now();
    if now - snapshot.timestamp > self.ttl {
      debug!(written = %snapshot.timestamp, "discarding expired cache snapshot");
      self.discard(&key);
      return None;
    }

    let ttl = self.ttl;
    snapshot
      .partitions
      .retain(|p| p.entry.fetched_at.is_some_and(|at| now - at <= ttl));

    Some(snapshot)
  }

  pub fn clear(&self, identity: Option<&str>) -> SyncResult<()> {
    self.kv.remove(&Self::scope(identity))
  }

  pub fn clear_all(&self) -> SyncResult<()> {
    for key in self.kv.keys_with_prefix(SNAPSHOT_PREFIX)? {
      self.kv.remove(&key)?;
    }
    Ok(())
  }

  /// Every stored snapshot key, for inspection tooling.
  pub fn snapshot_keys(&self) -> SyncResult<Vec<String>> {
    self.kv.keys_with_prefix(SNAPSHOT_PREFIX)
  }

  fn discard(&self, key: &str) {
    if let Err(e) = self.kv.remove(key) {
      warn!(error = %e, "failed to remove unusable cache snapshot");
    }
  }
}
