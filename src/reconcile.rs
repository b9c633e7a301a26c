//! Startup reconciliation between the persisted cache and the current
//! identity.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::error::SyncResult;
use crate::storage::KeyValueStore;

pub const IDENTITY_KEY: &str = "session:identity";
pub const LAST_OPEN_KEY: &str = "session:last_open";

/// What a reconciliation run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
  /// Same identity, opened recently.
  Unchanged { restored: usize },
  /// Same identity after a long absence; volatile partitions marked stale.
  SoftInvalidated { restored: usize, partitions: usize },
  /// Identity changed; everything from the previous identity was dropped.
  HardPurged { restored: usize },
}

/// Session bookkeeping kept next to the cache payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
  /// `None` when no identity was ever recorded, `Some(None)` when the
  /// recorded identity was "nobody".
  pub identity: Option<Option<String>>,
  pub last_open: Option<DateTime<Utc>>,
}

impl SessionRecord {
  /// Read the record, treating anything unreadable as absent.
  pub fn load(kv: &dyn KeyValueStore) -> Self {
    let identity = read_scalar(kv, IDENTITY_KEY).and_then(|raw| {
      serde_json::from_str::<Option<String>>(&raw)
        .map_err(|e| warn!(error = %e, "ignoring unreadable stored identity"))
        .ok()
    });
    let last_open = read_scalar(kv, LAST_OPEN_KEY).and_then(|raw| {
      raw
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    });
    Self {
      identity,
      last_open,
    }
  }

  /// The recorded identity, with "never recorded" read as "nobody".
  pub fn stored_identity(&self) -> Option<&str> {
    self.identity.as_ref().and_then(|i| i.as_deref())
  }
}

fn read_scalar(kv: &dyn KeyValueStore, key: &str) -> Option<String> {
  kv.get(key)
    .map_err(|e| warn!(key, error = %e, "failed to read session record"))
    .ok()
    .flatten()
}

/// Drop the session record, e.g. on sign-out.
pub fn forget_session(kv: &dyn KeyValueStore) -> SyncResult<()> {
  kv.remove(IDENTITY_KEY)?;
  kv.remove(LAST_OPEN_KEY)
}

/// Decides, once per process start (and after each sign-in or sign-out),
/// what the [`CacheStore`] may serve from durable storage.
pub struct StartupReconciler {
  clock: Arc<dyn Clock>,
  volatile_after: Duration,
}

impl StartupReconciler {
  pub fn new(clock: Arc<dyn Clock>, volatile_after: Duration) -> Self {
    Self {
      clock,
      volatile_after,
    }
  }

  pub fn run(&self, store: &CacheStore, current: Option<&str>) -> Reconciliation {
    let durable = store.durable().clone();
    let kv = durable.kv().clone();
    let now = self.clock.now();
    let record = SessionRecord::load(kv.as_ref());
    let stored = record.stored_identity();

    let outcome = if stored != current {
      info!(
        from = stored.unwrap_or("-"),
        to = current.unwrap_or("-"),
        "identity changed, purging cache"
      );
      store.purge_all();
      if store.identity().as_deref() != stored {
        if let Err(e) = durable.clear(stored) {
          warn!(error = %e, "failed to clear previous identity's snapshot");
        }
      }
      store.set_identity(current);
      let restored = durable
        .load(current)
        .map(|snapshot| store.restore(snapshot))
        .unwrap_or(0);
      self.write(kv.as_ref(), IDENTITY_KEY, identity_record(current));
      Reconciliation::HardPurged { restored }
    } else {
      store.set_identity(current);
      if record.identity.is_none() {
        self.write(kv.as_ref(), IDENTITY_KEY, identity_record(current));
      }
      let restored = if store.is_empty() {
        durable
          .load(current)
          .map(|snapshot| store.restore(snapshot))
          .unwrap_or(0)
      } else {
        0
      };

      match record.last_open {
        Some(last) if now - last > self.volatile_after => {
          let partitions = store.invalidate_volatile();
          info!(
            away_secs = (now - last).num_seconds(),
            partitions, "marked volatile partitions stale"
          );
          Reconciliation::SoftInvalidated {
            restored,
            partitions,
          }
        }
        _ => Reconciliation::Unchanged { restored },
      }
    };

    self.write(
      kv.as_ref(),
      LAST_OPEN_KEY,
      now.timestamp_millis().to_string(),
    );
    info!(?outcome, "startup reconciliation finished");
    outcome
  }

  fn write(&self, kv: &dyn KeyValueStore, key: &str, value: String) {
    if let Err(e) = kv.set(key, &value) {
      warn!(key, error = %e, "failed to record session state");
    }
  }
}

fn identity_record(identity: Option<&str>) -> String {
  // Serializing an Option<&str> cannot fail.
  serde_json::to_string(&identity).unwrap_or_else(|_| "null".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheEntry, CacheValue, Entity, EntryStatus, PartitionKey};
  use crate::clock::ManualClock;
  use crate::storage::{DurableStore, MemoryStore, PersistedPartition, PersistedSnapshot};
  use crate::testing::{collections, entity, harness, pages, settle, start_time, ScriptedFetcher};
  use std::sync::Mutex;

  fn reconciler(clock: &ManualClock) -> StartupReconciler {
    StartupReconciler::new(Arc::new(clock.clone()), Duration::minutes(30))
  }

  fn popular(identity: &str) -> PartitionKey {
    PartitionKey::new("list:popular", Some(identity))
  }

  fn reference(identity: &str) -> PartitionKey {
    PartitionKey::new("reference", Some(identity))
  }

  fn persist(durable: &DurableStore, identity: &str, at: DateTime<Utc>) {
    let snapshot = PersistedSnapshot::new(
      Some(identity),
      at,
      vec![
        PersistedPartition {
          key: popular(identity),
          entry: CacheEntry::fresh(pages(vec![entity(42, 5, false)]), at),
        },
        PersistedPartition {
          key: reference(identity),
          entry: CacheEntry::fresh(CacheValue::Entity(Entity::new("john-3-16")), at),
        },
      ],
    );
    durable.save(Some(identity), &snapshot);
  }

  fn record(kv: &dyn KeyValueStore, identity: Option<&str>, last_open: DateTime<Utc>) {
    kv.set(IDENTITY_KEY, &identity_record(identity)).unwrap();
    kv.set(LAST_OPEN_KEY, &last_open.timestamp_millis().to_string())
      .unwrap();
  }

  #[tokio::test]
  async fn test_first_launch_records_session() {
    let h = harness();
    let outcome = reconciler(&h.clock).run(&h.store, None);

    assert_eq!(outcome, Reconciliation::Unchanged { restored: 0 });
    let record = SessionRecord::load(h.kv.as_ref());
    assert_eq!(record.identity, Some(None));
    assert_eq!(record.last_open, Some(h.clock.now()));
  }

  #[tokio::test]
  async fn test_long_absence_soft_invalidates_only_volatile() {
    let h = harness();
    let closed_at = h.clock.now() - Duration::minutes(45);
    persist(&h.durable, "alice", closed_at);
    record(h.kv.as_ref(), Some("alice"), closed_at);

    let outcome = reconciler(&h.clock).run(&h.store, Some("alice"));
    assert_eq!(
      outcome,
      Reconciliation::SoftInvalidated {
        restored: 2,
        partitions: 1
      }
    );

    assert_eq!(h.store.peek(&popular("alice")).unwrap().status, EntryStatus::Stale);
    assert_eq!(h.store.peek(&reference("alice")).unwrap().status, EntryStatus::Fresh);

    h.fetcher.respond(&popular("alice"), pages(vec![]));
    let served = h.store.read(&popular("alice"));
    assert!(served.value.contains(&crate::cache::EntityId::Num(42)));
    h.store.read(&reference("alice"));
    assert_eq!(h.fetcher.calls(&popular("alice")), 1);
    assert_eq!(h.fetcher.calls(&reference("alice")), 0);
  }

  #[tokio::test]
  async fn test_recent_open_is_a_no_op() {
    let h = harness();
    let closed_at = h.clock.now() - Duration::minutes(10);
    persist(&h.durable, "alice", closed_at);
    record(h.kv.as_ref(), Some("alice"), closed_at);

    let outcome = reconciler(&h.clock).run(&h.store, Some("alice"));
    assert_eq!(outcome, Reconciliation::Unchanged { restored: 2 });
    assert_eq!(h.store.peek(&popular("alice")).unwrap().status, EntryStatus::Fresh);
    assert_eq!(
      SessionRecord::load(h.kv.as_ref()).last_open,
      Some(h.clock.now())
    );
  }

  #[tokio::test]
  async fn test_identity_switch_purges_previous_identity() {
    let h = harness();
    let now = h.clock.now();
    persist(&h.durable, "alice", now);
    persist(&h.durable, "bob", now);
    record(h.kv.as_ref(), Some("alice"), now);
    reconciler(&h.clock).run(&h.store, Some("alice"));
    assert!(h.store.peek(&popular("alice")).is_some());

    let outcome = reconciler(&h.clock).run(&h.store, Some("bob"));

    assert_eq!(outcome, Reconciliation::HardPurged { restored: 2 });
    assert!(h.store.keys().iter().all(|k| k.identity() == Some("bob")));
    assert_eq!(h.durable.load(Some("alice")), None);
    assert_eq!(h.store.identity().as_deref(), Some("bob"));
    assert_eq!(
      SessionRecord::load(h.kv.as_ref()).stored_identity(),
      Some("bob")
    );
  }

  /// Records every storage operation in order.
  struct SpyStore {
    inner: MemoryStore,
    log: Mutex<Vec<String>>,
  }

  impl KeyValueStore for SpyStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
      self.log.lock().unwrap().push(format!("get {}", key));
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
      self.log.lock().unwrap().push(format!("set {}", key));
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
      self.log.lock().unwrap().push(format!("remove {}", key));
      self.inner.remove(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> SyncResult<Vec<String>> {
      self.inner.keys_with_prefix(prefix)
    }
  }

  #[tokio::test]
  async fn test_sign_in_purges_before_restoring() {
    let clock = ManualClock::new(start_time());
    let spy = Arc::new(SpyStore {
      inner: MemoryStore::new(),
      log: Mutex::new(Vec::new()),
    });
    let durable = DurableStore::new(spy.clone(), Arc::new(clock.clone()), Duration::days(7));
    let store = crate::cache::CacheStore::new(
      ScriptedFetcher::new(),
      durable.clone(),
      Arc::new(clock.clone()),
      collections(),
      std::time::Duration::from_secs(60),
    );

    // Anonymous session with some data in memory.
    let anon = PartitionKey::new("list:popular", None);
    store.write(&anon, CacheEntry::fresh(pages(vec![entity(1, 0, false)]), clock.now()));
    record(spy.as_ref(), None, clock.now());
    persist(&durable, "alice", clock.now());
    spy.log.lock().unwrap().clear();

    let outcome = reconciler(&clock).run(&store, Some("alice"));
    assert_eq!(outcome, Reconciliation::HardPurged { restored: 2 });
    assert_eq!(store.peek(&anon), None);

    let log = spy.log.lock().unwrap().clone();
    let purged = log
      .iter()
      .position(|op| *op == format!("remove {}", DurableStore::scope(None)))
      .unwrap();
    let restored = log
      .iter()
      .position(|op| *op == format!("get {}", DurableStore::scope(Some("alice"))))
      .unwrap();
    assert!(purged < restored, "purge must precede restore: {:?}", log);
  }

  #[tokio::test]
  async fn test_long_absence_keeps_live_entries() {
    let h = harness();
    let now = h.clock.now();
    record(h.kv.as_ref(), Some("alice"), now);
    let reconciler = reconciler(&h.clock);
    reconciler.run(&h.store, Some("alice"));
    h.store
      .write(&popular("alice"), CacheEntry::fresh(pages(vec![]), now));
    settle().await;

    h.clock.advance(Duration::hours(2));
    let outcome = reconciler.run(&h.store, Some("alice"));
    assert_eq!(
      outcome,
      Reconciliation::SoftInvalidated {
        restored: 0,
        partitions: 1
      }
    );
  }
}
