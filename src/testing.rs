//! Test doubles shared by the unit tests.

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::cache::{
  CacheStore, CacheValue, CollectionPolicy, CollectionRegistry, Entity, Fetcher, Page,
  PartitionKey,
};
use crate::clock::ManualClock;
use crate::error::{SyncError, SyncResult};
use crate::storage::{DurableStore, MemoryStore};

type Reply = SyncResult<CacheValue>;

/// Fetcher answering from a script, with optional gates that hold a call
/// open until the test releases it.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
  values: Mutex<HashMap<PartitionKey, Reply>>,
  pages: Mutex<HashMap<(PartitionKey, u32), CacheValue>>,
  gates: Mutex<HashMap<PartitionKey, VecDeque<oneshot::Receiver<Reply>>>>,
  calls: Mutex<Vec<(PartitionKey, u32)>>,
}

impl ScriptedFetcher {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub(crate) fn respond(&self, key: &PartitionKey, value: CacheValue) {
    self.values.lock().unwrap().insert(key.clone(), Ok(value));
  }

  pub(crate) fn fail(&self, key: &PartitionKey, err: SyncError) {
    self.values.lock().unwrap().insert(key.clone(), Err(err));
  }

  pub(crate) fn respond_page(&self, key: &PartitionKey, page: u32, value: CacheValue) {
    self
      .pages
      .lock()
      .unwrap()
      .insert((key.clone(), page), value);
  }

  /// The next fetch of `key` waits for the returned sender.
  pub(crate) fn hold(&self, key: &PartitionKey) -> oneshot::Sender<Reply> {
    let (tx, rx) = oneshot::channel();
    self
      .gates
      .lock()
      .unwrap()
      .entry(key.clone())
      .or_default()
      .push_back(rx);
    tx
  }

  pub(crate) fn calls(&self, key: &PartitionKey) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(k, _)| k == key)
      .count()
  }
}

impl Fetcher for ScriptedFetcher {
  fn fetch(&self, key: &PartitionKey, page: u32) -> BoxFuture<'static, Reply> {
    self.calls.lock().unwrap().push((key.clone(), page));

    let gate = self
      .gates
      .lock()
      .unwrap()
      .get_mut(key)
      .and_then(|q| q.pop_front());
    if let Some(rx) = gate {
      return Box::pin(async move {
        rx.await
          .unwrap_or_else(|_| Err(SyncError::network("gate dropped")))
      });
    }

    let reply = if page > 1 {
      self
        .pages
        .lock()
        .unwrap()
        .get(&(key.clone(), page))
        .cloned()
        .map(Ok)
    } else {
      None
    }
    .or_else(|| self.values.lock().unwrap().get(key).cloned())
    .unwrap_or_else(|| Err(SyncError::network(format!("no script for {}", key))));

    Box::pin(async move { reply })
  }
}

pub(crate) fn start_time() -> chrono::DateTime<Utc> {
  Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap()
}

pub(crate) fn collections() -> CollectionRegistry {
  use chrono::Duration;
  CollectionRegistry::new()
    .with(
      "list:popular",
      CollectionPolicy::list(Duration::minutes(5)).volatile(),
    )
    .with(
      "list:latest",
      CollectionPolicy::list(Duration::minutes(5)).volatile(),
    )
    .with(
      "detail",
      CollectionPolicy::detail(Duration::zero(), &["list:popular", "list:latest"]),
    )
    .with("reference", CollectionPolicy::list(Duration::hours(24)))
}

pub(crate) struct Harness {
  pub store: CacheStore,
  pub fetcher: Arc<ScriptedFetcher>,
  pub kv: Arc<MemoryStore>,
  pub clock: ManualClock,
  pub durable: DurableStore,
}

pub(crate) fn harness() -> Harness {
  harness_with(Arc::new(MemoryStore::new()), ManualClock::new(start_time()))
}

pub(crate) fn harness_for(collections: CollectionRegistry) -> Harness {
  build(
    Arc::new(MemoryStore::new()),
    ManualClock::new(start_time()),
    collections,
  )
}

pub(crate) fn harness_with(kv: Arc<MemoryStore>, clock: ManualClock) -> Harness {
  build(kv, clock, collections())
}

fn build(kv: Arc<MemoryStore>, clock: ManualClock, collections: CollectionRegistry) -> Harness {
  let fetcher = ScriptedFetcher::new();
  let durable = DurableStore::new(
    kv.clone(),
    Arc::new(clock.clone()),
    chrono::Duration::days(7),
  );
  let store = CacheStore::new(
    fetcher.clone(),
    durable.clone(),
    Arc::new(clock.clone()),
    collections,
    Duration::from_millis(5),
  );
  Harness {
    store,
    fetcher,
    kv,
    clock,
    durable,
  }
}

pub(crate) fn entity(id: i64, count: i64, flag: bool) -> Entity {
  Entity::new(id)
    .with_field("count", count)
    .with_field("flag", flag)
}

pub(crate) fn pages(items: Vec<Entity>) -> CacheValue {
  CacheValue::Pages(vec![Page {
    items,
    page: 1,
    has_more: false,
  }])
}

/// Give spawned tasks a chance to run.
pub(crate) async fn settle() {
  tokio::time::sleep(Duration::from_millis(20)).await;
}
