//! Application-facing boundary of the sync engine.

use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{
  build_key, CacheEntry, CacheStore, CollectionRegistry, Fetcher, FilterValue, InvalidationMode,
  MutationCoordinator, MutationHandle, MutationSpec, PartitionKey, Subscription,
};
use crate::clock::Clock;
use crate::identity::{forget_fingerprint, IdentityProvider};
use crate::reconcile::{forget_session, Reconciliation, StartupReconciler};
use crate::storage::{DurableStore, KeyValueStore};
use crate::watch::{EntryView, PartitionWatch};

/// Tunables for [`SyncEngine::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
  /// Persisted data older than this is never served.
  pub ttl: Duration,
  /// Absence after which volatile partitions are marked stale on start.
  pub volatile_after: Duration,
  pub persist_debounce: std::time::Duration,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      ttl: Duration::days(7),
      volatile_after: Duration::minutes(30),
      persist_debounce: std::time::Duration::from_millis(1000),
    }
  }
}

/// One cache engine per application. Clones share state.
#[derive(Clone)]
pub struct SyncEngine {
  store: CacheStore,
  coordinator: MutationCoordinator,
  reconciler: Arc<StartupReconciler>,
  identity: Arc<dyn IdentityProvider>,
  kv: Arc<dyn KeyValueStore>,
  startup: Reconciliation,
}

impl SyncEngine {
  /// Build the engine and reconcile persisted state against the current
  /// identity before anything can be read. Must run inside a Tokio runtime.
  pub fn start(
    fetcher: Arc<dyn Fetcher>,
    kv: Arc<dyn KeyValueStore>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    collections: CollectionRegistry,
    options: EngineOptions,
  ) -> Self {
    let durable = DurableStore::new(kv.clone(), clock.clone(), options.ttl);
    let store = CacheStore::new(
      fetcher,
      durable,
      clock.clone(),
      collections,
      options.persist_debounce,
    );
    let reconciler = StartupReconciler::new(clock, options.volatile_after);
    let startup = reconciler.run(&store, identity.current_identity().as_deref());

    Self {
      coordinator: MutationCoordinator::new(store.clone()),
      store,
      reconciler: Arc::new(reconciler),
      identity,
      kv,
      startup,
    }
  }

  /// What reconciliation did when the engine started.
  pub fn startup(&self) -> Reconciliation {
    self.startup
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn current_identity(&self) -> Option<String> {
    self.identity.current_identity()
  }

  /// Partition key for a query under the current identity.
  pub fn key<I, K, V>(&self, collection: &str, filters: I) -> PartitionKey
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FilterValue>,
  {
    build_key(collection, filters, self.current_identity().as_deref())
  }

  /// Current value of a query. Fetches in the background when needed and
  /// never waits for the network.
  pub fn read<I, K, V>(&self, collection: &str, filters: I) -> EntryView
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FilterValue>,
  {
    self.store.read(&self.key(collection, filters)).into()
  }

  pub fn watch<I, K, V>(&self, collection: &str, filters: I) -> PartitionWatch
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FilterValue>,
  {
    PartitionWatch::new(self.store.clone(), self.key(collection, filters))
  }

  pub fn subscribe<F>(&self, key: &PartitionKey, listener: F) -> Subscription
  where
    F: Fn(Option<&CacheEntry>) + Send + Sync + 'static,
  {
    self.store.subscribe(key, listener)
  }

  pub fn mutate<R: Send + 'static>(&self, spec: MutationSpec<R>) -> MutationHandle<R> {
    self.coordinator.mutate(spec)
  }

  pub fn invalidate<I, K, V>(&self, collection: &str, filters: I, mode: InvalidationMode)
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FilterValue>,
  {
    self.store.invalidate(&self.key(collection, filters), mode);
  }

  pub fn invalidate_collection(&self, collection: &str, mode: InvalidationMode) -> usize {
    self.store.invalidate_collection(collection, mode)
  }

  /// Fetch the next page of a list query.
  pub fn load_more<I, K, V>(&self, collection: &str, filters: I) -> bool
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FilterValue>,
  {
    self.store.load_more(&self.key(collection, filters))
  }

  /// Re-run reconciliation after sign-in or sign-out.
  pub fn on_identity_change(&self) -> Reconciliation {
    self
      .reconciler
      .run(&self.store, self.current_identity().as_deref())
  }

  /// Forget everything this device knows about the session: memory, every
  /// persisted snapshot, the session record and the anonymous fingerprint.
  pub fn sign_out(&self) {
    self.store.purge_all();
    if let Err(e) = self.store.clear_all_persisted() {
      warn!(error = %e, "failed to clear persisted snapshots");
    }
    if let Err(e) = forget_session(self.kv.as_ref()) {
      warn!(error = %e, "failed to clear session record");
    }
    if let Err(e) = forget_fingerprint(self.kv.as_ref()) {
      warn!(error = %e, "failed to clear anonymous fingerprint");
    }
    info!("signed out, local cache cleared");
  }

  /// Persist now instead of waiting for the debounce.
  pub fn flush(&self) {
    self.store.flush();
  }
}
