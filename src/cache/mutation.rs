//! Optimistic mutations across one or more partitions.
//!
//! Every mutation runs the same protocol:
//!
//! 1. Snapshot every target partition and apply the optimistic change, in
//!    one critical section. Subscribers see the change immediately.
//! 2. Invoke the network call in the background.
//! 3. On success, commit the server result into every target partition.
//!    On failure, restore every target partition to its snapshot.
//!
//! Mutations sharing a lane token (usually `<entity type>:<id>`) run one
//! after another: a queued mutation takes its snapshot only after the
//! previous one committed or rolled back.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::CacheEntry;
use super::key::PartitionKey;
use super::store::{BatchSnapshot, CacheStore, InvalidationMode};
use crate::error::{SyncError, SyncResult};

/// Where a mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  /// Waiting for its lane.
  Idle,
  Snapshotting,
  /// Optimistic value visible; network call pending.
  Applied,
  Committed,
  RolledBack,
}

type ApplyFn = Box<dyn Fn(&PartitionKey, &CacheEntry) -> CacheEntry + Send + Sync>;
type CommitFn<R> = Box<dyn Fn(&PartitionKey, &CacheEntry, &R) -> CacheEntry + Send + Sync>;
type InvokeFn<R> = Box<dyn FnOnce() -> BoxFuture<'static, SyncResult<R>> + Send>;

/// Declares a mutation up front: the partitions it touches, how to apply
/// it optimistically, how to fold in the server result, and the call
/// itself. The target set is fixed before the mutation starts.
pub struct MutationSpec<R> {
  target_keys: Vec<PartitionKey>,
  lane: Option<String>,
  apply: ApplyFn,
  commit: CommitFn<R>,
  invoke: InvokeFn<R>,
  invalidate_keys: Vec<(PartitionKey, InvalidationMode)>,
  invalidate_collections: Vec<(String, InvalidationMode)>,
}

impl<R: Send + 'static> MutationSpec<R> {
  /// A mutation over `target_keys` whose network call is `invoke`.
  ///
  /// Duplicate keys are ignored. Until `apply`/`commit` are set, both
  /// leave entries untouched.
  pub fn new<F, Fut>(target_keys: Vec<PartitionKey>, invoke: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = SyncResult<R>> + Send + 'static,
  {
    let mut unique: Vec<PartitionKey> = Vec::with_capacity(target_keys.len());
    for key in target_keys {
      if !unique.contains(&key) {
        unique.push(key);
      }
    }

    Self {
      target_keys: unique,
      lane: None,
      apply: Box::new(|_, entry| entry.clone()),
      commit: Box::new(|_, entry, _| entry.clone()),
      invoke: Box::new(move || Box::pin(invoke())),
      invalidate_keys: Vec::new(),
      invalidate_collections: Vec::new(),
    }
  }

  /// Optimistic change, applied to each present target entry.
  pub fn apply<F>(mut self, f: F) -> Self
  where
    F: Fn(&PartitionKey, &CacheEntry) -> CacheEntry + Send + Sync + 'static,
  {
    self.apply = Box::new(f);
    self
  }

  /// Fold the server result into each present target entry. Should set
  /// fields from the result rather than adjust them, so committing twice
  /// is the same as committing once.
  pub fn commit<F>(mut self, f: F) -> Self
  where
    F: Fn(&PartitionKey, &CacheEntry, &R) -> CacheEntry + Send + Sync + 'static,
  {
    self.commit = Box::new(f);
    self
  }

  /// Queue behind any in-flight mutation with the same lane token.
  pub fn serialize_on(mut self, lane: impl Into<String>) -> Self {
    self.lane = Some(lane.into());
    self
  }

  /// Invalidate a partition once the mutation has committed.
  pub fn invalidate_after(mut self, key: PartitionKey, mode: InvalidationMode) -> Self {
    self.invalidate_keys.push((key, mode));
    self
  }

  /// Invalidate a whole collection once the mutation has committed.
  pub fn invalidate_collection_after(mut self, collection: &str, mode: InvalidationMode) -> Self {
    self
      .invalidate_collections
      .push((collection.to_string(), mode));
    self
  }

  pub fn target_keys(&self) -> &[PartitionKey] {
    &self.target_keys
  }

  pub fn lane(&self) -> Option<&str> {
    self.lane.as_deref()
  }
}

/// Awaitable result of [`MutationCoordinator::mutate`].
///
/// Dropping the handle does not cancel the mutation; it still commits or
/// rolls back in the background.
pub struct MutationHandle<R> {
  join: JoinHandle<SyncResult<R>>,
  phase: watch::Receiver<MutationPhase>,
}

impl<R> MutationHandle<R> {
  pub fn phase(&self) -> MutationPhase {
    *self.phase.borrow()
  }
}

impl<R> Future for MutationHandle<R> {
  type Output = SyncResult<R>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.get_mut().join).poll(cx) {
      Poll::Ready(Ok(result)) => Poll::Ready(result),
      Poll::Ready(Err(e)) => Poll::Ready(Err(SyncError::network(format!(
        "mutation task failed: {}",
        e
      )))),
      Poll::Pending => Poll::Pending,
    }
  }
}

type Lane = Arc<tokio::sync::Mutex<()>>;

struct LaneTicket {
  name: String,
  lane: Lane,
  guard: OwnedMutexGuard<()>,
}

/// Runs [`MutationSpec`]s against a [`CacheStore`].
#[derive(Clone)]
pub struct MutationCoordinator {
  store: CacheStore,
  lanes: Arc<Mutex<HashMap<String, Lane>>>,
}

impl MutationCoordinator {
  pub fn new(store: CacheStore) -> Self {
    Self {
      store,
      lanes: Arc::default(),
    }
  }

  /// Start a mutation.
  ///
  /// When its lane is free the optimistic change is visible before this
  /// returns; otherwise it is applied as soon as the lane frees up. The
  /// network call always runs in the background.
  pub fn mutate<R: Send + 'static>(&self, spec: MutationSpec<R>) -> MutationHandle<R> {
    let (phase_tx, phase_rx) = watch::channel(MutationPhase::Idle);
    let this = self.clone();

    let join = match spec.lane.clone() {
      None => {
        let snapshot = this.begin(&spec, &phase_tx);
        tokio::spawn(this.settle(spec, snapshot, phase_tx, None))
      }
      Some(name) => {
        let lane = self.lane(&name);
        match lane.clone().try_lock_owned() {
          Ok(guard) => {
            let snapshot = this.begin(&spec, &phase_tx);
            let ticket = LaneTicket { name, lane, guard };
            tokio::spawn(this.settle(spec, snapshot, phase_tx, Some(ticket)))
          }
          Err(_) => {
            debug!(lane = %name, "mutation queued behind in-flight mutation");
            tokio::spawn(async move {
              let guard = lane.clone().lock_owned().await;
              let snapshot = this.begin(&spec, &phase_tx);
              let ticket = LaneTicket { name, lane, guard };
              this.settle(spec, snapshot, phase_tx, Some(ticket)).await
            })
          }
        }
      }
    };

    MutationHandle {
      join,
      phase: phase_rx,
    }
  }

  fn lane(&self, name: &str) -> Lane {
    let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
    lanes.entry(name.to_string()).or_default().clone()
  }

  fn release(&self, ticket: LaneTicket) {
    let LaneTicket { name, lane, guard } = ticket;
    drop(guard);
    let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
    // Only the map and this ticket still hold the lane: nobody is queued.
    if Arc::strong_count(&lane) == 2 {
      lanes.remove(&name);
    }
  }

  fn begin<R>(&self, spec: &MutationSpec<R>, phase: &watch::Sender<MutationPhase>) -> BatchSnapshot {
    phase.send_replace(MutationPhase::Snapshotting);
    let apply = &spec.apply;
    let snapshot = self
      .store
      .apply_batch(&spec.target_keys, |key, entry| apply(key, entry));
    phase.send_replace(MutationPhase::Applied);
    debug!(
      targets = spec.target_keys.len(),
      present = snapshot.prior().len(),
      "optimistic mutation applied"
    );
    snapshot
  }

  async fn settle<R: Send + 'static>(
    self,
    spec: MutationSpec<R>,
    snapshot: BatchSnapshot,
    phase: watch::Sender<MutationPhase>,
    ticket: Option<LaneTicket>,
  ) -> SyncResult<R> {
    let MutationSpec {
      target_keys,
      commit,
      invoke,
      invalidate_keys,
      invalidate_collections,
      ..
    } = spec;

    let result = invoke().await;

    let outcome = match result {
      Ok(server) => {
        let applied = self
          .store
          .commit_batch(&snapshot, |key, entry| commit(key, entry, &server));
        phase.send_replace(MutationPhase::Committed);
        if applied {
          for (key, mode) in &invalidate_keys {
            self.store.invalidate(key, *mode);
          }
          for (collection, mode) in &invalidate_collections {
            self.store.invalidate_collection(collection, *mode);
          }
        } else {
          debug!("cache purged while mutation was in flight; commit skipped");
        }
        Ok(server)
      }
      Err(e) => {
        warn!(error = %e, targets = target_keys.len(), "mutation failed, rolling back");
        self.store.restore_batch(snapshot);
        phase.send_replace(MutationPhase::RolledBack);
        if e.ends_session() {
          info!("session expired during mutation");
          self.store.purge_all();
        }
        Err(e)
      }
    };

    if let Some(ticket) = ticket {
      self.release(ticket);
    }
    outcome
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheValue, EntityId, EntryStatus};
  use crate::clock::Clock;
  use crate::testing::{entity, harness, pages, settle};
  use serde_json::json;
  use tokio::sync::oneshot;

  type Gate = oneshot::Sender<SyncResult<(i64, bool)>>;

  fn key(collection: &str) -> PartitionKey {
    PartitionKey::new(collection, Some("alice"))
  }

  fn id42() -> EntityId {
    EntityId::Num(42)
  }

  fn fields(store: &CacheStore, key: &PartitionKey) -> Option<(i64, bool)> {
    let entry = store.peek(key)?;
    let e = entry.value.find(&id42())?;
    Some((e.i64_field("count")?, e.bool_field("flag")?))
  }

  /// Flip `flag` and move `count` by one; commit writes the server's
  /// authoritative pair.
  fn toggle(targets: Vec<PartitionKey>) -> (MutationSpec<(i64, bool)>, Gate) {
    let (tx, rx) = oneshot::channel();
    let spec = MutationSpec::new(targets, move || async move {
      rx.await
        .unwrap_or_else(|_| Err(SyncError::network("dropped")))
    })
    .apply(|_, entry| {
      let mut next = entry.clone();
      next.value.update_entity(&id42(), |e| {
        let flag = e.bool_field("flag").unwrap_or(false);
        let count = e.i64_field("count").unwrap_or(0);
        e.set("flag", !flag);
        e.set("count", if flag { count - 1 } else { count + 1 });
      });
      next
    })
    .commit(|_, entry, (count, flag)| {
      let mut next = entry.clone();
      next.value.update_entity(&id42(), |e| {
        e.set("count", *count);
        e.set("flag", *flag);
      });
      next
    })
    .serialize_on("item:42");
    (spec, tx)
  }

  fn seed(store: &CacheStore, now: chrono::DateTime<chrono::Utc>) {
    store.write(
      &key("list:popular"),
      CacheEntry::fresh(pages(vec![entity(1, 0, false), entity(42, 5, false)]), now),
    );
    store.write(
      &key("list:latest"),
      CacheEntry::fresh(pages(vec![entity(42, 5, false)]), now),
    );
    store.write(
      &key("detail").with_filter("id", 42),
      CacheEntry::fresh(CacheValue::Entity(entity(42, 5, false)), now),
    );
  }

  fn all_targets() -> Vec<PartitionKey> {
    vec![
      key("list:popular"),
      key("list:latest"),
      key("detail").with_filter("id", 42),
    ]
  }

  #[tokio::test]
  async fn test_toggle_applies_immediately_and_commits_without_flicker() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let coordinator = MutationCoordinator::new(h.store.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
      let seen = seen.clone();
      h.store.subscribe(&key("list:popular"), move |entry| {
        let e = entry.and_then(|e| e.value.find(&id42()).cloned()).unwrap();
        seen
          .lock()
          .unwrap()
          .push((e.i64_field("count").unwrap(), e.bool_field("flag").unwrap()));
      })
    };

    let (spec, gate) = toggle(vec![key("list:popular")]);
    let handle = coordinator.mutate(spec);

    assert_eq!(handle.phase(), MutationPhase::Applied);
    assert_eq!(fields(&h.store, &key("list:popular")), Some((6, true)));

    gate.send(Ok((6, true))).unwrap();
    assert_eq!(handle.await, Ok((6, true)));

    assert_eq!(fields(&h.store, &key("list:popular")), Some((6, true)));
    assert_eq!(*seen.lock().unwrap(), vec![(6, true), (6, true)]);
  }

  #[tokio::test]
  async fn test_network_failure_restores_and_surfaces_error() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let before = h.store.peek(&key("list:popular"));
    let coordinator = MutationCoordinator::new(h.store.clone());

    let (spec, gate) = toggle(vec![key("list:popular")]);
    let handle = coordinator.mutate(spec);
    assert_eq!(fields(&h.store, &key("list:popular")), Some((6, true)));

    gate.send(Err(SyncError::network("offline"))).unwrap();
    let err = handle.await.unwrap_err();

    assert_eq!(err, SyncError::network("offline"));
    assert_eq!(h.store.peek(&key("list:popular")), before);
    assert_eq!(fields(&h.store, &key("list:popular")), Some((5, false)));
  }

  #[tokio::test]
  async fn test_rollback_is_atomic_across_partitions() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let targets = all_targets();
    let before: Vec<_> = targets.iter().map(|k| h.store.peek(k)).collect();
    let coordinator = MutationCoordinator::new(h.store.clone());

    let (spec, gate) = toggle(targets.clone());
    let handle = coordinator.mutate(spec);
    for k in &targets {
      assert_eq!(fields(&h.store, k), Some((6, true)));
    }

    gate.send(Err(SyncError::server("boom"))).unwrap();
    assert!(handle.await.is_err());

    let after: Vec<_> = targets.iter().map(|k| h.store.peek(k)).collect();
    assert_eq!(after, before);
  }

  #[tokio::test]
  async fn test_server_value_wins_over_guess() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let coordinator = MutationCoordinator::new(h.store.clone());

    let (spec, gate) = toggle(all_targets());
    let handle = coordinator.mutate(spec);

    // Someone else prayed concurrently: the server says 7, not 6.
    gate.send(Ok((7, true))).unwrap();
    handle.await.unwrap();

    for k in all_targets() {
      assert_eq!(fields(&h.store, &k), Some((7, true)));
    }
  }

  #[tokio::test]
  async fn test_commit_is_idempotent() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let (spec, _gate) = toggle(vec![]);
    let entry = h.store.peek(&key("list:latest")).unwrap();
    let k = key("list:latest");

    let once = (spec.commit)(&k, &entry, &(9, true));
    let twice = (spec.commit)(&k, &once, &(9, true));
    assert_eq!(once, twice);
  }

  #[tokio::test]
  async fn test_delete_across_partitions() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let targets = all_targets();
    let before: Vec<_> = targets.iter().map(|k| h.store.peek(k)).collect();
    let coordinator = MutationCoordinator::new(h.store.clone());

    let delete = |outcome: SyncResult<()>| {
      MutationSpec::new(all_targets(), move || async move { outcome }).apply(|_, entry| {
        let mut next = entry.clone();
        next.value.remove_entity(&id42());
        next
      })
    };

    // Rolled back: every copy comes back unchanged.
    coordinator
      .mutate(delete(Err(SyncError::network("offline"))))
      .await
      .unwrap_err();
    let after: Vec<_> = targets.iter().map(|k| h.store.peek(k)).collect();
    assert_eq!(after, before);

    // Committed: no partition contains the entity any more.
    coordinator.mutate(delete(Ok(()))).await.unwrap();
    for k in &targets {
      assert!(!h.store.peek(k).unwrap().value.contains(&id42()));
    }
  }

  #[tokio::test]
  async fn test_absent_targets_stay_absent() {
    let h = harness();
    let coordinator = MutationCoordinator::new(h.store.clone());
    let missing = key("detail").with_filter("id", 99);

    let spec = MutationSpec::new(vec![missing.clone()], || async {
      Err::<(), _>(SyncError::network("offline"))
    })
    .apply(|_, _| CacheEntry::fetching());
    coordinator.mutate(spec).await.unwrap_err();

    assert_eq!(h.store.peek(&missing), None);
  }

  #[tokio::test]
  async fn test_read_during_failed_mutation_survives_rollback() {
    let h = harness();
    let coordinator = MutationCoordinator::new(h.store.clone());
    let detail = key("detail").with_filter("id", 7);
    let (fail, invoked) = oneshot::channel::<SyncResult<()>>();

    let spec = MutationSpec::new(vec![detail.clone()], move || async move {
      invoked
        .await
        .unwrap_or_else(|_| Err(SyncError::network("dropped")))
    })
    .apply(|_, _| CacheEntry::fetching());
    let handle = coordinator.mutate(spec);

    let gate = h.fetcher.hold(&detail);
    assert_eq!(h.store.read(&detail).status, EntryStatus::Fetching);
    fail.send(Err(SyncError::network("offline"))).unwrap();
    handle.await.unwrap_err();
    gate.send(Ok(CacheValue::Entity(entity(7, 2, true)))).unwrap();
    settle().await;

    let entry = h.store.peek(&detail).unwrap();
    assert_eq!(entry.status, EntryStatus::Fresh);
    assert_eq!(entry.value, CacheValue::Entity(entity(7, 2, true)));
  }

  #[tokio::test]
  async fn test_cold_read_finishes_despite_mutation_in_flight() {
    let h = harness();
    let coordinator = MutationCoordinator::new(h.store.clone());
    let detail = key("detail").with_filter("id", 42);
    let gate = h.fetcher.hold(&detail);
    assert_eq!(h.store.read(&detail).status, EntryStatus::Fetching);

    let (spec, server) = toggle(vec![detail.clone()]);
    let handle = coordinator.mutate(spec);
    gate.send(Ok(CacheValue::Entity(entity(42, 5, false)))).unwrap();
    settle().await;
    assert_eq!(h.store.peek(&detail).unwrap().status, EntryStatus::Fetching);

    h.fetcher
      .respond(&detail, CacheValue::Entity(entity(42, 6, true)));
    server.send(Ok((6, true))).unwrap();
    handle.await.unwrap();
    settle().await;

    let entry = h.store.peek(&detail).unwrap();
    assert_eq!(entry.status, EntryStatus::Fresh);
    assert_eq!(fields(&h.store, &detail), Some((6, true)));
    assert_eq!(h.fetcher.calls(&detail), 2);
  }

  #[tokio::test]
  async fn test_same_lane_mutations_are_serialized() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let coordinator = MutationCoordinator::new(h.store.clone());
    let k = key("list:popular");

    let (first, gate1) = toggle(vec![k.clone()]);
    let (second, gate2) = toggle(vec![k.clone()]);
    let h1 = coordinator.mutate(first);
    let h2 = coordinator.mutate(second);

    assert_eq!(h1.phase(), MutationPhase::Applied);
    assert_eq!(h2.phase(), MutationPhase::Idle);
    assert_eq!(fields(&h.store, &k), Some((6, true)));

    gate1.send(Ok((6, true))).unwrap();
    assert_eq!(h1.await, Ok((6, true)));
    settle().await;

    // The second toggle snapshots the committed state, not the guess.
    assert_eq!(h2.phase(), MutationPhase::Applied);
    assert_eq!(fields(&h.store, &k), Some((5, false)));

    gate2.send(Err(SyncError::network("offline"))).unwrap();
    h2.await.unwrap_err();
    assert_eq!(fields(&h.store, &k), Some((6, true)));
    assert!(coordinator.lanes.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_different_lanes_run_concurrently() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let coordinator = MutationCoordinator::new(h.store.clone());

    let (first, _gate1) = toggle(vec![key("list:popular")]);
    let (second, _gate2) = toggle(vec![key("list:latest")]);
    let h1 = coordinator.mutate(first);
    let h2 = coordinator.mutate(second.serialize_on("item:other"));

    assert_eq!(h1.phase(), MutationPhase::Applied);
    assert_eq!(h2.phase(), MutationPhase::Applied);
  }

  #[tokio::test]
  async fn test_session_expiry_purges_cache() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let coordinator = MutationCoordinator::new(h.store.clone());

    let (spec, gate) = toggle(all_targets());
    let handle = coordinator.mutate(spec);
    gate.send(Err(SyncError::SessionExpired)).unwrap();

    assert_eq!(handle.await, Err(SyncError::SessionExpired));
    assert!(h.store.is_empty());
  }

  #[tokio::test]
  async fn test_rollback_after_purge_does_not_resurrect_data() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let coordinator = MutationCoordinator::new(h.store.clone());

    let (spec, gate) = toggle(all_targets());
    let handle = coordinator.mutate(spec);
    h.store.purge_all();

    gate.send(Err(SyncError::network("offline"))).unwrap();
    handle.await.unwrap_err();
    assert!(h.store.is_empty());
  }

  #[tokio::test]
  async fn test_invalidations_run_after_commit() {
    let h = harness();
    seed(&h.store, h.clock.now());
    let coordinator = MutationCoordinator::new(h.store.clone());
    let profile = key("profile");
    h.store.write(
      &profile,
      CacheEntry::fresh(CacheValue::Entity(crate::cache::Entity::new(1).with_field("n", json!(1))), h.clock.now()),
    );

    let spec = MutationSpec::new(vec![key("list:popular")], || async { Ok(()) })
      .invalidate_after(profile.clone(), InvalidationMode::Soft)
      .invalidate_collection_after("list:latest", InvalidationMode::Hard);
    coordinator.mutate(spec).await.unwrap();

    assert_eq!(h.store.peek(&profile).unwrap().status, EntryStatus::Stale);
    assert_eq!(h.store.peek(&key("list:latest")), None);
  }

  #[test]
  fn test_duplicate_targets_are_collapsed() {
    let spec = MutationSpec::new(vec![key("a"), key("b"), key("a")], || async { Ok(()) });
    assert_eq!(spec.target_keys(), &[key("a"), key("b")]);
  }
}
