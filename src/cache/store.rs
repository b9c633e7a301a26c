//! In-memory partition store: the system of record while the process runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CacheValue, EntryStatus};
use super::key::PartitionKey;
use super::policy::{CollectionRegistry, Shape};
use super::traits::Fetcher;
use crate::clock::Clock;
use crate::error::{ErrorInfo, SyncResult};
use crate::storage::{DurableStore, PersistedPartition, PersistedSnapshot};

/// How [`CacheStore::invalidate`] treats an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationMode {
  /// Drop the entry; the next read starts from nothing.
  Hard,
  /// Keep the value but mark it stale; the next read refetches in the
  /// background while still serving it.
  Soft,
}

/// Change callback. `None` means the entry was removed.
pub type Listener = Arc<dyn Fn(Option<&CacheEntry>) + Send + Sync>;

struct Slot {
  entry: CacheEntry,
  /// Bumped on every value write; a fetch started under an older version
  /// lost the race and its result is dropped.
  version: u64,
  /// Ticket of the fetch currently allowed to land, if any.
  fetch: Option<u64>,
  /// Optimistic mutations applied to this entry and not yet settled.
  holds: u32,
  /// A fetch was needed while held; start it once the last hold goes.
  refetch: bool,
}

impl Slot {
  fn new(entry: CacheEntry, version: u64, fetch: Option<u64>) -> Self {
    Self {
      entry,
      version,
      fetch,
      holds: 0,
      refetch: false,
    }
  }
}

#[derive(Default)]
struct StoreState {
  slots: HashMap<PartitionKey, Slot>,
  listeners: HashMap<PartitionKey, Vec<(u64, Listener)>>,
  next_listener: u64,
  next_version: u64,
  /// Bumped on purge; fetches from an older epoch belong to a previous
  /// identity and are discarded.
  epoch: u64,
  identity: Option<String>,
}

impl StoreState {
  fn bump_version(&mut self) -> u64 {
    self.next_version += 1;
    self.next_version
  }

  /// Drop one mutation hold. When it was the last and a fetch was
  /// deferred behind it, claim the fetch and return its ticket.
  fn release(&mut self, key: &PartitionKey) -> Option<FetchTicket> {
    let epoch = self.epoch;
    let ticket = self.bump_version();
    let slot = self.slots.get_mut(key)?;
    slot.holds = slot.holds.saturating_sub(1);
    if slot.holds > 0 || !slot.refetch || slot.fetch.is_some() {
      return None;
    }
    slot.refetch = false;
    slot.fetch = Some(ticket);
    Some(FetchTicket {
      page: 1,
      epoch,
      version: slot.version,
      ticket,
    })
  }

  fn listeners_for(&self, key: &PartitionKey) -> Vec<Listener> {
    self
      .listeners
      .get(key)
      .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
      .unwrap_or_default()
  }
}

/// Notifications collected under the lock and delivered after it is
/// released, so listeners may call back into the store.
#[derive(Default)]
struct Outbox {
  events: Vec<(Vec<Listener>, Option<CacheEntry>)>,
}

impl Outbox {
  fn push(&mut self, state: &StoreState, key: &PartitionKey, entry: Option<CacheEntry>) {
    let listeners = state.listeners_for(key);
    if !listeners.is_empty() {
      self.events.push((listeners, entry));
    }
  }

  fn deliver(self) {
    for (listeners, entry) in self.events {
      for listener in listeners {
        listener(entry.as_ref());
      }
    }
  }
}

struct StoreInner {
  state: Mutex<StoreState>,
  fetcher: Arc<dyn Fetcher>,
  durable: DurableStore,
  clock: Arc<dyn Clock>,
  collections: CollectionRegistry,
  persist_tx: mpsc::UnboundedSender<()>,
  /// Serializes snapshot saves against clears so a save that read the
  /// state before a purge cannot land after it.
  persist: Mutex<()>,
}

/// Partition store with subscription, invalidation and debounced
/// persistence.
///
/// Construct once at application start and hand clones around; clones
/// share the same state. Must be created inside a Tokio runtime, which
/// runs background fetches and the persistence task.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<StoreInner>,
}

impl CacheStore {
  pub fn new(
    fetcher: Arc<dyn Fetcher>,
    durable: DurableStore,
    clock: Arc<dyn Clock>,
    collections: CollectionRegistry,
    persist_debounce: Duration,
  ) -> Self {
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();
    let inner = Arc::new(StoreInner {
      state: Mutex::new(StoreState::default()),
      fetcher,
      durable,
      clock,
      collections,
      persist_tx,
      persist: Mutex::new(()),
    });

    tokio::spawn(run_persister(
      Arc::downgrade(&inner),
      persist_rx,
      persist_debounce,
    ));

    Self { inner }
  }

  fn lock(&self) -> MutexGuard<'_, StoreState> {
    self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn persist_guard(&self) -> MutexGuard<'_, ()> {
    self.inner.persist.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn collections(&self) -> &CollectionRegistry {
    &self.inner.collections
  }

  pub fn durable(&self) -> &DurableStore {
    &self.inner.durable
  }

  /// Identity whose snapshot this store persists to.
  pub fn identity(&self) -> Option<String> {
    self.lock().identity.clone()
  }

  pub(crate) fn set_identity(&self, identity: Option<&str>) {
    self.lock().identity = identity.map(String::from);
  }

  pub fn len(&self) -> usize {
    self.lock().slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn keys(&self) -> Vec<PartitionKey> {
    self.lock().slots.keys().cloned().collect()
  }

  /// Current entry without triggering any fetch.
  pub fn peek(&self, key: &PartitionKey) -> Option<CacheEntry> {
    self.lock().slots.get(key).map(|s| s.entry.clone())
  }

  /// Return the current entry, scheduling a background fetch when it is
  /// missing, stale, failed or past its stale window. Never blocks on the
  /// network.
  pub fn read(&self, key: &PartitionKey) -> CacheEntry {
    let now = self.inner.clock.now();
    let mut outbox = Outbox::default();
    let mut spawn = None;

    let entry = {
      let mut state = self.lock();
      let stale_after = self.inner.collections.get(key.collection()).stale_after;

      let epoch = state.epoch;
      let ticket = state.bump_version();

      match state.slots.get_mut(key) {
        Some(slot) => {
          if slot.fetch.is_none() && slot.entry.needs_refresh(now, stale_after) {
            if slot.holds > 0 {
              // The mutation would supersede the result; fetch after it settles.
              slot.refetch = true;
            } else {
              slot.fetch = Some(ticket);
              spawn = Some(FetchTicket {
                page: 1,
                epoch,
                version: slot.version,
                ticket,
              });
            }
          }
          slot.entry.clone()
        }
        None => {
          let entry = self
            .borrow_initial(&state, key)
            .unwrap_or_else(CacheEntry::fetching);
          let version = state.bump_version();
          state
            .slots
            .insert(key.clone(), Slot::new(entry.clone(), version, Some(ticket)));
          outbox.push(&state, key, Some(entry.clone()));
          spawn = Some(FetchTicket {
            page: 1,
            epoch,
            version,
            ticket,
          });
          entry
        }
      }
    };

    outbox.deliver();
    if let Some(ticket) = spawn {
      self.spawn_fetch(key.clone(), ticket);
    }
    entry
  }

  /// Seed a cold detail partition from a list partition that already holds
  /// the same entity.
  fn borrow_initial(&self, state: &StoreState, key: &PartitionKey) -> Option<CacheEntry> {
    let Shape::Detail { borrow_from } = &self.inner.collections.get(key.collection()).shape else {
      return None;
    };
    let id = key.entity_id()?;

    state
      .slots
      .iter()
      .filter(|(k, _)| {
        k.identity() == key.identity() && borrow_from.iter().any(|c| c == k.collection())
      })
      .find_map(|(source, slot)| {
        slot.entry.value.find(&id).map(|entity| {
          debug!(key = %key, source = %source, "seeding detail partition from list copy");
          CacheEntry::borrowed(entity.clone(), slot.entry.fetched_at)
        })
      })
  }

  fn spawn_fetch(&self, key: PartitionKey, ticket: FetchTicket) {
    let store = self.clone();
    let fetch = self.inner.fetcher.fetch(&key, ticket.page);
    debug!(key = %key, page = ticket.page, "background fetch started");
    tokio::spawn(async move {
      let result = fetch.await;
      store.complete_fetch(&key, ticket, result);
    });
  }

  fn complete_fetch(&self, key: &PartitionKey, ticket: FetchTicket, result: SyncResult<CacheValue>) {
    let now = self.inner.clock.now();
    let page = ticket.page;
    let mut outbox = Outbox::default();
    let mut session_ended = false;

    {
      let mut state = self.lock();
      if state.epoch != ticket.epoch {
        debug!(key = %key, "dropping fetch result from before purge");
        return;
      }
      let epoch = state.epoch;
      let new_version = state.bump_version();
      let retry_ticket = state.bump_version();
      let Some(slot) = state.slots.get_mut(key) else {
        debug!(key = %key, "dropping fetch result for invalidated partition");
        return;
      };
      if slot.fetch != Some(ticket.ticket) {
        debug!(key = %key, "dropping result of a replaced fetch");
        return;
      }
      slot.fetch = None;
      if slot.version != ticket.version {
        if slot.holds > 0 {
          debug!(key = %key, "fetch raced a pending mutation; refetching once it settles");
          slot.refetch = true;
          return;
        }
        if slot.entry.status == EntryStatus::Fresh {
          debug!(key = %key, "dropping fetch result superseded by a local write");
          return;
        }
        // The local write left nothing fresh to show; ask again.
        slot.fetch = Some(retry_ticket);
        let retry = FetchTicket {
          page: 1,
          epoch,
          version: slot.version,
          ticket: retry_ticket,
        };
        drop(state);
        debug!(key = %key, "refetching partition changed during fetch");
        self.spawn_fetch(key.clone(), retry);
        return;
      }

      match result {
        Ok(value) => {
          let value = if page > 1 {
            append_page(&slot.entry.value, value)
          } else {
            value
          };
          slot.entry = CacheEntry::fresh(value, now);
          debug!(key = %key, page, "background fetch finished");
        }
        Err(e) => {
          warn!(key = %key, error = %e, "background fetch failed");
          session_ended = e.ends_session();
          slot.entry.status = EntryStatus::Error;
          slot.entry.last_error = Some(ErrorInfo::new(&e, now));
        }
      }
      slot.version = new_version;
      let entry = slot.entry.clone();
      outbox.push(&state, key, Some(entry));
    }

    outbox.deliver();
    if session_ended {
      self.purge_all();
    } else {
      self.schedule_persist();
    }
  }

  /// Fetch the next page of a list partition if its last page says there
  /// is more. Returns whether a fetch was started.
  pub fn load_more(&self, key: &PartitionKey) -> bool {
    let next = {
      let mut state = self.lock();
      let epoch = state.epoch;
      let ticket = state.bump_version();
      let Some(slot) = state.slots.get_mut(key) else {
        return false;
      };
      if slot.fetch.is_some() {
        return false;
      }
      let CacheValue::Pages(pages) = &slot.entry.value else {
        return false;
      };
      match pages.last() {
        Some(last) if last.has_more => {
          let page = last.page + 1;
          slot.fetch = Some(ticket);
          Some(FetchTicket {
            page,
            epoch,
            version: slot.version,
            ticket,
          })
        }
        _ => None,
      }
    };

    match next {
      Some(ticket) => {
        self.spawn_fetch(key.clone(), ticket);
        true
      }
      None => false,
    }
  }

  /// Replace an entry and notify its subscribers.
  pub fn write(&self, key: &PartitionKey, entry: CacheEntry) {
    let mut outbox = Outbox::default();
    {
      let mut state = self.lock();
      let version = state.bump_version();
      match state.slots.get_mut(key) {
        Some(slot) => {
          slot.entry = entry.clone();
          slot.version = version;
        }
        None => {
          state
            .slots
            .insert(key.clone(), Slot::new(entry.clone(), version, None));
        }
      }
      outbox.push(&state, key, Some(entry));
    }
    outbox.deliver();
    self.schedule_persist();
  }

  /// Replace the entries of every present key in one critical section.
  ///
  /// `f` sees each current entry; keys with no entry are left absent and
  /// untouched. Each replaced entry stays held, deferring background
  /// fetches, until the batch is committed with
  /// [`CacheStore::commit_batch`] or undone with
  /// [`CacheStore::restore_batch`].
  pub(crate) fn apply_batch<F>(&self, keys: &[PartitionKey], mut f: F) -> BatchSnapshot
  where
    F: FnMut(&PartitionKey, &CacheEntry) -> CacheEntry,
  {
    let mut outbox = Outbox::default();
    let snapshot = {
      let mut state = self.lock();
      let epoch = state.epoch;
      let mut prior: Vec<(PartitionKey, CacheEntry)> = Vec::with_capacity(keys.len());
      for key in keys {
        if prior.iter().any(|(k, _)| k == key) {
          continue;
        }
        let version = state.bump_version();
        let Some(slot) = state.slots.get_mut(key) else {
          continue;
        };
        let next = f(key, &slot.entry);
        let before = std::mem::replace(&mut slot.entry, next.clone());
        slot.version = version;
        slot.holds += 1;
        prior.push((key.clone(), before));
        outbox.push(&state, key, Some(next));
      }
      BatchSnapshot { epoch, prior }
    };

    outbox.deliver();
    self.schedule_persist();
    snapshot
  }

  /// Replace the entries the batch touched with `f` and release their
  /// holds. A no-op when the cache was purged since `snapshot` was taken.
  /// Returns whether it applied.
  pub(crate) fn commit_batch<F>(&self, snapshot: &BatchSnapshot, mut f: F) -> bool
  where
    F: FnMut(&PartitionKey, &CacheEntry) -> CacheEntry,
  {
    let mut outbox = Outbox::default();
    let mut refetch = Vec::new();
    {
      let mut state = self.lock();
      if state.epoch != snapshot.epoch {
        return false;
      }
      for (key, _) in &snapshot.prior {
        let version = state.bump_version();
        if let Some(slot) = state.slots.get_mut(key) {
          let next = f(key, &slot.entry);
          slot.entry = next.clone();
          slot.version = version;
          outbox.push(&state, key, Some(next));
        }
        if let Some(ticket) = state.release(key) {
          refetch.push((key.clone(), ticket));
        }
      }
    }

    outbox.deliver();
    self.schedule_persist();
    self.spawn_deferred(refetch);
    true
  }

  /// Put every touched key back exactly as captured by
  /// [`CacheStore::apply_batch`] and release their holds, unless the cache
  /// was purged in between. Partitions dropped while the batch was
  /// pending stay dropped. Returns whether it restored.
  pub(crate) fn restore_batch(&self, snapshot: BatchSnapshot) -> bool {
    let mut outbox = Outbox::default();
    let mut refetch = Vec::new();
    {
      let mut state = self.lock();
      if state.epoch != snapshot.epoch {
        return false;
      }
      for (key, entry) in snapshot.prior {
        let version = state.bump_version();
        let Some(slot) = state.slots.get_mut(&key) else {
          continue;
        };
        slot.entry = entry.clone();
        slot.version = version;
        outbox.push(&state, &key, Some(entry));
        if let Some(ticket) = state.release(&key) {
          refetch.push((key, ticket));
        }
      }
    }
    outbox.deliver();
    self.schedule_persist();
    self.spawn_deferred(refetch);
    true
  }

  fn spawn_deferred(&self, refetch: Vec<(PartitionKey, FetchTicket)>) {
    for (key, ticket) in refetch {
      debug!(key = %key, "starting fetch deferred behind a mutation");
      self.spawn_fetch(key, ticket);
    }
  }

  /// Register for changes to one partition. Any number of subscribers may
  /// watch the same key.
  pub fn subscribe<F>(&self, key: &PartitionKey, listener: F) -> Subscription
  where
    F: Fn(Option<&CacheEntry>) + Send + Sync + 'static,
  {
    let mut state = self.lock();
    state.next_listener += 1;
    let id = state.next_listener;
    state
      .listeners
      .entry(key.clone())
      .or_default()
      .push((id, Arc::new(listener)));

    Subscription {
      store: Arc::downgrade(&self.inner),
      key: key.clone(),
      id,
    }
  }

  pub fn invalidate(&self, key: &PartitionKey, mode: InvalidationMode) {
    self.invalidate_where(mode, |k| k == key);
  }

  /// Invalidate every partition of a collection.
  pub fn invalidate_collection(&self, collection: &str, mode: InvalidationMode) -> usize {
    self.invalidate_where(mode, |k| k.collection() == collection)
  }

  /// Soft-invalidate every partition whose collection is volatile.
  pub fn invalidate_volatile(&self) -> usize {
    let collections = &self.inner.collections;
    self.invalidate_where(InvalidationMode::Soft, |k| {
      collections.is_volatile(k.collection())
    })
  }

  fn invalidate_where<P>(&self, mode: InvalidationMode, predicate: P) -> usize
  where
    P: Fn(&PartitionKey) -> bool,
  {
    let mut outbox = Outbox::default();
    let touched = {
      let mut state = self.lock();
      let keys: Vec<PartitionKey> = state
        .slots
        .keys()
        .filter(|k| predicate(k))
        .cloned()
        .collect();

      for key in &keys {
        match mode {
          InvalidationMode::Hard => {
            state.slots.remove(key);
            outbox.push(&state, key, None);
          }
          InvalidationMode::Soft => {
            if let Some(slot) = state.slots.get_mut(key) {
              if slot.entry.status == EntryStatus::Fresh {
                slot.entry.status = EntryStatus::Stale;
              }
              let entry = slot.entry.clone();
              outbox.push(&state, key, Some(entry));
            }
          }
        }
      }
      keys.len()
    };

    if touched > 0 {
      debug!(?mode, partitions = touched, "invalidated partitions");
      outbox.deliver();
      self.schedule_persist();
    }
    touched
  }

  /// Drop every in-memory entry and the current identity's snapshot.
  /// Fetches still in flight are orphaned and their results discarded.
  pub fn purge_all(&self) {
    let _persist = self.persist_guard();
    let mut outbox = Outbox::default();
    let identity = {
      let mut state = self.lock();
      state.epoch += 1;
      let keys: Vec<PartitionKey> = state.slots.keys().cloned().collect();
      state.slots.clear();
      for key in &keys {
        outbox.push(&state, key, None);
      }
      info!(partitions = keys.len(), "purged cache");
      state.identity.clone()
    };

    outbox.deliver();
    if let Err(e) = self.inner.durable.clear(identity.as_deref()) {
      warn!(error = %e, "failed to clear persisted snapshot");
    }
  }

  /// Load a persisted snapshot. Partitions already live in memory win.
  pub fn restore(&self, snapshot: PersistedSnapshot) -> usize {
    let mut outbox = Outbox::default();
    let restored = {
      let mut state = self.lock();
      let mut restored = 0;
      for PersistedPartition { key, entry } in snapshot.partitions {
        if state.slots.contains_key(&key) {
          continue;
        }
        let version = state.bump_version();
        outbox.push(&state, &key, Some(entry.clone()));
        state.slots.insert(key, Slot::new(entry, version, None));
        restored += 1;
      }
      restored
    };
    outbox.deliver();
    debug!(partitions = restored, "restored persisted partitions");
    restored
  }

  /// Build the snapshot that would be persisted right now.
  pub fn snapshot(&self) -> PersistedSnapshot {
    let now = self.inner.clock.now();
    let state = self.lock();
    let partitions = state
      .slots
      .iter()
      .filter(|(_, slot)| slot.entry.is_persistable())
      .map(|(key, slot)| PersistedPartition {
        key: key.clone(),
        entry: slot.entry.clone(),
      })
      .collect();
    PersistedSnapshot::new(state.identity.as_deref(), now, partitions)
  }

  /// Persist immediately, bypassing the debounce. With nothing worth
  /// keeping the identity's snapshot is removed instead.
  pub fn flush(&self) {
    let _persist = self.persist_guard();
    let snapshot = self.snapshot();
    let identity = snapshot.identity.as_deref();
    if !snapshot.partitions.is_empty() {
      self.inner.durable.save(identity, &snapshot);
    } else if let Err(e) = self.inner.durable.clear(identity) {
      warn!(error = %e, "failed to clear empty cache snapshot");
    }
  }

  /// Remove every identity's persisted snapshot, ordered against any
  /// save in progress.
  pub fn clear_all_persisted(&self) -> SyncResult<()> {
    let _persist = self.persist_guard();
    self.inner.durable.clear_all()
  }

  fn schedule_persist(&self) {
    // The receiver only goes away with the runtime; nothing to do then.
    let _ = self.inner.persist_tx.send(());
  }
}

/// Pre-mutation copies of the partitions a batch touched.
#[derive(Debug, Clone)]
pub(crate) struct BatchSnapshot {
  epoch: u64,
  prior: Vec<(PartitionKey, CacheEntry)>,
}

impl BatchSnapshot {
  pub(crate) fn prior(&self) -> &[(PartitionKey, CacheEntry)] {
    &self.prior
  }
}

#[derive(Debug, Clone, Copy)]
struct FetchTicket {
  page: u32,
  epoch: u64,
  /// Entry version the fetch was started against
  version: u64,
  ticket: u64,
}

fn append_page(existing: &CacheValue, next: CacheValue) -> CacheValue {
  match (existing, next) {
    (CacheValue::Pages(have), CacheValue::Pages(more)) => {
      let mut pages = have.clone();
      pages.extend(more);
      CacheValue::Pages(pages)
    }
    (_, next) => next,
  }
}

/// Collapse bursts of writes into one snapshot save.
async fn run_persister(
  inner: Weak<StoreInner>,
  mut rx: mpsc::UnboundedReceiver<()>,
  debounce: Duration,
) {
  while rx.recv().await.is_some() {
    tokio::time::sleep(debounce).await;
    while rx.try_recv().is_ok() {}

    let Some(inner) = inner.upgrade() else {
      break;
    };
    CacheStore { inner }.flush();
  }
}

/// Handle returned by [`CacheStore::subscribe`].
pub struct Subscription {
  store: Weak<StoreInner>,
  key: PartitionKey,
  id: u64,
}

impl Subscription {
  pub fn key(&self) -> &PartitionKey {
    &self.key
  }

  pub fn unsubscribe(self) {
    let Some(inner) = self.store.upgrade() else {
      return;
    };
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(listeners) = state.listeners.get_mut(&self.key) {
      listeners.retain(|(id, _)| *id != self.id);
      if listeners.is_empty() {
        state.listeners.remove(&self.key);
      }
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}
