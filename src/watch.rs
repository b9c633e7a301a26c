//! Pollable view over one partition, for event-loop driven callers.
//!
//! ```ignore
//! let mut watch = engine.watch("prayers.list", [("sort", "popular".into())]);
//!
//! // In event loop tick
//! if watch.poll() {
//!     // Partition changed, trigger re-render
//! }
//!
//! // In render
//! match watch.view().status {
//!     EntryStatus::Fetching => render_spinner(),
//!     _ => render_items(watch.view().value.entities()),
//! }
//! ```

use tokio::sync::mpsc;

use crate::cache::{
  CacheEntry, CacheStore, CacheValue, EntryStatus, InvalidationMode, PartitionKey, Subscription,
};
use crate::error::ErrorInfo;

/// Read-only view of a partition handed to application code.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryView {
  pub value: CacheValue,
  pub status: EntryStatus,
  pub error: Option<ErrorInfo>,
}

impl EntryView {
  /// Nothing cached; the next read starts a fetch.
  pub fn absent() -> Self {
    Self {
      value: CacheValue::Empty,
      status: EntryStatus::Stale,
      error: None,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == EntryStatus::Fetching
  }

  pub fn is_error(&self) -> bool {
    self.status == EntryStatus::Error
  }
}

impl From<CacheEntry> for EntryView {
  fn from(entry: CacheEntry) -> Self {
    Self {
      value: entry.value,
      status: entry.status,
      error: entry.last_error,
    }
  }
}

/// Subscription bridged into a channel so changes can be picked up from a
/// polling loop. Unsubscribes when dropped.
pub struct PartitionWatch {
  store: CacheStore,
  key: PartitionKey,
  view: EntryView,
  receiver: mpsc::UnboundedReceiver<Option<CacheEntry>>,
  subscription: Option<Subscription>,
}

impl PartitionWatch {
  /// Start watching `key`. Reads it immediately, which fetches in the
  /// background if needed.
  pub fn new(store: CacheStore, key: PartitionKey) -> Self {
    let (tx, receiver) = mpsc::unbounded_channel();
    let subscription = store.subscribe(&key, move |entry| {
      // Ignore send errors - the watch may have been dropped
      let _ = tx.send(entry.cloned());
    });
    let view = store.read(&key).into();

    let mut watch = Self {
      store,
      key,
      view,
      receiver,
      subscription: Some(subscription),
    };
    // The read above may already have notified; that is the current view.
    while watch.receiver.try_recv().is_ok() {}
    watch
  }

  pub fn key(&self) -> &PartitionKey {
    &self.key
  }

  pub fn view(&self) -> &EntryView {
    &self.view
  }

  /// Pick up changes since the last poll.
  ///
  /// Returns `true` if the view changed.
  pub fn poll(&mut self) -> bool {
    let mut latest = None;
    while let Ok(entry) = self.receiver.try_recv() {
      latest = Some(entry);
    }

    match latest {
      Some(Some(entry)) => {
        self.view = entry.into();
        true
      }
      Some(None) => {
        self.view = EntryView::absent();
        true
      }
      None => false,
    }
  }

  /// Mark the partition stale and read it again, keeping the current value
  /// on screen while the refetch runs.
  pub fn refetch(&mut self) {
    self.store.invalidate(&self.key, InvalidationMode::Soft);
    self.poll();
    self.view = self.store.read(&self.key).into();
  }
}

impl Drop for PartitionWatch {
  fn drop(&mut self) {
    if let Some(subscription) = self.subscription.take() {
      subscription.unsubscribe();
    }
  }
}

impl std::fmt::Debug for PartitionWatch {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PartitionWatch")
      .field("key", &self.key)
      .field("view", &self.view)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntityId;
  use crate::clock::Clock;
  use crate::error::{ErrorKind, SyncError};
  use crate::testing::{entity, harness, pages, settle};

  fn popular() -> PartitionKey {
    PartitionKey::new("list:popular", None)
  }

  #[tokio::test]
  async fn test_watch_reports_fetch_completion() {
    let h = harness();
    h.fetcher.respond(&popular(), pages(vec![entity(1, 0, false)]));

    let mut watch = PartitionWatch::new(h.store.clone(), popular());
    assert!(watch.view().is_loading());
    assert!(!watch.poll());

    settle().await;

    assert!(watch.poll());
    assert_eq!(watch.view().status, EntryStatus::Fresh);
    assert!(watch.view().value.contains(&EntityId::Num(1)));
    assert!(!watch.poll(), "nothing new since last poll");
  }

  #[tokio::test]
  async fn test_watch_surfaces_fetch_error() {
    let h = harness();
    h.fetcher.fail(&popular(), SyncError::network("offline"));

    let mut watch = PartitionWatch::new(h.store.clone(), popular());
    settle().await;

    assert!(watch.poll());
    assert!(watch.view().is_error());
    assert_eq!(watch.view().error.as_ref().unwrap().kind, ErrorKind::Network);
  }

  #[tokio::test]
  async fn test_refetch_keeps_value_while_loading() {
    let h = harness();
    h.store.write(
      &popular(),
      CacheEntry::fresh(pages(vec![entity(1, 0, false)]), h.clock.now()),
    );
    let mut watch = PartitionWatch::new(h.store.clone(), popular());
    assert_eq!(watch.view().status, EntryStatus::Fresh);

    let gate = h.fetcher.hold(&popular());
    watch.refetch();
    assert_eq!(watch.view().status, EntryStatus::Stale);
    assert!(watch.view().value.contains(&EntityId::Num(1)));

    gate.send(Ok(pages(vec![entity(2, 0, false)]))).unwrap();
    settle().await;
    assert!(watch.poll());
    assert!(watch.view().value.contains(&EntityId::Num(2)));
  }

  #[tokio::test]
  async fn test_purge_empties_view() {
    let h = harness();
    h.store.write(
      &popular(),
      CacheEntry::fresh(pages(vec![entity(1, 0, false)]), h.clock.now()),
    );
    let mut watch = PartitionWatch::new(h.store.clone(), popular());

    h.store.purge_all();
    assert!(watch.poll());
    assert_eq!(watch.view(), &EntryView::absent());
  }

  #[tokio::test]
  async fn test_dropped_watch_stops_listening() {
    let h = harness();
    h.store.write(&popular(), CacheEntry::fresh(pages(vec![]), h.clock.now()));
    let watch = PartitionWatch::new(h.store.clone(), popular());
    drop(watch);

    h.store.write(&popular(), CacheEntry::fresh(pages(vec![]), h.clock.now()));
    assert_eq!(h.store.len(), 1);
  }
}
