//! Per-collection caching policy.

use chrono::Duration;
use std::collections::HashMap;

/// How a collection's partitions are shaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
  /// Paged lists of entities.
  List,
  /// A single entity, addressed by the key's `id` filter. On a cold read
  /// the store looks for a copy in the `borrow_from` list collections.
  Detail { borrow_from: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPolicy {
  pub shape: Shape,
  /// Server truth changes under multi-user activity; soft-invalidated
  /// when the application has been closed for a while.
  pub volatile: bool,
  /// How long a fetched value counts as fresh.
  pub stale_after: Duration,
}

impl CollectionPolicy {
  pub fn list(stale_after: Duration) -> Self {
    Self {
      shape: Shape::List,
      volatile: false,
      stale_after,
    }
  }

  pub fn detail(stale_after: Duration, borrow_from: &[&str]) -> Self {
    Self {
      shape: Shape::Detail {
        borrow_from: borrow_from.iter().map(|s| s.to_string()).collect(),
      },
      volatile: false,
      stale_after,
    }
  }

  pub fn volatile(mut self) -> Self {
    self.volatile = true;
    self
  }
}

impl Default for CollectionPolicy {
  fn default() -> Self {
    Self::list(Duration::seconds(30))
  }
}

/// Lookup table of policies by collection name.
#[derive(Debug, Clone, Default)]
pub struct CollectionRegistry {
  policies: HashMap<String, CollectionPolicy>,
  fallback: CollectionPolicy,
}

impl CollectionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, collection: &str, policy: CollectionPolicy) -> Self {
    self.insert(collection, policy);
    self
  }

  pub fn insert(&mut self, collection: &str, policy: CollectionPolicy) {
    self.policies.insert(collection.to_string(), policy);
  }

  /// Policy for `collection`, or the 30 second list default.
  pub fn get(&self, collection: &str) -> &CollectionPolicy {
    self.policies.get(collection).unwrap_or(&self.fallback)
  }

  pub fn is_volatile(&self, collection: &str) -> bool {
    self.get(collection).volatile
  }
}
