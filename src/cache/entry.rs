//! Cache entry data model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ErrorInfo;

/// Stable server-side identifier of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
  Num(i64),
  Text(String),
}

impl From<i64> for EntityId {
  fn from(v: i64) -> Self {
    Self::Num(v)
  }
}

impl From<i32> for EntityId {
  fn from(v: i32) -> Self {
    Self::Num(v.into())
  }
}

impl From<&str> for EntityId {
  fn from(v: &str) -> Self {
    Self::Text(v.to_string())
  }
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Num(n) => write!(f, "{}", n),
      Self::Text(s) => f.write_str(s),
    }
  }
}

/// A server-backed object. Every partition holds its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
  pub id: EntityId,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Entity {
  pub fn new(id: impl Into<EntityId>) -> Self {
    Self {
      id: id.into(),
      fields: Map::new(),
    }
  }

  pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
    self.fields.insert(name.to_string(), value.into());
    self
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  pub fn set(&mut self, name: &str, value: impl Into<Value>) {
    self.fields.insert(name.to_string(), value.into());
  }

  pub fn i64_field(&self, name: &str) -> Option<i64> {
    self.get(name).and_then(Value::as_i64)
  }

  pub fn bool_field(&self, name: &str) -> Option<bool> {
    self.get(name).and_then(Value::as_bool)
  }
}

/// One page of an infinite list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
  pub items: Vec<Entity>,
  pub page: u32,
  pub has_more: bool,
}

/// What a partition holds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "shape", content = "data", rename_all = "snake_case")]
pub enum CacheValue {
  #[default]
  Empty,
  Entity(Entity),
  Pages(Vec<Page>),
}

impl CacheValue {
  pub fn is_empty(&self) -> bool {
    matches!(self, Self::Empty)
  }

  /// Iterate over every entity in this value, in display order.
  pub fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_> {
    match self {
      Self::Empty => Box::new(std::iter::empty()),
      Self::Entity(e) => Box::new(std::iter::once(e)),
      Self::Pages(pages) => Box::new(pages.iter().flat_map(|p| p.items.iter())),
    }
  }

  pub fn find(&self, id: &EntityId) -> Option<&Entity> {
    self.entities().find(|e| &e.id == id)
  }

  pub fn contains(&self, id: &EntityId) -> bool {
    self.find(id).is_some()
  }

  /// Apply `f` to every copy of the entity with `id`. Returns whether any
  /// copy was found.
  pub fn update_entity<F>(&mut self, id: &EntityId, mut f: F) -> bool
  where
    F: FnMut(&mut Entity),
  {
    let mut found = false;
    match self {
      Self::Empty => {}
      Self::Entity(e) => {
        if &e.id == id {
          f(e);
          found = true;
        }
      }
      Self::Pages(pages) => {
        for item in pages.iter_mut().flat_map(|p| p.items.iter_mut()) {
          if &item.id == id {
            f(item);
            found = true;
          }
        }
      }
    }
    found
  }

  /// Drop the entity with `id`. A single-entity value becomes `Empty`.
  pub fn remove_entity(&mut self, id: &EntityId) -> bool {
    match self {
      Self::Empty => false,
      Self::Entity(e) => {
        if &e.id == id {
          *self = Self::Empty;
          true
        } else {
          false
        }
      }
      Self::Pages(pages) => {
        let mut removed = false;
        for page in pages.iter_mut() {
          let before = page.items.len();
          page.items.retain(|item| &item.id != id);
          removed |= page.items.len() != before;
        }
        removed
      }
    }
  }

  /// Insert an entity at the head of the first page.
  pub fn prepend(&mut self, entity: Entity) -> bool {
    match self {
      Self::Pages(pages) => match pages.first_mut() {
        Some(first) => {
          first.items.insert(0, entity);
          true
        }
        None => {
          pages.push(Page {
            items: vec![entity],
            page: 1,
            has_more: false,
          });
          true
        }
      },
      _ => false,
    }
  }
}

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
  Fresh,
  Stale,
  Fetching,
  Error,
}

/// A partition's cached state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub value: CacheValue,
  pub status: EntryStatus,
  pub fetched_at: Option<DateTime<Utc>>,
  pub last_error: Option<ErrorInfo>,
}

impl CacheEntry {
  /// Placeholder for a partition whose first fetch is in flight.
  pub fn fetching() -> Self {
    Self {
      value: CacheValue::Empty,
      status: EntryStatus::Fetching,
      fetched_at: None,
      last_error: None,
    }
  }

  pub fn fresh(value: CacheValue, at: DateTime<Utc>) -> Self {
    Self {
      value,
      status: EntryStatus::Fresh,
      fetched_at: Some(at),
      last_error: None,
    }
  }

  /// Seed a detail partition from a copy found in another partition.
  pub fn borrowed(entity: Entity, fetched_at: Option<DateTime<Utc>>) -> Self {
    Self {
      value: CacheValue::Entity(entity),
      status: EntryStatus::Stale,
      fetched_at,
      last_error: None,
    }
  }

  /// Whether a fresh entry has outlived its collection's stale window.
  pub fn is_expired(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match self.fetched_at {
      Some(at) => now - at > stale_after,
      None => true,
    }
  }

  /// Whether a read should schedule a background fetch.
  pub fn needs_refresh(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match self.status {
      EntryStatus::Fresh => self.is_expired(now, stale_after),
      EntryStatus::Stale | EntryStatus::Error | EntryStatus::Fetching => true,
    }
  }

  /// Worth writing to durable storage: has data and is not mid-flight.
  pub fn is_persistable(&self) -> bool {
    !self.value.is_empty() && self.status != EntryStatus::Fetching
  }
}
