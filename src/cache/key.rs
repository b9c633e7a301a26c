//! Canonical partition keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::entry::EntityId;

/// A primitive filter value.
///
/// Only primitives can appear in a key, so a non-primitive filter is a
/// compile error rather than a runtime one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
  Bool(bool),
  Int(i64),
  Text(String),
}

impl From<bool> for FilterValue {
  fn from(v: bool) -> Self {
    Self::Bool(v)
  }
}

impl From<i64> for FilterValue {
  fn from(v: i64) -> Self {
    Self::Int(v)
  }
}

impl From<i32> for FilterValue {
  fn from(v: i32) -> Self {
    Self::Int(v.into())
  }
}

impl From<u32> for FilterValue {
  fn from(v: u32) -> Self {
    Self::Int(v.into())
  }
}

impl From<&str> for FilterValue {
  fn from(v: &str) -> Self {
    Self::Text(v.to_string())
  }
}

impl From<String> for FilterValue {
  fn from(v: String) -> Self {
    Self::Text(v)
  }
}

impl From<&EntityId> for FilterValue {
  fn from(id: &EntityId) -> Self {
    match id {
      EntityId::Num(n) => Self::Int(*n),
      EntityId::Text(s) => Self::Text(s.clone()),
    }
  }
}

impl fmt::Display for FilterValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Bool(v) => write!(f, "{}", v),
      Self::Int(v) => write!(f, "{}", v),
      Self::Text(v) => write!(f, "{}", v),
    }
  }
}

/// Identifies one independently cached partition: a collection, its
/// filters and the identity the data was fetched for.
///
/// Filters live in a sorted map, so the order in which a caller supplied
/// them never affects equality, hashing or the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
  collection: String,
  filters: BTreeMap<String, FilterValue>,
  identity: Option<String>,
}

impl PartitionKey {
  pub fn new(collection: impl Into<String>, identity: Option<&str>) -> Self {
    Self {
      collection: collection.into(),
      filters: BTreeMap::new(),
      identity: identity.map(String::from),
    }
  }

  /// Add a filter. Later values for the same field replace earlier ones.
  pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
    self.filters.insert(field.into(), value.into());
    self
  }

  pub fn collection(&self) -> &str {
    &self.collection
  }

  pub fn identity(&self) -> Option<&str> {
    self.identity.as_deref()
  }

  pub fn filters(&self) -> &BTreeMap<String, FilterValue> {
    &self.filters
  }

  pub fn filter(&self, field: &str) -> Option<&FilterValue> {
    self.filters.get(field)
  }

  /// The entity a detail partition points at, read from its `id` filter.
  pub fn entity_id(&self) -> Option<EntityId> {
    match self.filters.get("id")? {
      FilterValue::Int(n) => Some(EntityId::Num(*n)),
      FilterValue::Text(s) => Some(EntityId::Text(s.clone())),
      FilterValue::Bool(_) => None,
    }
  }

  /// Deterministic string form, e.g.
  /// `prayers.list?sort="popular"@"alice"` or `bible?chapter=3@-`.
  ///
  /// Text values are JSON-quoted so that separators inside a value can
  /// never make two different keys collide.
  pub fn canonical(&self) -> String {
    let filters = self
      .filters
      .iter()
      .map(|(field, value)| {
        let value = match value {
          FilterValue::Text(s) => serde_json::Value::String(s.clone()).to_string(),
          other => other.to_string(),
        };
        format!("{}={}", field, value)
      })
      .collect::<Vec<_>>()
      .join("&");
    let identity = self
      .identity
      .as_ref()
      .map(|i| serde_json::Value::String(i.clone()).to_string())
      .unwrap_or_else(|| "-".to_string());
    format!("{}?{}@{}", self.collection, filters, identity)
  }
}

impl fmt::Display for PartitionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical())
  }
}

/// Build a partition key from a collection name, any iterable of filters
/// and the acting identity.
pub fn build_key<I, K, V>(collection: &str, filters: I, identity: Option<&str>) -> PartitionKey
where
  I: IntoIterator<Item = (K, V)>,
  K: Into<String>,
  V: Into<FilterValue>,
{
  filters
    .into_iter()
    .fold(PartitionKey::new(collection, identity), |key, (k, v)| {
      key.with_filter(k, v)
    })
}
