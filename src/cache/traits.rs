//! Core traits for the caching system.

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};

use super::entry::{CacheValue, Entity, EntityId};
use super::key::PartitionKey;
use crate::error::{SyncError, SyncResult};

/// Trait for domain types that live inside cache partitions.
///
/// Implementors provide a stable id and the collection family they belong
/// to; conversion to and from the untyped [`Entity`] goes through serde.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Stable identifier for this entity (e.g., prayer id)
  fn entity_id(&self) -> EntityId;

  /// Entity family name used for mutation lanes (e.g., "prayer")
  fn entity_type() -> &'static str;

  fn to_entity(&self) -> SyncResult<Entity> {
    let value = serde_json::to_value(self)?;
    serde_json::from_value(value).map_err(SyncError::from)
  }

  fn from_entity(entity: &Entity) -> SyncResult<Self> {
    let value = serde_json::to_value(entity)?;
    serde_json::from_value(value).map_err(SyncError::from)
  }

  /// Lane token serializing mutations against this entity.
  fn lane(&self) -> String {
    format!("{}:{}", Self::entity_type(), self.entity_id())
  }
}

/// Source of partition data for background reads.
pub trait Fetcher: Send + Sync {
  /// Load one page of the partition. Detail partitions ignore `page`.
  fn fetch(&self, key: &PartitionKey, page: u32) -> BoxFuture<'static, SyncResult<CacheValue>>;
}
