//! Partitioned cache for server-owned data.
//!
//! Every query result lives in its own partition, addressed by a
//! [`PartitionKey`] built from the collection, filters and identity. The
//! [`CacheStore`] owns all partitions, deduplicates fetches, notifies
//! subscribers and persists snapshots. Optimistic writes go through the
//! [`MutationCoordinator`], which can always put things back the way they
//! were.

mod entry;
mod key;
mod mutation;
mod policy;
mod store;
mod traits;

pub use entry::{CacheEntry, CacheValue, Entity, EntityId, EntryStatus, Page};
pub use key::{build_key, FilterValue, PartitionKey};
pub use mutation::{MutationCoordinator, MutationHandle, MutationPhase, MutationSpec};
pub use policy::{CollectionPolicy, CollectionRegistry, Shape};
pub use store::{CacheStore, InvalidationMode, Listener, Subscription};
pub use traits::{Cacheable, Fetcher};
