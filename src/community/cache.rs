//! Caching bindings for community types.

use chrono::Duration;

use crate::cache::{
  Cacheable, CollectionPolicy, CollectionRegistry, EntityId, PartitionKey,
};

use super::types::{Post, Prayer, Reply, SortType};

pub const PRAYERS_LIST: &str = "prayers.list";
pub const PRAYERS_DETAIL: &str = "prayers.detail";
pub const PRAYER_REPLIES: &str = "prayers.replies";
pub const COMMUNITY_POSTS: &str = "community.posts";
pub const PROFILE: &str = "profile";
pub const DAILY_VERSE: &str = "daily_verse";
pub const BIBLE: &str = "bible";

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Prayer {
  fn entity_id(&self) -> EntityId {
    EntityId::Num(self.id)
  }

  fn entity_type() -> &'static str {
    "prayer"
  }
}

impl Cacheable for Reply {
  fn entity_id(&self) -> EntityId {
    EntityId::Num(self.id)
  }

  fn entity_type() -> &'static str {
    "reply"
  }
}

impl Cacheable for Post {
  fn entity_id(&self) -> EntityId {
    EntityId::Num(self.id)
  }

  fn entity_type() -> &'static str {
    "post"
  }
}

// ============================================================================
// Query keys
// ============================================================================

/// Logical queries the community screens issue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommunityQuery {
  /// Prayer list in one sort order
  Prayers { sort: SortType },
  /// A single prayer request
  Prayer { id: i64 },
  /// Replies under a prayer
  Replies { prayer_id: i64 },
  /// Feed posts
  Posts { sort: String },
  /// The signed-in user's profile
  Profile,
  DailyVerse,
  /// One Bible chapter
  Bible { book: String, chapter: u32 },
}

impl CommunityQuery {
  pub fn key(&self, identity: Option<&str>) -> PartitionKey {
    match self {
      Self::Prayers { sort } => {
        PartitionKey::new(PRAYERS_LIST, identity).with_filter("sort", sort.as_str())
      }
      Self::Prayer { id } => PartitionKey::new(PRAYERS_DETAIL, identity).with_filter("id", *id),
      Self::Replies { prayer_id } => {
        PartitionKey::new(PRAYER_REPLIES, identity).with_filter("prayer_id", *prayer_id)
      }
      Self::Posts { sort } => {
        PartitionKey::new(COMMUNITY_POSTS, identity).with_filter("sort", sort.as_str())
      }
      Self::Profile => PartitionKey::new(PROFILE, identity),
      Self::DailyVerse => PartitionKey::new(DAILY_VERSE, identity),
      Self::Bible { book, chapter } => PartitionKey::new(BIBLE, identity)
        .with_filter("book", book.as_str())
        .with_filter("chapter", *chapter),
    }
  }
}

/// Built-in policies for every community collection.
pub fn default_collections() -> CollectionRegistry {
  CollectionRegistry::new()
    .with(PRAYERS_LIST, CollectionPolicy::list(Duration::minutes(5)).volatile())
    .with(
      PRAYERS_DETAIL,
      CollectionPolicy::detail(Duration::zero(), &[PRAYERS_LIST]),
    )
    .with(PRAYER_REPLIES, CollectionPolicy::list(Duration::seconds(30)).volatile())
    .with(COMMUNITY_POSTS, CollectionPolicy::list(Duration::minutes(3)).volatile())
    .with(PROFILE, CollectionPolicy::detail(Duration::minutes(3), &[]))
    .with(DAILY_VERSE, CollectionPolicy::detail(Duration::hours(1), &[]))
    .with(BIBLE, CollectionPolicy::detail(Duration::hours(24), &[]))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Shape;

  #[test]
  fn test_query_keys_are_identity_scoped() {
    let a = CommunityQuery::Prayers {
      sort: SortType::Popular,
    }
    .key(Some("alice"));
    let b = CommunityQuery::Prayers {
      sort: SortType::Popular,
    }
    .key(Some("bob"));

    assert_ne!(a, b);
    assert_eq!(a.collection(), PRAYERS_LIST);
    assert_eq!(a.canonical(), r#"prayers.list?sort="popular"@"alice""#);
  }

  #[test]
  fn test_prayer_detail_key_exposes_entity_id() {
    let key = CommunityQuery::Prayer { id: 42 }.key(None);
    assert_eq!(key.entity_id(), Some(EntityId::Num(42)));
  }

  #[test]
  fn test_default_policies() {
    let collections = default_collections();
    assert!(collections.is_volatile(PRAYERS_LIST));
    assert!(collections.is_volatile(COMMUNITY_POSTS));
    assert!(!collections.is_volatile(BIBLE));
    assert_eq!(
      collections.get(PRAYERS_DETAIL).shape,
      Shape::Detail {
        borrow_from: vec![PRAYERS_LIST.to_string()]
      }
    );
    assert_eq!(collections.get("unknown").stale_after, Duration::seconds(30));
  }

  #[test]
  fn test_prayer_round_trips_through_entity() {
    let prayer = Prayer {
      id: 42,
      title: "Healing".into(),
      prayer_count: 5,
      ..Default::default()
    };
    let entity = prayer.to_entity().unwrap();
    assert_eq!(entity.i64_field("prayer_count"), Some(5));
    assert_eq!(Prayer::from_entity(&entity).unwrap(), prayer);
    assert_eq!(prayer.lane(), "prayer:42");
  }
}
