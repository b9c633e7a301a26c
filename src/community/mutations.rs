//! Optimistic mutations for prayers, replies and feed posts.
//!
//! Each builder fixes every partition the action can touch up front and
//! returns a [`MutationSpec`] ready for the coordinator.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::cache::{CacheEntry, Cacheable, EntityId, InvalidationMode, MutationSpec, PartitionKey};
use crate::clock::Clock;
use crate::network::{decode, decode_ack, Method, RequestDescriptor, Transport};

use super::cache::{CommunityQuery, COMMUNITY_POSTS, PRAYERS_LIST, PROFILE};
use super::types::{LikeToggle, NewReply, Post, Prayer, PrayerToggle, Reply, SortType};

/// Feed sort orders that can hold a post.
pub const POST_SORTS: [&str; 2] = ["latest", "popular"];

const ANONYMOUS_NAME: &str = "익명";
const JUST_NOW: &str = "방금 전";

/// Builds the community actions against a transport.
#[derive(Clone)]
pub struct CommunityActions {
  transport: Arc<dyn Transport>,
  clock: Arc<dyn Clock>,
  temp_ids: Arc<AtomicI64>,
}

impl CommunityActions {
  pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
    Self {
      transport,
      clock,
      temp_ids: Arc::default(),
    }
  }

  /// Id for an optimistic reply. Negative ids never collide with server
  /// ids; the sequence keeps replies made in the same millisecond apart.
  fn temp_id(&self, now: DateTime<Utc>) -> i64 {
    let seq = self.temp_ids.fetch_add(1, Ordering::Relaxed).rem_euclid(1_000);
    -(now.timestamp_millis() * 1_000 + seq)
  }

  /// Pray for a request, or take the prayer back.
  ///
  /// `currently_prayed` is what the user saw when tapping. The server's
  /// count replaces the local guess in every copy.
  pub fn toggle_prayer(
    &self,
    prayer_id: i64,
    currently_prayed: bool,
    identity: Option<&str>,
  ) -> MutationSpec<PrayerToggle> {
    let method = if currently_prayed {
      Method::Delete
    } else {
      Method::Post
    };
    let request = RequestDescriptor::new(method, format!("prayers/{}/pray", prayer_id));
    let transport = self.transport.clone();
    let id = EntityId::Num(prayer_id);
    let commit_id = id.clone();

    MutationSpec::new(prayer_keys(prayer_id, identity), move || async move {
      decode(transport.send(request).await?)
    })
    .apply(move |_, entry| {
      update_as::<Prayer, _>(entry, &id, |prayer| {
        if prayer.is_prayed == currently_prayed {
          prayer.is_prayed = !currently_prayed;
          prayer.prayer_count += if currently_prayed { -1 } else { 1 };
        }
      })
    })
    .commit(move |_, entry, result: &PrayerToggle| {
      update_as::<Prayer, _>(entry, &commit_id, |prayer| {
        prayer.prayer_count = result.prayer_count;
        prayer.is_prayed = result.is_prayed;
      })
    })
    .serialize_on(prayer_lane(prayer_id))
    .invalidate_collection_after(PRAYERS_LIST, InvalidationMode::Soft)
  }

  /// Delete a prayer request from every list and its detail view.
  pub fn delete_prayer(&self, prayer_id: i64, identity: Option<&str>) -> MutationSpec<()> {
    let request = RequestDescriptor::delete(format!("prayers/{}", prayer_id));
    let transport = self.transport.clone();
    let id = EntityId::Num(prayer_id);
    let commit_id = id.clone();

    MutationSpec::new(prayer_keys(prayer_id, identity), move || async move {
      decode_ack(transport.send(request).await?).map(|_| ())
    })
    .apply(move |_, entry| without(entry, &id))
    .commit(move |_, entry, _| without(entry, &commit_id))
    .serialize_on(prayer_lane(prayer_id))
    .invalidate_after(
      PartitionKey::new(PROFILE, identity),
      InvalidationMode::Soft,
    )
  }

  /// Post a reply. A temporary reply shows at the top of the thread and the
  /// prayer's reply count goes up until the server answers with the real
  /// reply.
  pub fn create_reply(
    &self,
    prayer_id: i64,
    reply: NewReply,
    identity: Option<&str>,
  ) -> MutationSpec<Reply> {
    let replies_key = CommunityQuery::Replies { prayer_id }.key(identity);
    let detail_key = CommunityQuery::Prayer { id: prayer_id }.key(identity);
    let request = RequestDescriptor::post(
      format!("prayers/{}/replies", prayer_id),
      json!({
        "content": &reply.content,
        "display_name": &reply.display_name,
      }),
    );
    let transport = self.transport.clone();

    let now = self.clock.now();
    let temp = Reply {
      id: self.temp_id(now),
      display_name: reply
        .display_name
        .clone()
        .unwrap_or_else(|| ANONYMOUS_NAME.to_string()),
      content: reply.content.clone(),
      created_at: now.to_rfc3339(),
      time_ago: JUST_NOW.to_string(),
    };
    let temp_id = temp.entity_id();
    let prayer = EntityId::Num(prayer_id);
    let apply_replies = replies_key.clone();
    let commit_replies = replies_key.clone();

    MutationSpec::new(
      vec![replies_key, detail_key.clone()],
      move || async move { decode(transport.send(request).await?) },
    )
    .apply(move |key, entry| {
      if *key == apply_replies {
        match temp.to_entity() {
          Ok(entity) => {
            let mut next = entry.clone();
            next.value.prepend(entity);
            next
          }
          Err(e) => {
            warn!(error = %e, "could not build temporary reply");
            entry.clone()
          }
        }
      } else {
        update_as::<Prayer, _>(entry, &prayer, |p| p.reply_count += 1)
      }
    })
    .commit(move |key, entry, reply: &Reply| {
      if *key != commit_replies {
        return entry.clone();
      }
      let mut next = entry.clone();
      next.value.remove_entity(&temp_id);
      if !next.value.contains(&reply.entity_id()) {
        match reply.to_entity() {
          Ok(entity) => {
            next.value.prepend(entity);
          }
          Err(e) => warn!(error = %e, "could not cache server reply"),
        }
      }
      next
    })
    .serialize_on(prayer_lane(prayer_id))
    .invalidate_after(detail_key, InvalidationMode::Soft)
    .invalidate_collection_after(PRAYERS_LIST, InvalidationMode::Soft)
    .invalidate_after(
      PartitionKey::new(PROFILE, identity),
      InvalidationMode::Soft,
    )
  }

  /// Like or unlike a feed post in every feed ordering.
  pub fn toggle_like(
    &self,
    post_id: i64,
    currently_liked: bool,
    identity: Option<&str>,
  ) -> MutationSpec<LikeToggle> {
    let request = RequestDescriptor::post(format!("community/posts/{}/like", post_id), json!({}));
    let transport = self.transport.clone();
    let targets = POST_SORTS
      .iter()
      .map(|sort| {
        CommunityQuery::Posts {
          sort: sort.to_string(),
        }
        .key(identity)
      })
      .collect();
    let id = EntityId::Num(post_id);
    let commit_id = id.clone();

    MutationSpec::new(targets, move || async move {
      decode(transport.send(request).await?)
    })
    .apply(move |_, entry| {
      update_as::<Post, _>(entry, &id, |post| {
        if post.is_liked == currently_liked {
          post.is_liked = !currently_liked;
          post.likes += if currently_liked { -1 } else { 1 };
        }
      })
    })
    .commit(move |_, entry, result: &LikeToggle| {
      update_as::<Post, _>(entry, &commit_id, |post| {
        post.likes = result.likes;
        post.is_liked = result.is_liked;
      })
    })
    .serialize_on(format!("{}:{}", Post::entity_type(), post_id))
    .invalidate_collection_after(COMMUNITY_POSTS, InvalidationMode::Soft)
  }
}

/// Every partition that can hold a copy of the prayer.
fn prayer_keys(prayer_id: i64, identity: Option<&str>) -> Vec<PartitionKey> {
  SortType::ALL
    .iter()
    .map(|sort| CommunityQuery::Prayers { sort: *sort }.key(identity))
    .chain(std::iter::once(
      CommunityQuery::Prayer { id: prayer_id }.key(identity),
    ))
    .collect()
}

fn prayer_lane(prayer_id: i64) -> String {
  format!("{}:{}", Prayer::entity_type(), prayer_id)
}

fn without(entry: &CacheEntry, id: &EntityId) -> CacheEntry {
  let mut next = entry.clone();
  next.value.remove_entity(id);
  next
}

/// Edit every copy of entity `id` in `entry` as a typed `T`. Copies that do
/// not decode as `T` are left alone.
fn update_as<T, F>(entry: &CacheEntry, id: &EntityId, f: F) -> CacheEntry
where
  T: Cacheable,
  F: Fn(&mut T),
{
  let mut next = entry.clone();
  next.value.update_entity(id, |entity| {
    let edited = T::from_entity(entity).and_then(|mut typed| {
      f(&mut typed);
      typed.to_entity()
    });
    match edited {
      Ok(edited) => *entity = edited,
      Err(e) => warn!(entity = %id, error = %e, "skipping undecodable cached entity"),
    }
  });
  next
}
