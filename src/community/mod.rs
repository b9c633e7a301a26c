//! Community domain: prayer requests, replies and the feed.

mod cache;
pub mod mutations;
pub mod types;

pub use cache::{
  default_collections, CommunityQuery, BIBLE, COMMUNITY_POSTS, DAILY_VERSE, PRAYERS_DETAIL,
  PRAYERS_LIST, PRAYER_REPLIES, PROFILE,
};
pub use mutations::{CommunityActions, POST_SORTS};
pub use types::{Author, LikeToggle, NewReply, Post, Prayer, PrayerToggle, Reply, SortType};
