use serde::{Deserialize, Serialize};

/// Sort order of the prayer list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortType {
  #[default]
  Popular,
  Latest,
}

impl SortType {
  pub const ALL: [SortType; 2] = [SortType::Popular, SortType::Latest];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Popular => "popular",
      Self::Latest => "latest",
    }
  }
}

/// A prayer request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Prayer {
  pub id: i64,
  #[serde(default)]
  pub display_name: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub content: String,
  #[serde(default)]
  pub prayer_count: i64,
  #[serde(default)]
  pub reply_count: i64,
  #[serde(default)]
  pub is_prayed: bool,
  #[serde(default)]
  pub created_at: String,
  #[serde(default)]
  pub time_ago: String,
}

/// A reply under a prayer request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
  pub id: i64,
  #[serde(default)]
  pub display_name: String,
  pub content: String,
  #[serde(default)]
  pub created_at: String,
  #[serde(default)]
  pub time_ago: String,
}

/// Body of a new reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewReply {
  pub content: String,
  pub display_name: Option<String>,
}

/// Feed post author
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Author {
  pub name: String,
  pub username: String,
  #[serde(default)]
  pub avatar: String,
}

/// A community feed post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
  pub id: i64,
  #[serde(default)]
  pub author: Author,
  pub content: String,
  #[serde(default)]
  pub image: Option<String>,
  #[serde(default)]
  pub created_at: String,
  #[serde(default)]
  pub likes: i64,
  #[serde(default)]
  pub replies: i64,
  #[serde(default)]
  pub is_liked: bool,
}

/// Server answer to a prayer toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PrayerToggle {
  pub prayer_count: i64,
  pub is_prayed: bool,
}

/// Server answer to a like toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeToggle {
  pub likes: i64,
  pub is_liked: bool,
}
