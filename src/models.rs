use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, FromRow)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` until the first fetch attempt, successful or not.
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// Expiry of an in-flight claim held by a scheduler.
    pub claimed_until: Option<DateTime<Utc>>,
}

/// A feed row joined with the name of the user who added it.
#[derive(Debug, Clone, FromRow)]
pub struct FeedWithOwner {
    #[sqlx(flatten)]
    pub feed: Feed,
    pub owner_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, FromRow)]
pub struct FeedFollow {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub created_at: DateTime<Utc>,
    pub feed_name: String,
    pub user_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, FromRow)]
pub struct Post {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl NewPost {
    pub fn from_item(feed_id: i64, item: FetchedItem) -> Self {
        Self {
            feed_id,
            title: item.title,
            url: item.link,
            description: item.description,
            published_at: item.published_at,
        }
    }
}

/// A parsed feed document. Lives for one fetch cycle only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchedFeed {
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub items: Vec<FetchedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedItem {
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}
