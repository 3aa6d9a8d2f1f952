use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;
use crate::models::{Feed, FeedFollow, FeedWithOwner, NewPost, Post, User};

pub type Result<T> = std::result::Result<T, StoreError>;

const FEED_COLUMNS: &str =
    "id, name, url, user_id, created_at, updated_at, last_fetched_at, claimed_until";

const POST_COLUMNS: &str =
    "p.id, p.feed_id, p.title, p.url, p.description, p.published_at, p.created_at, p.updated_at";

const FOLLOW_SELECT: &str = r#"
    SELECT ff.id, ff.user_id, ff.feed_id, ff.created_at,
           f.name AS feed_name, u.name AS user_name
    FROM feed_follows ff
    JOIN feeds f ON f.id = ff.feed_id
    JOIN users u ON u.id = ff.user_id
"#;

/// Never-fetched feeds first, then oldest fetch, then lowest id.
const DUE_ORDER: &str = "ORDER BY last_fetched_at ASC NULLS FIRST, id ASC";

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// A private database living as long as the returned handle.
    ///
    /// Every pooled connection to `:memory:` opens a separate database, so the
    /// pool is pinned to one connection that is never recycled.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                user_id INTEGER NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                last_fetched_at DATETIME,
                claimed_until DATETIME,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_follows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                feed_id INTEGER NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (feed_id) REFERENCES feeds(id) ON DELETE CASCADE,
                UNIQUE(user_id, feed_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                description TEXT,
                published_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                FOREIGN KEY (feed_id) REFERENCES feeds(id) ON DELETE CASCADE,
                UNIQUE(feed_id, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_last_fetched ON feeds(last_fetched_at, id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_published ON posts(published_at DESC)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // Users

    pub async fn create_user(&self, name: &str) -> Result<User> {
        let now = Utc::now();
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (name, created_at, updated_at)
            VALUES (?, ?, ?)
            RETURNING id, name, created_at, updated_at
            "#,
        )
        .bind(name)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn get_user(&self, name: &str) -> Result<User> {
        sqlx::query_as::<_, User>(
            "SELECT id, name, created_at, updated_at FROM users WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("user '{}'", name)))
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT id, name, created_at, updated_at FROM users ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    /// Deletes every user; feeds, follows and posts go with them.
    pub async fn delete_users(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM users").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // Feeds

    pub async fn create_feed(&self, name: &str, url: &str, user_id: i64) -> Result<Feed> {
        let now = Utc::now();
        let feed = sqlx::query_as::<_, Feed>(&format!(
            r#"
            INSERT INTO feeds (name, url, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {FEED_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(url)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(feed)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Feed> {
        sqlx::query_as::<_, Feed>(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("feed {}", feed_id)))
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Feed> {
        sqlx::query_as::<_, Feed>(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("feed '{}'", url)))
    }

    pub async fn get_feeds(&self) -> Result<Vec<FeedWithOwner>> {
        let feeds = sqlx::query_as::<_, FeedWithOwner>(
            r#"
            SELECT f.id, f.name, f.url, f.user_id, f.created_at, f.updated_at,
                   f.last_fetched_at, f.claimed_until, u.name AS owner_name
            FROM feeds f
            JOIN users u ON u.id = f.user_id
            ORDER BY f.created_at ASC, f.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(feeds)
    }

    /// The feed most overdue for a refresh, ignoring claims.
    pub async fn next_feed_to_fetch(&self) -> Result<Feed> {
        sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds {DUE_ORDER} LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("feed".to_string()))
    }

    /// Selects the most overdue unclaimed feed and claims it until
    /// `claim_until` in one statement, so two schedulers sharing the
    /// database never pick the same feed. A claim older than `now` is
    /// treated as abandoned.
    pub async fn claim_next_feed(
        &self,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> Result<Feed> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            r#"
            UPDATE feeds
            SET claimed_until = ?
            WHERE id = (
                SELECT id FROM feeds
                WHERE claimed_until IS NULL OR claimed_until <= ?
                {DUE_ORDER}
                LIMIT 1
            )
            RETURNING {FEED_COLUMNS}
            "#
        ))
        .bind(claim_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("feed due for refresh".to_string()))?;

        debug!("Claimed feed {} until {}", feed.id, claim_until);
        Ok(feed)
    }

    pub async fn mark_fetched(&self, feed_id: i64, fetched_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE feeds
            SET last_fetched_at = ?, updated_at = ?, claimed_until = NULL
            WHERE id = ?
            "#,
        )
        .bind(fetched_at)
        .bind(fetched_at)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn release_claim(&self, feed_id: i64) -> Result<()> {
        sqlx::query("UPDATE feeds SET claimed_until = NULL WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // Follows

    pub async fn create_feed_follow(&self, user_id: i64, feed_id: i64) -> Result<FeedFollow> {
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO feed_follows (user_id, feed_id, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(feed_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let follow = sqlx::query_as::<_, FeedFollow>(&format!("{FOLLOW_SELECT} WHERE ff.id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        Ok(follow)
    }

    pub async fn get_feed_follows_for_user(&self, user_id: i64) -> Result<Vec<FeedFollow>> {
        let follows = sqlx::query_as::<_, FeedFollow>(&format!(
            "{FOLLOW_SELECT} WHERE ff.user_id = ? ORDER BY ff.created_at ASC, ff.id ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(follows)
    }

    /// Returns whether a follow was removed.
    pub async fn delete_feed_follow(&self, user_id: i64, feed_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feed_follows WHERE user_id = ? AND feed_id = ?")
            .bind(user_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // Posts

    /// Inserts the post unless `(feed_id, url)` is already stored. Returns
    /// whether a row was written; the first stored copy is never replaced.
    pub async fn upsert_post(&self, post: &NewPost) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO posts (feed_id, title, url, description, published_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(feed_id, url) DO NOTHING
            "#,
        )
        .bind(post.feed_id)
        .bind(&post.title)
        .bind(&post.url)
        .bind(&post.description)
        .bind(post.published_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_posts_for_feed(&self, feed_id: i64) -> Result<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts p WHERE p.feed_id = ? ORDER BY p.id ASC"
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(posts)
    }

    /// Newest posts across every feed the user follows.
    pub async fn get_posts_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(&format!(
            r#"
            SELECT {POST_COLUMNS}
            FROM posts p
            JOIN feed_follows ff ON ff.feed_id = p.feed_id
            WHERE ff.user_id = ?
            ORDER BY p.published_at DESC NULLS LAST, p.id DESC
            LIMIT ?
            "#
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(posts)
    }

    pub async fn count_posts(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
