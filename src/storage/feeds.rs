use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::Feed;
use crate::util::url_variants;

/// Column list matching [`Feed`]'s `FromRow` layout.
pub(crate) const FEED_COLUMNS: &str =
    "id, fetch_url, url, title, etag, last_modified, fetch_interval_secs, last_fetched, available";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert a placeholder feed that has never been fetched.
    ///
    /// Subscribe creates one of these before the first fetch; the title starts
    /// out as the URL itself and is overwritten from feed metadata later.
    pub async fn create_feed(&self, fetch_url: &str, interval_secs: u64) -> Result<Feed> {
        let now = chrono::Utc::now().timestamp();
        let feed: Feed = sqlx::query_as(&format!(
            "INSERT INTO feeds (fetch_url, title, fetch_interval_secs, available, created_at)
             VALUES (?, ?, ?, 1, ?) RETURNING {FEED_COLUMNS}"
        ))
        .bind(fetch_url)
        .bind(fetch_url)
        .bind(interval_secs as i64)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(feed)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let feed = sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Find a feed whose `fetch_url` is any equivalent spelling of `url`
    /// (scheme, trailing slash, `www.`), optionally ignoring one feed id.
    ///
    /// An exact match is preferred over a variant match.
    pub async fn find_feed_by_url(&self, url: &str, exclude_id: Option<i64>) -> Result<Option<Feed>> {
        let variants = url_variants(url);
        let exact = variants[0].clone();

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {FEED_COLUMNS} FROM feeds WHERE fetch_url IN ("));
        let mut separated = builder.separated(", ");
        for variant in &variants {
            separated.push_bind(variant);
        }
        separated.push_unseparated(")");
        if let Some(id) = exclude_id {
            builder.push(" AND id != ").push_bind(id);
        }
        builder.push(" ORDER BY (fetch_url = ").push_bind(exact).push(") DESC, id LIMIT 1");

        let feed = builder
            .build_query_as::<Feed>()
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Point a feed at a different address (autodiscovery rewrite).
    /// Returns false if the feed no longer exists.
    pub async fn set_feed_fetch_url(&self, feed_id: i64, fetch_url: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET fetch_url = ? WHERE id = ?")
            .bind(fetch_url)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a feed and, through cascades, its entries, subscriptions and
    /// folder memberships. Returns whether a row was removed.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_feeds(&self) -> Result<Vec<Feed>> {
        let feeds = sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    /// Feeds that should have a live schedule.
    pub async fn list_available_feeds(&self) -> Result<Vec<Feed>> {
        let feeds = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE available = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Persist a new polling interval. Returns false if the feed no longer exists.
    pub async fn set_feed_interval(&self, feed_id: i64, interval_secs: u64) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET fetch_interval_secs = ? WHERE id = ?")
            .bind(interval_secs as i64)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_feed_available(&self, feed_id: i64, available: bool) -> Result<()> {
        sqlx::query("UPDATE feeds SET available = ? WHERE id = ?")
            .bind(available)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_feed_placeholder() {
        let db = test_db().await;
        let feed = db.create_feed("https://example.com/", 3600).await.unwrap();

        assert_eq!(feed.fetch_url, "https://example.com/");
        assert_eq!(feed.title, "https://example.com/");
        assert_eq!(feed.fetch_interval_secs, 3600);
        assert!(feed.available);
        assert!(feed.etag.is_none());
        assert!(feed.last_fetched.is_none());
    }

    #[tokio::test]
    async fn test_fetch_url_is_unique() {
        let db = test_db().await;
        db.create_feed("https://example.com/feed", 3600).await.unwrap();
        assert!(db.create_feed("https://example.com/feed", 3600).await.is_err());
    }

    #[tokio::test]
    async fn test_find_feed_by_url_variant() {
        let db = test_db().await;
        let feed = db.create_feed("http://www.example.com/feed", 3600).await.unwrap();

        let found = db
            .find_feed_by_url("https://example.com/feed/", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, feed.id);

        assert!(db
            .find_feed_by_url("https://example.com/feed", Some(feed.id))
            .await
            .unwrap()
            .is_none());
        assert!(db
            .find_feed_by_url("https://other.example.com/feed", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_feed_prefers_exact_match() {
        let db = test_db().await;
        db.create_feed("http://example.com/feed", 3600).await.unwrap();
        let exact = db.create_feed("https://example.com/feed", 3600).await.unwrap();

        let found = db
            .find_feed_by_url("https://example.com/feed", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, exact.id);
    }

    #[tokio::test]
    async fn test_delete_feed() {
        let db = test_db().await;
        let feed = db.create_feed("https://example.com/feed", 3600).await.unwrap();

        assert!(db.delete_feed(feed.id).await.unwrap());
        assert!(db.get_feed(feed.id).await.unwrap().is_none());
        assert!(!db.delete_feed(feed.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_feed_id_is_not_reused() {
        let db = test_db().await;
        let placeholder = db.create_feed("https://example.com/blog", 3600).await.unwrap();
        db.delete_feed(placeholder.id).await.unwrap();

        let next = db.create_feed("https://example.org/feed", 3600).await.unwrap();
        assert_ne!(next.id, placeholder.id);
    }

    #[tokio::test]
    async fn test_list_available_feeds_skips_unavailable() {
        let db = test_db().await;
        let a = db.create_feed("https://a.example.com/feed", 3600).await.unwrap();
        let b = db.create_feed("https://b.example.com/feed", 3600).await.unwrap();
        db.set_feed_available(b.id, false).await.unwrap();

        let available = db.list_available_feeds().await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, a.id);
        assert_eq!(db.list_feeds().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_set_interval_and_fetch_url() {
        let db = test_db().await;
        let feed = db.create_feed("https://example.com/", 3600).await.unwrap();

        assert!(db.set_feed_interval(feed.id, 1200).await.unwrap());
        db.set_feed_fetch_url(feed.id, "https://example.com/atom.xml")
            .await
            .unwrap();

        let feed = db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(feed.fetch_interval_secs, 1200);
        assert_eq!(feed.fetch_url, "https://example.com/atom.xml");

        assert!(!db.set_feed_interval(9999, 1200).await.unwrap());
    }
}
