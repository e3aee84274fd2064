use anyhow::Result;

use super::feeds::FEED_COLUMNS;
use super::schema::Database;
use super::types::{Feed, User};

impl Database {
    // ========================================================================
    // Users
    // ========================================================================

    pub async fn create_user(&self, email: &str, name: &str) -> Result<User> {
        let now = chrono::Utc::now().timestamp();
        let user = sqlx::query_as(
            "INSERT INTO users (email, name, created_at) VALUES (?, ?, ?) RETURNING id, email, name",
        )
        .bind(email)
        .bind(name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as("SELECT id, email, name FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe a user to a feed. Returns false if already subscribed.
    pub async fn subscribe(&self, user_id: i64, feed_id: i64) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO subscriptions (user_id, feed_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(feed_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a subscription. Returns false if the user was not subscribed.
    pub async fn remove_subscription(&self, user_id: i64, feed_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE user_id = ? AND feed_id = ?")
            .bind(user_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_subscribed(&self, user_id: i64, feed_id: i64) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM subscriptions WHERE user_id = ? AND feed_id = ?")
                .bind(user_id)
                .bind(feed_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn count_subscribers(&self, feed_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE feed_id = ?")
                .bind(feed_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// All feeds a user is subscribed to, ordered by title.
    pub async fn get_subscribed_feeds(&self, user_id: i64) -> Result<Vec<Feed>> {
        let columns = prefixed_feed_columns("f");
        let feeds = sqlx::query_as(&format!(
            "SELECT {columns} FROM feeds f
             JOIN subscriptions s ON s.feed_id = f.id
             WHERE s.user_id = ?
             ORDER BY f.title COLLATE NOCASE, f.id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }
}

/// `FEED_COLUMNS` qualified with a table alias, for joins.
pub(crate) fn prefixed_feed_columns(alias: &str) -> String {
    FEED_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}
