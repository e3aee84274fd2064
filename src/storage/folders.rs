use anyhow::Result;

use super::schema::Database;
use super::types::{Feed, Folder, FolderWithFeeds};
use super::users::prefixed_feed_columns;

impl Database {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    /// Create a folder. Returns `None` if the user already has a folder with
    /// the same title (case-insensitive).
    pub async fn create_folder(&self, user_id: i64, title: &str) -> Result<Option<Folder>> {
        let folder = sqlx::query_as(
            "INSERT INTO folders (user_id, title) VALUES (?, ?)
             ON CONFLICT DO NOTHING RETURNING id, user_id, title",
        )
        .bind(user_id)
        .bind(title.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(folder)
    }

    pub async fn find_folder_by_title(&self, user_id: i64, title: &str) -> Result<Option<Folder>> {
        let folder = sqlx::query_as(
            "SELECT id, user_id, title FROM folders WHERE user_id = ? AND title = ? COLLATE NOCASE",
        )
        .bind(user_id)
        .bind(title.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(folder)
    }

    /// Return the user's folder with this title, creating it if needed.
    /// The boolean is true when the folder was created by this call.
    pub async fn find_or_create_folder(&self, user_id: i64, title: &str) -> Result<(Folder, bool)> {
        if let Some(folder) = self.create_folder(user_id, title).await? {
            return Ok((folder, true));
        }
        self.find_folder_by_title(user_id, title)
            .await?
            .map(|folder| (folder, false))
            .ok_or_else(|| anyhow::anyhow!("Folder {title:?} vanished after conflicting insert"))
    }

    pub async fn get_folder(&self, folder_id: i64) -> Result<Option<Folder>> {
        let folder = sqlx::query_as("SELECT id, user_id, title FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(folder)
    }

    pub async fn list_folders(&self, user_id: i64) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as(
            "SELECT id, user_id, title FROM folders WHERE user_id = ? ORDER BY title COLLATE NOCASE, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }

    /// File a feed into a folder.
    ///
    /// A feed sits in at most one folder per user, so any other membership of
    /// this feed in the same user's folders is removed first. Returns the ids
    /// of the folders the feed was moved out of; callers are expected to run
    /// [`Database::delete_folder_if_empty`] on each.
    pub async fn add_feed_to_folder(&self, folder_id: i64, feed_id: i64) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;

        let moved_from: Vec<(i64,)> = sqlx::query_as(
            "DELETE FROM folder_feeds
             WHERE feed_id = ?1 AND folder_id != ?2 AND folder_id IN (
                 SELECT id FROM folders
                 WHERE user_id = (SELECT user_id FROM folders WHERE id = ?2)
             )
             RETURNING folder_id",
        )
        .bind(feed_id)
        .bind(folder_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO folder_feeds (folder_id, feed_id) VALUES (?, ?)")
            .bind(folder_id)
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(moved_from.into_iter().map(|(id,)| id).collect())
    }

    /// Remove a feed from whichever of the user's folders holds it. Returns
    /// the ids of the folders it was removed from.
    pub async fn remove_feed_from_user_folders(&self, user_id: i64, feed_id: i64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "DELETE FROM folder_feeds
             WHERE feed_id = ? AND folder_id IN (SELECT id FROM folders WHERE user_id = ?)
             RETURNING folder_id",
        )
        .bind(feed_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Delete the folder if no feed remains in it. Returns whether it was deleted.
    ///
    /// Must be called right after any operation that takes a feed out of a
    /// folder; nothing else removes empty folders.
    pub async fn delete_folder_if_empty(&self, folder_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM folders WHERE id = ?1
             AND NOT EXISTS (SELECT 1 FROM folder_feeds WHERE folder_id = ?1)",
        )
        .bind(folder_id)
        .execute(&self.pool)
        .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::debug!(folder_id, "Deleted empty folder");
        }
        Ok(deleted)
    }

    /// The user's folder that holds this feed, if any.
    pub async fn folder_for_feed(&self, user_id: i64, feed_id: i64) -> Result<Option<Folder>> {
        let folder = sqlx::query_as(
            "SELECT f.id, f.user_id, f.title FROM folders f
             JOIN folder_feeds ff ON ff.folder_id = f.id
             WHERE f.user_id = ? AND ff.feed_id = ?",
        )
        .bind(user_id)
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(folder)
    }

    // ========================================================================
    // Export Queries
    // ========================================================================

    /// Subscribed feeds that are not in any of the user's folders.
    pub async fn get_unfiled_feeds(&self, user_id: i64) -> Result<Vec<Feed>> {
        let columns = prefixed_feed_columns("f");
        let feeds = sqlx::query_as(&format!(
            "SELECT {columns} FROM feeds f
             JOIN subscriptions s ON s.feed_id = f.id AND s.user_id = ?1
             WHERE NOT EXISTS (
                 SELECT 1 FROM folder_feeds ff
                 JOIN folders fo ON fo.id = ff.folder_id
                 WHERE ff.feed_id = f.id AND fo.user_id = ?1
             )
             ORDER BY f.title COLLATE NOCASE, f.id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Every folder of the user, ordered by title, with its subscribed feeds.
    pub async fn get_folders_with_feeds(&self, user_id: i64) -> Result<Vec<FolderWithFeeds>> {
        let folders = self.list_folders(user_id).await?;
        let columns = prefixed_feed_columns("f");
        let query = format!(
            "SELECT {columns} FROM feeds f
             JOIN folder_feeds ff ON ff.feed_id = f.id
             JOIN subscriptions s ON s.feed_id = f.id AND s.user_id = ?
             WHERE ff.folder_id = ?
             ORDER BY f.title COLLATE NOCASE, f.id"
        );

        let mut result = Vec::with_capacity(folders.len());
        for folder in folders {
            let feeds = sqlx::query_as(&query)
                .bind(user_id)
                .bind(folder.id)
                .fetch_all(&self.pool)
                .await?;
            result.push(FolderWithFeeds { folder, feeds });
        }
        Ok(result)
    }
}
