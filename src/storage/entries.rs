use anyhow::Result;
use sqlx::{Connection, Sqlite, Transaction};

use super::schema::Database;
use super::types::{Entry, FeedUpdate, MergeStats, ParsedEntry};

/// Maximum number of entries returned from any single query
const MAX_ENTRIES: i64 = 2000;

impl Database {
    // ========================================================================
    // Fetch Result Merge
    // ========================================================================

    /// Persist the result of a successful fetch in one transaction.
    ///
    /// Overwrites the feed's title and site URL from document metadata (a
    /// document without a title falls back to the fetch URL), stores
    /// the response's cache validators verbatim (absent → NULL), stamps
    /// `last_fetched`, then merges entries by `(feed_id, guid)`: an existing row
    /// has its mutable fields replaced, an unknown guid is inserted. Entries are
    /// never deleted.
    ///
    /// Each entry runs inside its own savepoint, so a single entry that fails to
    /// persist is rolled back, logged and counted in `skipped` without aborting
    /// the rest.
    ///
    /// Returns `None` (and writes nothing) if the feed was deleted while the
    /// fetch was in flight.
    pub async fn merge_fetched_feed(
        &self,
        feed_id: i64,
        update: &FeedUpdate,
        entries: &[ParsedEntry],
    ) -> Result<Option<MergeStats>> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE feeds SET
                title = COALESCE(?, fetch_url),
                url = ?,
                etag = ?,
                last_modified = ?,
                last_fetched = ?
             WHERE id = ?",
        )
        .bind(&update.title)
        .bind(&update.url)
        .bind(&update.etag)
        .bind(&update.last_modified)
        .bind(now)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(feed_id, "Feed deleted during fetch, discarding result");
            return Ok(None);
        }

        let mut stats = MergeStats::default();
        for entry in entries {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            match upsert_entry(&mut savepoint, feed_id, entry, now).await {
                Ok(inserted) => {
                    savepoint.commit().await?;
                    if inserted {
                        stats.inserted += 1;
                    } else {
                        stats.updated += 1;
                    }
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    stats.skipped += 1;
                    tracing::warn!(feed_id, guid = %entry.guid, error = %e, "Skipping entry that failed to save");
                }
            }
        }

        tx.commit().await?;
        Ok(Some(stats))
    }

    // ========================================================================
    // Entry Queries
    // ========================================================================

    /// Entries of a feed, newest first
    pub async fn get_entries_for_feed(&self, feed_id: i64) -> Result<Vec<Entry>> {
        let entries = sqlx::query_as(
            "SELECT id, feed_id, guid, title, url, author, content, summary, published
             FROM entries WHERE feed_id = ?
             ORDER BY published DESC, id DESC LIMIT ?",
        )
        .bind(feed_id)
        .bind(MAX_ENTRIES)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn count_entries(&self, feed_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Returns true if a new row was inserted, false if an existing one was updated.
async fn upsert_entry(
    tx: &mut Transaction<'_, Sqlite>,
    feed_id: i64,
    entry: &ParsedEntry,
    now: i64,
) -> Result<bool> {
    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM entries WHERE feed_id = ? AND guid = ?")
            .bind(feed_id)
            .bind(&entry.guid)
            .fetch_optional(&mut **tx)
            .await?;

    match existing {
        Some((id,)) => {
            sqlx::query(
                "UPDATE entries SET title = ?, url = ?, author = ?, content = ?, summary = ?,
                 published = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&entry.title)
            .bind(&entry.url)
            .bind(&entry.author)
            .bind(&entry.content)
            .bind(&entry.summary)
            .bind(entry.published)
            .bind(now)
            .bind(id)
            .execute(&mut **tx)
            .await?;
            Ok(false)
        }
        None => {
            sqlx::query(
                "INSERT INTO entries (feed_id, guid, title, url, author, content, summary,
                 published, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(feed_id)
            .bind(&entry.guid)
            .bind(&entry.title)
            .bind(&entry.url)
            .bind(&entry.author)
            .bind(&entry.content)
            .bind(&entry.summary)
            .bind(entry.published)
            .bind(now)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            Ok(true)
        }
    }
}
