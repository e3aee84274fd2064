use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with operator-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The database is locked by another process. Stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as
/// these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Feeds and Entries
// ============================================================================

/// A polled feed.
///
/// `fetch_url` is the address actually requested and is unique across the table.
/// `url` is the human-facing site URL taken from the feed's own metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub fetch_url: String,
    pub url: Option<String>,
    pub title: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetch_interval_secs: i64,
    /// Unix seconds of the last successful fetch.
    pub last_fetched: Option<i64>,
    pub available: bool,
}

/// A stored entry. `(feed_id, guid)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub published: Option<i64>,
}

/// An entry extracted from a feed document, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    pub guid: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub published: Option<i64>,
}

/// Feed-level fields written after a successful (non-304) fetch.
///
/// `etag` and `last_modified` are stored exactly as given: `None` clears the
/// stored validator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedUpdate {
    pub title: Option<String>,
    pub url: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Outcome of merging one fetched document into storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

// ============================================================================
// Users and Folders
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
}

/// A user-owned folder. Titles are unique per user, ignoring case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Folder {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
}

/// A folder together with the feeds filed in it, as needed for OPML export.
#[derive(Debug, Clone)]
pub struct FolderWithFeeds {
    pub folder: Folder,
    pub feeds: Vec<Feed>,
}

// ============================================================================
// Job States
// ============================================================================

/// Kind of asynchronous operation tracked by a [`JobState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Subscribe,
    BulkSubscribe,
    OpmlImport,
    OpmlExport,
    RefreshFeed,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Subscribe,
        JobKind::BulkSubscribe,
        JobKind::OpmlImport,
        JobKind::OpmlExport,
        JobKind::RefreshFeed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Subscribe => "subscribe",
            JobKind::BulkSubscribe => "bulk_subscribe",
            JobKind::OpmlImport => "opml_import",
            JobKind::OpmlExport => "opml_export",
            JobKind::RefreshFeed => "refresh_feed",
        }
    }

    /// Import and export keep at most one row per user; starting a new one
    /// replaces the previous.
    pub fn is_single_instance(self) -> bool {
        matches!(self, JobKind::OpmlImport | JobKind::OpmlExport)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown job kind: {s}"))
    }
}

/// Lifecycle of a job: `None → Running → {Success | Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    None,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::None => "NONE",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    /// The only legal transitions. Anything else requires starting a new job.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::None, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(JobStatus::None),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "ERROR" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Persisted progress and outcome of one asynchronous operation.
///
/// A state synthesised for a single-instance kind with no stored row has
/// `id == 0` and status [`JobStatus::None`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobState {
    pub id: i64,
    pub user_id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub total: Option<i64>,
    pub processed: i64,
    pub feed_id: Option<i64>,
    pub filename: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobState {
    pub fn none(user_id: i64, kind: JobKind) -> Self {
        Self {
            id: 0,
            user_id,
            kind,
            status: JobStatus::None,
            total: None,
            processed: 0,
            feed_id: None,
            filename: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// Internal row type for job_states queries. Converted via `into_state()`.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobStateRow {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub state: String,
    pub total: Option<i64>,
    pub processed: i64,
    pub feed_id: Option<i64>,
    pub filename: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobStateRow {
    pub(crate) fn into_state(self) -> anyhow::Result<JobState> {
        Ok(JobState {
            id: self.id,
            user_id: self.user_id,
            kind: self.kind.parse().map_err(anyhow::Error::msg)?,
            status: self.state.parse().map_err(anyhow::Error::msg)?,
            total: self.total,
            processed: self.processed,
            feed_id: self.feed_id,
            filename: self.filename,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
