//! Background work and job-state tracking.
//!
//! Request-side operations on [`Workers`] create a RUNNING [`JobState`] row and
//! enqueue [`Task`]s; a [`Runner`] drains the queue and hands each task back to
//! [`Workers::execute`]. Multi-unit jobs (bulk subscribe, OPML import) have no
//! coordinator in memory: every unit reports to the [`JobTracker`], which
//! detects convergence from the stored counter plus a queue snapshot.
//!
//! [`JobState`]: crate::storage::JobState

mod blob;
mod notify;
mod queue;
mod runner;
mod tracker;
mod workers;

pub use blob::{BlobStore, FsBlobStore, OPML_EXPORTS, OPML_IMPORTS};
pub use notify::{CompletionNotifier, LogNotifier, RecordingNotifier};
pub use queue::{MemoryQueue, QueueSnapshot, TaskId, TaskQueue};
pub use runner::Runner;
pub use tracker::JobTracker;
pub use workers::{Workers, EXPORT_FILENAME};

use thiserror::Error;

use crate::feed::{FetchError, OpmlError};
use crate::util::UrlValidationError;

/// Which job a subscribe unit reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLink {
    /// The unit is the whole job; it finishes the job itself.
    Single(i64),
    /// The unit is one of many; it counts itself processed and runs the
    /// convergence check.
    Bulk(i64),
}

impl JobLink {
    pub fn job_id(self) -> i64 {
        match self {
            JobLink::Single(id) | JobLink::Bulk(id) => id,
        }
    }
}

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Scheduled poll of one feed
    UpdateFeed { feed_id: i64 },
    /// User-requested refresh of one feed
    RefreshFeed {
        user_id: i64,
        feed_id: i64,
        job_id: i64,
    },
    Subscribe {
        user_id: i64,
        url: String,
        folder_id: Option<i64>,
        link: JobLink,
    },
    ImportOpml {
        user_id: i64,
        job_id: i64,
        filename: String,
    },
    ExportOpml { user_id: i64, job_id: i64 },
}

impl Task {
    /// The job this task belongs to, if any. Convergence detection relies on
    /// this mapping to recognise a job's queued and running units.
    pub fn job_id(&self) -> Option<i64> {
        match self {
            Task::UpdateFeed { .. } => None,
            Task::RefreshFeed { job_id, .. }
            | Task::ImportOpml { job_id, .. }
            | Task::ExportOpml { job_id, .. } => Some(*job_id),
            Task::Subscribe { link, .. } => Some(link.job_id()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::UpdateFeed { .. } => "update_feed",
            Task::RefreshFeed { .. } => "refresh_feed",
            Task::Subscribe { .. } => "subscribe",
            Task::ImportOpml { .. } => "import_opml",
            Task::ExportOpml { .. } => "export_opml",
        }
    }
}

/// Errors surfaced by job handlers and request-side job operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("User {0} not found")]
    UserNotFound(i64),

    #[error("Feed {0} not found")]
    FeedNotFound(i64),

    #[error("Folder {0} not found")]
    FolderNotFound(i64),

    #[error("A folder titled \"{0}\" already exists")]
    FolderAlreadyExists(String),

    #[error("No OPML export available")]
    ExportNotFound,

    #[error("Import file \"{0}\" not found")]
    ImportFileMissing(String),

    #[error("Invalid OPML: {0}")]
    Opml(#[from] OpmlError),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
