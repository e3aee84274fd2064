use anyhow::Result;
use std::sync::Arc;

use super::blob::{BlobStore, OPML_EXPORTS};
use super::notify::CompletionNotifier;
use super::queue::{TaskId, TaskQueue};
use crate::storage::{Database, JobKind, JobState, JobStatus};

/// Persists job states and decides when a multi-unit job is complete.
#[derive(Clone)]
pub struct JobTracker {
    db: Database,
    queue: Arc<dyn TaskQueue>,
    blobs: Arc<dyn BlobStore>,
    notifier: Arc<dyn CompletionNotifier>,
}

impl JobTracker {
    pub fn new(
        db: Database,
        queue: Arc<dyn TaskQueue>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Self {
        Self {
            db,
            queue,
            blobs,
            notifier,
        }
    }

    // ========================================================================
    // Read Surface
    // ========================================================================

    /// Current state of a job.
    ///
    /// With `job_id`, that job (if it is the user's and of this kind).
    /// Without, the user's latest job of the kind. Missing rows come back as a
    /// synthetic NONE state.
    pub async fn get_state(&self, user_id: i64, kind: JobKind, job_id: Option<i64>) -> Result<JobState> {
        let job = match job_id {
            Some(id) => self
                .db
                .get_job(id)
                .await?
                .filter(|job| job.user_id == user_id && job.kind == kind),
            None => self.db.latest_job(user_id, kind).await?,
        };
        Ok(job.unwrap_or_else(|| JobState::none(user_id, kind)))
    }

    pub async fn list_states(&self, user_id: i64, kind: JobKind) -> Result<Vec<JobState>> {
        self.db.list_jobs(user_id, kind).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a RUNNING job. For single-instance kinds the previous job is
    /// replaced, and a replaced export's artifact is deleted.
    pub async fn start(&self, user_id: i64, kind: JobKind, total: Option<i64>) -> Result<JobState> {
        let (job, superseded) = self.db.insert_running_job(user_id, kind, total).await?;
        for old in superseded {
            self.discard_artifact(&old).await;
        }
        tracing::info!(job_id = job.id, user_id, kind = %kind, ?total, "Job started");
        Ok(job)
    }

    /// Dismiss a job. Returns the removed state, if the user owned one.
    pub async fn delete_state(&self, user_id: i64, job_id: i64) -> Result<Option<JobState>> {
        let deleted = self.db.delete_job(user_id, job_id).await?;
        if let Some(ref job) = deleted {
            self.discard_artifact(job).await;
        }
        Ok(deleted)
    }

    /// Move a RUNNING job to `status`. Returns whether this call performed the
    /// transition. Every ERROR is logged here.
    pub async fn finish(&self, job_id: i64, status: JobStatus) -> Result<bool> {
        let performed = self.db.finish_job(job_id, status).await?;
        if performed && status == JobStatus::Error {
            tracing::warn!(job_id, "Job failed");
        } else if performed {
            tracing::info!(job_id, status = %status, "Job finished");
        }
        Ok(performed)
    }

    /// Count one unit of a RUNNING job as processed without running the
    /// convergence check. Returns false if the job is gone or terminal.
    pub async fn count_processed(&self, job_id: i64) -> Result<bool> {
        Ok(self.db.increment_job_processed(job_id).await?.is_some())
    }

    /// Report that the unit running as `task_id` is done.
    ///
    /// Increments the job's counter, acknowledges the task to the queue, then
    /// runs [`JobTracker::converge`]. Returns whether this unit completed the job.
    pub async fn unit_processed(&self, job_id: i64, task_id: TaskId) -> Result<bool> {
        let Some((processed, total)) = self.db.increment_job_processed(job_id).await? else {
            tracing::debug!(job_id, "Unit finished for a job that is no longer running");
            self.queue.complete(task_id).await?;
            return Ok(false);
        };
        tracing::debug!(job_id, processed, ?total, "Job unit processed");

        self.queue.complete(task_id).await?;
        self.converge(job_id, Some(task_id)).await
    }

    /// Finish the job with SUCCESS if every unit has been counted and the queue
    /// holds no other task of the job.
    ///
    /// `own_task` is the caller's task, already acknowledged, and is ignored in
    /// the snapshot in case the backend still lists it. When several callers get
    /// here at once, the conditional state update lets exactly one of them win;
    /// only the winner fires the notifier.
    pub async fn converge(&self, job_id: i64, own_task: Option<TaskId>) -> Result<bool> {
        let Some(job) = self.db.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        let Some(total) = job.total else {
            return Ok(false);
        };
        if job.processed < total {
            return Ok(false);
        }

        let snapshot = self.queue.snapshot().await?;
        if snapshot.has_pending_for(job_id, own_task) {
            tracing::debug!(job_id, "Counter complete but units still pending");
            return Ok(false);
        }

        if !self.finish(job_id, JobStatus::Success).await? {
            return Ok(false);
        }

        let job = self.db.get_job(job_id).await?.unwrap_or(JobState {
            status: JobStatus::Success,
            ..job
        });
        if let Err(e) = self.notifier.job_finished(&job).await {
            tracing::warn!(job_id, error = %e, "Completion notification failed");
        }
        Ok(true)
    }

    async fn discard_artifact(&self, job: &JobState) {
        if job.kind != JobKind::OpmlExport {
            return;
        }
        let Some(ref filename) = job.filename else {
            return;
        };
        if let Err(e) = self.blobs.delete(job.user_id, OPML_EXPORTS, filename).await {
            tracing::warn!(job_id = job.id, error = %e, "Failed to delete old export file");
        }
    }
}
