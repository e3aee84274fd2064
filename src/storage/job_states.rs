use anyhow::{bail, Result};

use super::schema::Database;
use super::types::{JobKind, JobState, JobStateRow, JobStatus};

const JOB_COLUMNS: &str =
    "id, user_id, kind, state, total, processed, feed_id, filename, created_at, updated_at";

impl Database {
    // ========================================================================
    // Job State Lifecycle
    // ========================================================================

    /// Create a RUNNING job row.
    ///
    /// For single-instance kinds (import, export) every previous row of that
    /// kind for the user is deleted in the same transaction and returned, so the
    /// caller can clean up artifacts the old rows referenced.
    pub async fn insert_running_job(
        &self,
        user_id: i64,
        kind: JobKind,
        total: Option<i64>,
    ) -> Result<(JobState, Vec<JobState>)> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let superseded: Vec<JobStateRow> = if kind.is_single_instance() {
            sqlx::query_as(&format!(
                "DELETE FROM job_states WHERE user_id = ? AND kind = ? RETURNING {JOB_COLUMNS}"
            ))
            .bind(user_id)
            .bind(kind.as_str())
            .fetch_all(&mut *tx)
            .await?
        } else {
            Vec::new()
        };

        let row: JobStateRow = sqlx::query_as(&format!(
            "INSERT INTO job_states (user_id, kind, state, total, processed, created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?) RETURNING {JOB_COLUMNS}"
        ))
        .bind(user_id)
        .bind(kind.as_str())
        .bind(JobStatus::Running.as_str())
        .bind(total)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let superseded = superseded
            .into_iter()
            .map(JobStateRow::into_state)
            .collect::<Result<Vec<_>>>()?;
        Ok((row.into_state()?, superseded))
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<JobState>> {
        let row: Option<JobStateRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM job_states WHERE id = ?"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(JobStateRow::into_state).transpose()
    }

    /// Most recent job of a kind for a user.
    pub async fn latest_job(&self, user_id: i64, kind: JobKind) -> Result<Option<JobState>> {
        let row: Option<JobStateRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM job_states WHERE user_id = ? AND kind = ?
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobStateRow::into_state).transpose()
    }

    /// All jobs of a kind for a user, oldest first.
    pub async fn list_jobs(&self, user_id: i64, kind: JobKind) -> Result<Vec<JobState>> {
        let rows: Vec<JobStateRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM job_states WHERE user_id = ? AND kind = ? ORDER BY id"
        ))
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobStateRow::into_state).collect()
    }

    /// Delete a job owned by the user. Returns the deleted row, if any.
    pub async fn delete_job(&self, user_id: i64, job_id: i64) -> Result<Option<JobState>> {
        let row: Option<JobStateRow> = sqlx::query_as(&format!(
            "DELETE FROM job_states WHERE id = ? AND user_id = ? RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobStateRow::into_state).transpose()
    }

    // ========================================================================
    // Mutations (workers only)
    // ========================================================================

    /// Set the number of units of a RUNNING job. Returns false if the job is
    /// gone or already terminal.
    pub async fn set_job_total(&self, job_id: i64, total: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job_states SET total = ?, updated_at = ? WHERE id = ? AND state = 'RUNNING'",
        )
        .bind(total)
        .bind(chrono::Utc::now().timestamp())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically add one to `processed`, only while the job is RUNNING.
    ///
    /// Returns the new `(processed, total)` or `None` if the job no longer
    /// exists or is terminal. Concurrent callers never lose an increment: the
    /// read-modify-write happens inside a single UPDATE statement.
    pub async fn increment_job_processed(&self, job_id: i64) -> Result<Option<(i64, Option<i64>)>> {
        let row: Option<(i64, Option<i64>)> = sqlx::query_as(
            "UPDATE job_states SET processed = processed + 1, updated_at = ?
             WHERE id = ? AND state = 'RUNNING'
             RETURNING processed, total",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Move a RUNNING job to a terminal status.
    ///
    /// The UPDATE is conditional on the current state, so when several workers
    /// race to finish the same job exactly one of them gets `true` back.
    pub async fn finish_job(&self, job_id: i64, status: JobStatus) -> Result<bool> {
        if !JobStatus::Running.can_transition_to(status) {
            bail!("Illegal job transition RUNNING -> {status}");
        }
        let result = sqlx::query(
            "UPDATE job_states SET state = ?, updated_at = ? WHERE id = ? AND state = 'RUNNING'",
        )
        .bind(status.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_job_feed(&self, job_id: i64, feed_id: i64) -> Result<()> {
        sqlx::query("UPDATE job_states SET feed_id = ?, updated_at = ? WHERE id = ?")
            .bind(feed_id)
            .bind(chrono::Utc::now().timestamp())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_filename(&self, job_id: i64, filename: &str) -> Result<()> {
        sqlx::query("UPDATE job_states SET filename = ?, updated_at = ? WHERE id = ?")
            .bind(filename)
            .bind(chrono::Utc::now().timestamp())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
