use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;

use crate::storage::JobState;

/// One-time side effect fired when a multi-unit job reaches SUCCESS.
///
/// Called at most once per job: only the worker whose conditional
/// RUNNING → SUCCESS update took effect invokes it.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn job_finished(&self, job: &JobState) -> Result<()>;
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn job_finished(&self, job: &JobState) -> Result<()> {
        tracing::info!(
            job_id = job.id,
            user_id = job.user_id,
            kind = %job.kind,
            processed = job.processed,
            total = ?job.total,
            "Job finished"
        );
        Ok(())
    }
}

/// Notifier that remembers every job it was called for.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    finished: Mutex<Vec<JobState>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished(&self) -> Vec<JobState> {
        self.finished
            .lock()
            .map(|jobs| jobs.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn job_finished(&self, job: &JobState) -> Result<()> {
        let mut finished = self
            .finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        finished.push(job.clone());
        Ok(())
    }
}
