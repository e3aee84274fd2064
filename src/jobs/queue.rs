use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::Task;

pub type TaskId = u64;

/// Point-in-time view of the queue backend.
///
/// Eventually consistent with job rows: a task may already have finished its
/// storage writes while still being listed as running, and the other way round.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub queued: Vec<(TaskId, Task)>,
    pub running: Vec<(TaskId, Task)>,
}

impl QueueSnapshot {
    /// Whether any queued task, or any running task other than `except`,
    /// belongs to `job_id`.
    pub fn has_pending_for(&self, job_id: i64, except: Option<TaskId>) -> bool {
        let belongs = |task: &Task| task.job_id() == Some(job_id);
        self.queued.iter().any(|(_, task)| belongs(task))
            || self
                .running
                .iter()
                .any(|(id, task)| Some(*id) != except && belongs(task))
    }
}

/// Port to the background task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<TaskId>;

    /// Acknowledge a task as finished. Idempotent.
    async fn complete(&self, task_id: TaskId) -> Result<()>;

    async fn snapshot(&self) -> Result<QueueSnapshot>;
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<(TaskId, Task)>,
    running: BTreeMap<TaskId, Task>,
}

/// In-process FIFO queue. [`MemoryQueue::take`] moves a task into the
/// running set, where it stays until [`TaskQueue::complete`] is called.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    next_id: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn take(&self) -> Option<(TaskId, Task)> {
        let mut state = self.state.lock().await;
        let (id, task) = state.queued.pop_front()?;
        state.running.insert(id, task.clone());
        Some((id, task))
    }

    /// Nothing queued and nothing running.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.queued.is_empty() && state.running.is_empty()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: Task) -> Result<TaskId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(task_id = id, ?task, "Enqueued task");
        self.state.lock().await.queued.push_back((id, task));
        Ok(id)
    }

    async fn complete(&self, task_id: TaskId) -> Result<()> {
        self.state.lock().await.running.remove(&task_id);
        Ok(())
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let state = self.state.lock().await;
        Ok(QueueSnapshot {
            queued: state.queued.iter().cloned().collect(),
            running: state
                .running
                .iter()
                .map(|(id, task)| (*id, task.clone()))
                .collect(),
        })
    }
}
