use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use super::queue::{MemoryQueue, TaskQueue};
use super::workers::Workers;
use super::Task;
use crate::schedule::{feed_id_from_schedule_name, MemoryScheduleBackend};

/// Executes tasks from a [`MemoryQueue`] on up to `concurrency` tokio tasks.
#[derive(Clone)]
pub struct Runner {
    queue: Arc<MemoryQueue>,
    workers: Workers,
    concurrency: usize,
}

impl Runner {
    pub fn new(queue: Arc<MemoryQueue>, workers: Workers, concurrency: usize) -> Self {
        Self {
            queue,
            workers,
            concurrency: concurrency.max(1),
        }
    }

    /// Run tasks until the queue is empty and nothing is in flight, including
    /// tasks enqueued by the tasks themselves. Returns how many ran.
    pub async fn drain(&self) -> usize {
        let mut in_flight = JoinSet::new();
        let mut executed = 0;

        loop {
            while in_flight.len() < self.concurrency {
                let Some((task_id, task)) = self.queue.take().await else {
                    break;
                };
                let workers = self.workers.clone();
                let queue = self.queue.clone();
                in_flight.spawn(async move {
                    workers.execute(task_id, task).await;
                    if let Err(e) = queue.complete(task_id).await {
                        tracing::warn!(task_id, error = %e, "Failed to acknowledge task");
                    }
                });
            }

            match in_flight.join_next().await {
                None => break,
                Some(Ok(())) => executed += 1,
                Some(Err(e)) => tracing::error!(error = %e, "Task panicked"),
            }
        }

        executed
    }

    /// Long-running loop: every `tick`, enqueue an update for each due feed
    /// schedule and drain the queue. Returns when `shutdown` resolves.
    pub async fn run(
        &self,
        schedules: Arc<MemoryScheduleBackend>,
        tick: Duration,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down worker loop");
                    break;
                }
                _ = interval.tick() => {
                    let due = self.enqueue_due(&schedules).await;
                    let executed = self.drain().await;
                    if due > 0 || executed > 0 {
                        tracing::debug!(due, executed, "Worker tick");
                    }
                }
            }
        }
    }

    async fn enqueue_due(&self, schedules: &MemoryScheduleBackend) -> usize {
        let mut enqueued = 0;
        for name in schedules.due(Instant::now()).await {
            let Some(feed_id) = feed_id_from_schedule_name(&name) else {
                tracing::warn!(schedule = %name, "Ignoring unknown schedule");
                continue;
            };
            match self.queue.enqueue(Task::UpdateFeed { feed_id }).await {
                Ok(_) => enqueued += 1,
                Err(e) => tracing::warn!(feed_id, error = %e, "Failed to enqueue feed update"),
            }
        }
        enqueued
    }
}
