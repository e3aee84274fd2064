//! Per-feed polling schedules.
//!
//! Every available feed owns exactly one recurring schedule named
//! `update_feed_{id}` in an external [`ScheduleBackend`]. The [`Scheduler`]
//! creates, removes and rebuilds those schedules and adapts each feed's cadence
//! by ±10% within the configured bounds.

mod memory;

pub use memory::MemoryScheduleBackend;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ScheduleConfig;
use crate::storage::{Database, Feed};

const SCHEDULE_PREFIX: &str = "update_feed_";

/// A recurring schedule as the backend knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub name: String,
    pub every: Duration,
    /// Delay before the first fire. `None` means one full `every`.
    pub first_in: Option<Duration>,
}

/// Port to whatever actually fires recurring jobs.
#[async_trait]
pub trait ScheduleBackend: Send + Sync {
    /// Create or overwrite the schedule called `name`.
    async fn schedule(&self, name: &str, every: Duration, first_in: Option<Duration>) -> Result<()>;

    /// Remove a schedule. Returns whether one existed.
    async fn unschedule(&self, name: &str) -> Result<bool>;

    async fn lookup(&self, name: &str) -> Result<Option<ScheduleEntry>>;
}

/// Deterministic schedule name for a feed.
pub fn schedule_name(feed_id: i64) -> String {
    format!("{SCHEDULE_PREFIX}{feed_id}")
}

/// Inverse of [`schedule_name`].
pub fn feed_id_from_schedule_name(name: &str) -> Option<i64> {
    name.strip_prefix(SCHEDULE_PREFIX)?.parse().ok()
}

/// Scale an interval and clamp it into the configured bounds.
fn scaled_interval(current: u64, factor: f64, config: &ScheduleConfig) -> u64 {
    let scaled = (current as f64 * factor).round() as u64;
    config.clamp(scaled)
}

/// Uniform delay in `[0, upper_secs)`; zero when the bound is zero.
fn random_delay(upper_secs: u64) -> Duration {
    if upper_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rand::thread_rng().gen_range(0..upper_secs))
}

#[derive(Clone)]
pub struct Scheduler {
    db: Database,
    backend: Arc<dyn ScheduleBackend>,
    config: ScheduleConfig,
}

impl Scheduler {
    pub fn new(db: Database, backend: Arc<dyn ScheduleBackend>, config: ScheduleConfig) -> Self {
        Self {
            db,
            backend,
            config,
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Create (or overwrite) the feed's schedule, first firing after a random
    /// delay so that feeds added together do not all poll at once.
    ///
    /// Returns false without scheduling anything if the feed does not exist.
    pub async fn schedule_feed_updates(&self, feed_id: i64) -> Result<bool> {
        let Some(feed) = self.db.get_feed(feed_id).await? else {
            tracing::warn!(feed_id, "Not scheduling updates for missing feed");
            return Ok(false);
        };
        let first_in = random_delay(self.config.initial_jitter_secs);
        self.backend
            .schedule(&schedule_name(feed_id), self.every(&feed), Some(first_in))
            .await?;
        tracing::debug!(feed_id, first_in_secs = first_in.as_secs(), "Scheduled feed updates");
        Ok(true)
    }

    pub async fn unschedule_feed_updates(&self, feed_id: i64) -> Result<()> {
        if self.backend.unschedule(&schedule_name(feed_id)).await? {
            tracing::debug!(feed_id, "Unscheduled feed updates");
        }
        Ok(())
    }

    /// Rebuild the schedule of every available feed that has lost it.
    ///
    /// The first fire is aimed at `last_fetched + interval`. Never-fetched
    /// feeds get a fresh initial jitter, feeds whose next fire is already in the
    /// past get the (shorter) overdue jitter. Returns how many were rebuilt.
    pub async fn reconcile_schedules(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut rebuilt = 0;

        for feed in self.db.list_available_feeds().await? {
            let name = schedule_name(feed.id);
            if self.backend.lookup(&name).await?.is_some() {
                continue;
            }

            let first_in = match feed.last_fetched {
                None => random_delay(self.config.initial_jitter_secs),
                Some(last_fetched) => {
                    let remaining = last_fetched + feed.fetch_interval_secs - now;
                    if remaining < 0 {
                        random_delay(self.config.overdue_jitter_secs)
                    } else {
                        Duration::from_secs(remaining as u64)
                    }
                }
            };

            tracing::info!(
                feed_id = feed.id,
                first_in_secs = first_in.as_secs(),
                "Rebuilding missing feed schedule"
            );
            self.backend
                .schedule(&name, self.every(&feed), Some(first_in))
                .await?;
            rebuilt += 1;
        }

        Ok(rebuilt)
    }

    /// Poll 10% more often. Returns the new interval, or `None` if the feed
    /// was deleted meanwhile.
    pub async fn decrement_interval(&self, feed: &Feed) -> Result<Option<u64>> {
        self.rescale(feed, 0.9).await
    }

    /// Poll 10% less often. Returns the new interval, or `None` if the feed
    /// was deleted meanwhile.
    pub async fn increment_interval(&self, feed: &Feed) -> Result<Option<u64>> {
        self.rescale(feed, 1.1).await
    }

    async fn rescale(&self, feed: &Feed, factor: f64) -> Result<Option<u64>> {
        let current = feed.fetch_interval_secs.max(0) as u64;
        let interval = scaled_interval(current, factor, &self.config);

        if !self.db.set_feed_interval(feed.id, interval).await? {
            self.unschedule_feed_updates(feed.id).await?;
            return Ok(None);
        }

        let every = Duration::from_secs(interval);
        self.backend
            .schedule(&schedule_name(feed.id), every, Some(every))
            .await?;
        if interval != current {
            tracing::debug!(feed_id = feed.id, from = current, to = interval, "Feed interval changed");
        }
        Ok(Some(interval))
    }

    fn every(&self, feed: &Feed) -> Duration {
        Duration::from_secs(self.config.clamp(feed.fetch_interval_secs.max(0) as u64))
    }
}
