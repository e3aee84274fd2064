use anyhow::Context;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::blob::{BlobStore, OPML_EXPORTS, OPML_IMPORTS};
use super::notify::CompletionNotifier;
use super::queue::{TaskId, TaskQueue};
use super::tracker::JobTracker;
use super::{JobError, JobLink, Task};
use crate::config::Config;
use crate::feed::{export_opml, parse_opml, ExportHead, FetchError, FetchOutcome, Fetcher, OpmlError};
use crate::schedule::{ScheduleBackend, Scheduler};
use crate::storage::{Database, Feed, Folder, JobKind, JobState, JobStatus};
use crate::util::{url_variants, validate_url};

/// Name of the export artifact in the `opml_exports` namespace.
pub const EXPORT_FILENAME: &str = "feedmill_export.opml";

/// Executes tasks and exposes the request-side operations that create them.
///
/// Cheap to clone; every clone shares the same database pool, HTTP client and
/// ports.
#[derive(Clone)]
pub struct Workers {
    db: Database,
    fetcher: Fetcher,
    scheduler: Scheduler,
    tracker: JobTracker,
    queue: Arc<dyn TaskQueue>,
    blobs: Arc<dyn BlobStore>,
    allow_private_hosts: bool,
    default_interval_secs: u64,
    concurrency: usize,
}

impl Workers {
    pub fn new(
        db: Database,
        config: &Config,
        fetcher: Fetcher,
        schedules: Arc<dyn ScheduleBackend>,
        queue: Arc<dyn TaskQueue>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Self {
        let scheduler = Scheduler::new(db.clone(), schedules, config.schedule.clone());
        let tracker = JobTracker::new(db.clone(), queue.clone(), blobs.clone(), notifier);
        Self {
            db,
            fetcher,
            scheduler,
            tracker,
            queue,
            blobs,
            allow_private_hosts: config.fetch.allow_private_hosts,
            default_interval_secs: config.schedule.default_interval_secs,
            concurrency: config.workers.concurrency.max(1),
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ========================================================================
    // Request Side
    // ========================================================================

    /// Subscribe a user to one URL in the background.
    pub async fn start_subscribe(
        &self,
        user_id: i64,
        url: &str,
        folder_id: Option<i64>,
    ) -> Result<JobState, JobError> {
        let job = self.tracker.start(user_id, JobKind::Subscribe, None).await?;
        self.queue
            .enqueue(Task::Subscribe {
                user_id,
                url: url.trim().to_string(),
                folder_id,
                link: JobLink::Single(job.id),
            })
            .await?;
        Ok(job)
    }

    /// Subscribe a user to many URLs as one job. Duplicate URLs, including
    /// equivalent spellings, are counted once.
    pub async fn start_bulk_subscribe(
        &self,
        user_id: i64,
        urls: &[String],
        folder_id: Option<i64>,
    ) -> Result<JobState, JobError> {
        let mut seen = HashSet::new();
        let urls: Vec<&str> = urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty() && first_sighting(&mut seen, u))
            .collect();

        let job = self
            .tracker
            .start(user_id, JobKind::BulkSubscribe, Some(urls.len() as i64))
            .await?;
        for url in urls {
            self.queue
                .enqueue(Task::Subscribe {
                    user_id,
                    url: url.to_string(),
                    folder_id,
                    link: JobLink::Bulk(job.id),
                })
                .await?;
        }
        // Nothing to wait for when the list was empty
        self.tracker.converge(job.id, None).await?;
        Ok(job)
    }

    /// Import an OPML file previously saved in the `opml_imports` namespace.
    pub async fn start_import(&self, user_id: i64, filename: &str) -> Result<JobState, JobError> {
        let job = self.tracker.start(user_id, JobKind::OpmlImport, None).await?;
        self.queue
            .enqueue(Task::ImportOpml {
                user_id,
                job_id: job.id,
                filename: filename.to_string(),
            })
            .await?;
        Ok(job)
    }

    pub async fn start_export(&self, user_id: i64) -> Result<JobState, JobError> {
        let job = self.tracker.start(user_id, JobKind::OpmlExport, None).await?;
        self.queue
            .enqueue(Task::ExportOpml {
                user_id,
                job_id: job.id,
            })
            .await?;
        Ok(job)
    }

    /// Refresh one of the user's feeds in the background.
    pub async fn start_refresh(&self, user_id: i64, feed_id: i64) -> Result<JobState, JobError> {
        if !self.db.is_subscribed(user_id, feed_id).await? {
            return Err(JobError::FeedNotFound(feed_id));
        }
        let job = self.tracker.start(user_id, JobKind::RefreshFeed, None).await?;
        self.db.set_job_feed(job.id, feed_id).await?;
        self.queue
            .enqueue(Task::RefreshFeed {
                user_id,
                feed_id,
                job_id: job.id,
            })
            .await?;
        Ok(JobState {
            feed_id: Some(feed_id),
            ..job
        })
    }

    /// The user's latest OPML export.
    pub async fn get_export(&self, user_id: i64) -> Result<Vec<u8>, JobError> {
        let filename = self
            .db
            .latest_job(user_id, JobKind::OpmlExport)
            .await?
            .and_then(|job| job.filename)
            .ok_or(JobError::ExportNotFound)?;
        self.blobs
            .read(user_id, OPML_EXPORTS, &filename)
            .await?
            .ok_or(JobError::ExportNotFound)
    }

    /// Remove a subscription and everything that hangs off it.
    ///
    /// The feed leaves the user's folder, a folder left empty is deleted, and a
    /// feed nobody subscribes to any more is deleted and unscheduled.
    pub async fn unsubscribe(&self, user_id: i64, feed_id: i64) -> Result<(), JobError> {
        if !self.db.remove_subscription(user_id, feed_id).await? {
            return Err(JobError::FeedNotFound(feed_id));
        }
        tracing::info!(user_id, feed_id, "Unsubscribed");

        for folder_id in self.db.remove_feed_from_user_folders(user_id, feed_id).await? {
            self.db.delete_folder_if_empty(folder_id).await?;
        }

        if self.db.count_subscribers(feed_id).await? == 0 {
            tracing::info!(feed_id, "Deleting feed without subscribers");
            self.db.delete_feed(feed_id).await?;
            self.scheduler.unschedule_feed_updates(feed_id).await?;
        }
        Ok(())
    }

    /// Create a folder and move one of the user's feeds into it.
    ///
    /// Fails with [`JobError::FolderAlreadyExists`] if the user already has a
    /// folder with that title.
    pub async fn add_feed_to_new_folder(
        &self,
        user_id: i64,
        feed_id: i64,
        title: &str,
    ) -> Result<Folder, JobError> {
        if !self.db.is_subscribed(user_id, feed_id).await? {
            return Err(JobError::FeedNotFound(feed_id));
        }
        let folder = self
            .db
            .create_folder(user_id, title)
            .await?
            .ok_or_else(|| JobError::FolderAlreadyExists(title.trim().to_string()))?;
        self.file_feed(&folder, feed_id).await?;
        Ok(folder)
    }

    /// Fetch every available feed, at most `workers.concurrency` at a time.
    ///
    /// Results are returned in completion order.
    pub async fn refresh_all(&self) -> anyhow::Result<Vec<(i64, Result<FetchOutcome, FetchError>)>> {
        let feeds = self.db.list_available_feeds().await?;
        let total = feeds.len();

        let results: Vec<_> = stream::iter(feeds)
            .map(|feed| async move {
                let result = self.fetcher.fetch(&self.db, &feed, false).await;
                if let Err(ref e) = result {
                    tracing::warn!(feed_id = feed.id, url = %feed.fetch_url, error = %e, "Refresh failed");
                }
                (feed.id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        tracing::info!(total, failed, "Refreshed all feeds");
        Ok(results)
    }

    // ========================================================================
    // Task Execution
    // ========================================================================

    /// Run one task. Failures are logged and recorded on the task's job; they
    /// never propagate to the runner.
    pub async fn execute(&self, task_id: TaskId, task: Task) {
        let name = task.name();
        let result = match task {
            Task::UpdateFeed { feed_id } => self.update_feed(feed_id).await,
            Task::RefreshFeed {
                user_id,
                feed_id,
                job_id,
            } => self.refresh_feed(user_id, feed_id, job_id).await,
            Task::Subscribe {
                user_id,
                url,
                folder_id,
                link,
            } => self.subscribe_unit(task_id, user_id, &url, folder_id, link).await,
            Task::ImportOpml {
                user_id,
                job_id,
                filename,
            } => self.import_opml(task_id, user_id, job_id, &filename).await,
            Task::ExportOpml { user_id, job_id } => self.export_opml(user_id, job_id).await,
        };
        if let Err(e) = result {
            tracing::error!(task_id, task = name, error = %e, "Task failed");
        }
    }

    /// Scheduled poll. Adapts the interval: new entries poll sooner, anything
    /// else (including 304) polls later.
    async fn update_feed(&self, feed_id: i64) -> anyhow::Result<()> {
        let feed = match self.db.get_feed(feed_id).await? {
            Some(feed) if feed.available => feed,
            _ => {
                tracing::info!(feed_id, "Feed gone or unavailable, unscheduling");
                self.scheduler.unschedule_feed_updates(feed_id).await?;
                return Ok(());
            }
        };

        match self.fetcher.fetch(&self.db, &feed, false).await {
            Ok(FetchOutcome::Gone) => self.scheduler.unschedule_feed_updates(feed_id).await?,
            Ok(outcome) if outcome.has_new_entries() => {
                self.scheduler.decrement_interval(&feed).await?;
            }
            Ok(_) => {
                self.scheduler.increment_interval(&feed).await?;
            }
            Err(e) => {
                tracing::warn!(feed_id, url = %feed.fetch_url, error = %e, "Scheduled update failed");
            }
        }
        Ok(())
    }

    async fn refresh_feed(&self, user_id: i64, feed_id: i64, job_id: i64) -> anyhow::Result<()> {
        if !self.is_running(job_id).await? {
            return Ok(());
        }

        let status = match self.db.get_feed(feed_id).await? {
            None => {
                tracing::warn!(user_id, feed_id, "Refresh requested for missing feed");
                JobStatus::Error
            }
            Some(feed) => match self.fetcher.fetch(&self.db, &feed, false).await {
                Ok(FetchOutcome::Gone) => JobStatus::Error,
                Ok(_) => JobStatus::Success,
                Err(e) => {
                    tracing::warn!(user_id, feed_id, error = %e, "Feed refresh failed");
                    JobStatus::Error
                }
            },
        };
        self.tracker.finish(job_id, status).await?;
        Ok(())
    }

    async fn subscribe_unit(
        &self,
        task_id: TaskId,
        user_id: i64,
        url: &str,
        folder_id: Option<i64>,
        link: JobLink,
    ) -> anyhow::Result<()> {
        if !self.is_running(link.job_id()).await? {
            return Ok(());
        }

        let result = self.subscribe_one(user_id, url, folder_id).await;
        if let Err(ref e) = result {
            tracing::warn!(user_id, url, error = %e, "Subscribe failed");
        }

        match link {
            JobLink::Single(job_id) => {
                let status = match result {
                    Ok(Some(feed)) => {
                        self.db.set_job_feed(job_id, feed.id).await?;
                        JobStatus::Success
                    }
                    Ok(None) | Err(_) => JobStatus::Error,
                };
                self.tracker.finish(job_id, status).await?;
            }
            JobLink::Bulk(job_id) => {
                self.tracker.unit_processed(job_id, task_id).await?;
            }
        }
        Ok(())
    }

    /// Subscribe the user to `url`, fetching it first if the feed is new.
    ///
    /// `Ok(None)` means there was nothing to do: the folder is not the user's,
    /// or the new feed was deleted while it was being fetched.
    async fn subscribe_one(
        &self,
        user_id: i64,
        url: &str,
        folder_id: Option<i64>,
    ) -> Result<Option<Feed>, JobError> {
        if self.db.get_user(user_id).await?.is_none() {
            return Err(JobError::UserNotFound(user_id));
        }
        let folder = match folder_id {
            Some(id) => match self.db.get_folder(id).await? {
                Some(folder) if folder.user_id == user_id => Some(folder),
                _ => {
                    tracing::warn!(user_id, folder_id = id, "Folder not owned by user, skipping");
                    return Ok(None);
                }
            },
            None => None,
        };

        let feed = match self.db.find_feed_by_url(url, None).await? {
            Some(existing) => existing,
            None => match self.fetch_new_feed(url).await? {
                Some(feed) => feed,
                None => return Ok(None),
            },
        };

        if self.db.subscribe(user_id, feed.id).await? {
            tracing::info!(user_id, feed_id = feed.id, "Subscribed");
        }
        if let Some(folder) = folder {
            self.file_feed(&folder, feed.id).await?;
        }
        Ok(Some(feed))
    }

    /// Create a placeholder for `url`, fetch it with autodiscovery, and
    /// schedule the result. A placeholder whose first fetch fails is deleted.
    async fn fetch_new_feed(&self, url: &str) -> Result<Option<Feed>, JobError> {
        validate_url(url, self.allow_private_hosts)?;

        let placeholder = match self.db.create_feed(url, self.default_interval_secs).await {
            Ok(feed) => feed,
            // Another unit created it between the lookup and the insert
            Err(e) => match self.db.find_feed_by_url(url, None).await? {
                Some(existing) => return Ok(Some(existing)),
                None => return Err(e.into()),
            },
        };

        let outcome = match self.fetcher.fetch(&self.db, &placeholder, true).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.db.delete_feed(placeholder.id).await?;
                return Err(e.into());
            }
        };
        let Some(feed) = outcome.feed().cloned() else {
            return Ok(None);
        };

        if feed.id == placeholder.id {
            self.scheduler.schedule_feed_updates(feed.id).await?;
        }
        Ok(Some(feed))
    }

    async fn import_opml(
        &self,
        task_id: TaskId,
        user_id: i64,
        job_id: i64,
        filename: &str,
    ) -> anyhow::Result<()> {
        let result = if self.is_running(job_id).await? {
            self.run_import(task_id, user_id, job_id, filename).await
        } else {
            Ok(())
        };

        if let Err(e) = self.blobs.delete(user_id, OPML_IMPORTS, filename).await {
            tracing::warn!(job_id, filename, error = %e, "Failed to delete import file");
        }

        if let Err(e) = result {
            tracing::warn!(job_id, user_id, error = %e, "OPML import failed");
            self.tracker.finish(job_id, JobStatus::Error).await?;
        }
        Ok(())
    }

    async fn run_import(
        &self,
        task_id: TaskId,
        user_id: i64,
        job_id: i64,
        filename: &str,
    ) -> Result<(), JobError> {
        if self.db.get_user(user_id).await?.is_none() {
            return Err(JobError::UserNotFound(user_id));
        }
        let bytes = self
            .blobs
            .read(user_id, OPML_IMPORTS, filename)
            .await?
            .ok_or_else(|| JobError::ImportFileMissing(filename.to_string()))?;
        let content = std::str::from_utf8(&bytes).map_err(OpmlError::from)?;
        let outlines = parse_opml(content)?;

        // First occurrence of a URL (in any of its spellings) wins
        let mut seen = HashSet::new();
        let outlines: Vec<_> = outlines
            .into_iter()
            .filter(|o| first_sighting(&mut seen, &o.xml_url))
            .collect();

        if !self.db.set_job_total(job_id, outlines.len() as i64).await? {
            return Ok(());
        }
        tracing::info!(job_id, user_id, feeds = outlines.len(), "Importing OPML");

        // Each folder is created once, before any unit can race to create it
        let mut folders: HashMap<String, Folder> = HashMap::new();
        for title in outlines.iter().filter_map(|o| o.folder.as_deref()) {
            let key = title.trim().to_lowercase();
            if !folders.contains_key(&key) {
                let (folder, _) = self.db.find_or_create_folder(user_id, title).await?;
                folders.insert(key, folder);
            }
        }

        for outline in outlines {
            let folder = outline
                .folder
                .as_deref()
                .and_then(|t| folders.get(&t.trim().to_lowercase()));

            if let Some(feed) = self.db.find_feed_by_url(&outline.xml_url, None).await? {
                self.db.subscribe(user_id, feed.id).await?;
                if let Some(folder) = folder {
                    self.file_feed(folder, feed.id).await?;
                }
                if !self.tracker.count_processed(job_id).await? {
                    // Dismissed or failed meanwhile
                    return Ok(());
                }
                continue;
            }

            self.queue
                .enqueue(Task::Subscribe {
                    user_id,
                    url: outline.xml_url,
                    folder_id: folder.map(|f| f.id),
                    link: JobLink::Bulk(job_id),
                })
                .await?;
        }

        // Units that finished while this task was still running saw it in the
        // queue and left the job alone
        self.queue.complete(task_id).await?;
        self.tracker.converge(job_id, Some(task_id)).await?;
        Ok(())
    }

    async fn export_opml(&self, user_id: i64, job_id: i64) -> anyhow::Result<()> {
        if !self.is_running(job_id).await? {
            return Ok(());
        }

        let status = match self.write_export(user_id, job_id).await {
            Ok(()) => JobStatus::Success,
            Err(e) => {
                tracing::warn!(job_id, user_id, error = %e, "OPML export failed");
                JobStatus::Error
            }
        };
        self.tracker.finish(job_id, status).await?;
        Ok(())
    }

    async fn write_export(&self, user_id: i64, job_id: i64) -> Result<(), JobError> {
        let user = self
            .db
            .get_user(user_id)
            .await?
            .ok_or(JobError::UserNotFound(user_id))?;
        let unfiled = self.db.get_unfiled_feeds(user_id).await?;
        let folders = self.db.get_folders_with_feeds(user_id).await?;

        let head = ExportHead {
            owner_name: &user.name,
            owner_email: &user.email,
            date_created: chrono::Utc::now(),
        };
        let xml = export_opml(&head, &unfiled, &folders)?;
        self.blobs
            .save(user_id, OPML_EXPORTS, EXPORT_FILENAME, xml.as_bytes())
            .await
            .context("Failed to save OPML export")?;
        self.db.set_job_filename(job_id, EXPORT_FILENAME).await?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn is_running(&self, job_id: i64) -> anyhow::Result<bool> {
        let running = self
            .db
            .get_job(job_id)
            .await?
            .is_some_and(|job| job.status == JobStatus::Running);
        if !running {
            tracing::debug!(job_id, "Job no longer running, skipping task");
        }
        Ok(running)
    }

    /// Move a feed into `folder`, deleting any folder it leaves empty.
    async fn file_feed(&self, folder: &Folder, feed_id: i64) -> anyhow::Result<()> {
        for old_folder in self.db.add_feed_to_folder(folder.id, feed_id).await? {
            self.db.delete_folder_if_empty(old_folder).await?;
        }
        Ok(())
    }
}

/// Whether `url` is new to `seen`. Every equivalent spelling of a URL counts
/// as already seen once one of them has been.
fn first_sighting(seen: &mut HashSet<String>, url: &str) -> bool {
    let variants = url_variants(url);
    if variants.iter().any(|v| seen.contains(v)) {
        return false;
    }
    seen.extend(variants);
    true
}
