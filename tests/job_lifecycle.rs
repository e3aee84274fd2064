//! Integration tests for background jobs: subscribe, bulk subscribe, OPML
//! import/export, refresh and schedule maintenance.
//!
//! Each test gets its own file-backed SQLite database (WAL mode, several
//! pooled connections) and its own wiremock server, and drives the queue to
//! completion with `Runner::drain`.

use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedmill::config::Config;
use feedmill::feed::Fetcher;
use feedmill::jobs::{
    BlobStore, FsBlobStore, JobError, JobLink, MemoryQueue, RecordingNotifier, Runner, Task,
    TaskQueue, Workers, OPML_IMPORTS,
};
use feedmill::schedule::{schedule_name, MemoryScheduleBackend, ScheduleBackend};
use feedmill::storage::{Database, JobKind, JobStatus};

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    server: MockServer,
    db: Database,
    queue: Arc<MemoryQueue>,
    blobs: Arc<FsBlobStore>,
    schedules: Arc<MemoryScheduleBackend>,
    notifier: Arc<RecordingNotifier>,
    workers: Workers,
    runner: Runner,
    user_id: i64,
}

impl Harness {
    async fn new() -> Self {
        let root = scratch_dir();
        let db_path = root.join("feedmill.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        let user = db.create_user("ada@example.com", "Ada").await.unwrap();

        let mut config = Config::default();
        config.fetch.timeout_secs = 5;
        config.fetch.allow_private_hosts = true;
        config.workers.concurrency = 4;

        let queue = Arc::new(MemoryQueue::new());
        let blobs = Arc::new(FsBlobStore::new(root.join("blobs")));
        let schedules = Arc::new(MemoryScheduleBackend::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let workers = Workers::new(
            db.clone(),
            &config,
            Fetcher::new(&config.fetch).unwrap(),
            schedules.clone(),
            queue.clone(),
            blobs.clone(),
            notifier.clone(),
        );
        let runner = Runner::new(queue.clone(), workers.clone(), config.workers.concurrency);

        Harness {
            server: MockServer::start().await,
            db,
            queue,
            blobs,
            schedules,
            notifier,
            workers,
            runner,
            user_id: user.id,
        }
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.server.uri(), route)
    }

    async fn serve_feed(&self, route: &str, title: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(title)))
            .mount(&self.server)
            .await;
    }

    async fn state(&self, kind: JobKind, job_id: i64) -> feedmill::storage::JobState {
        self.workers
            .tracker()
            .get_state(self.user_id, kind, Some(job_id))
            .await
            .unwrap()
    }
}

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("feedmill_jobs_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn rss(title: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>{title}</title>
    <link>https://example.com/</link>
    <item><guid>1</guid><title>First post</title></item>
</channel></rss>"#
    )
}

// ============================================================================
// OPML Import
// ============================================================================

fn subscriptions_opml(h: &Harness) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="1.0">
  <head><title>Subscriptions</title></head>
  <body>
    <outline text="Tech" title="Tech">
      <outline type="rss" text="A" xmlUrl="{a}"/>
      <outline type="rss" text="B" xmlUrl="{b}"/>
    </outline>
    <outline text="News">
      <outline type="rss" text="C" xmlUrl="{c}"/>
    </outline>
    <outline type="rss" text="D" xmlUrl="{d}"/>
    <outline text="tech">
      <outline type="rss" text="A again" xmlUrl="{a}"/>
    </outline>
  </body>
</opml>"#,
        a = h.url("/a.xml"),
        b = h.url("/b.xml"),
        c = h.url("/c.xml"),
        d = h.url("/d.xml"),
    )
}

#[tokio::test]
async fn test_import_subscribes_every_feed_once_and_notifies_once() {
    let h = Harness::new().await;
    for (route, title) in [("/a.xml", "A"), ("/b.xml", "B"), ("/c.xml", "C"), ("/d.xml", "D")] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(title)))
            .expect(1)
            .mount(&h.server)
            .await;
    }

    h.blobs
        .save(h.user_id, OPML_IMPORTS, "subs.opml", subscriptions_opml(&h).as_bytes())
        .await
        .unwrap();
    let job = h.workers.start_import(h.user_id, "subs.opml").await.unwrap();
    assert_eq!(job.status, JobStatus::Running);

    h.runner.drain().await;

    let state = h.state(JobKind::OpmlImport, job.id).await;
    assert_eq!(state.status, JobStatus::Success);
    assert_eq!(state.total, Some(4));
    assert_eq!(state.processed, 4);
    assert_eq!(h.notifier.finished().len(), 1);
    assert!(h.queue.is_idle().await);

    let mut folders: Vec<String> = h
        .db
        .list_folders(h.user_id)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.title)
        .collect();
    folders.sort();
    assert_eq!(folders, vec!["News".to_string(), "Tech".to_string()]);

    let feeds = h.db.get_subscribed_feeds(h.user_id).await.unwrap();
    assert_eq!(feeds.len(), 4);
    let a = feeds.iter().find(|f| f.title == "A").unwrap();
    let d = feeds.iter().find(|f| f.title == "D").unwrap();
    assert_eq!(
        h.db.folder_for_feed(h.user_id, a.id).await.unwrap().map(|f| f.title),
        Some("Tech".to_string())
    );
    assert!(h.db.folder_for_feed(h.user_id, d.id).await.unwrap().is_none());

    assert_eq!(h.schedules.len().await, 4);
    assert!(!h.blobs.exists(h.user_id, OPML_IMPORTS, "subs.opml").await.unwrap());
}

#[tokio::test]
async fn test_reimport_of_known_feeds_completes_without_fetching() {
    let h = Harness::new().await;
    for (route, title) in [("/a.xml", "A"), ("/b.xml", "B"), ("/c.xml", "C"), ("/d.xml", "D")] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(title)))
            .expect(1)
            .mount(&h.server)
            .await;
    }
    let opml = subscriptions_opml(&h);

    h.blobs
        .save(h.user_id, OPML_IMPORTS, "subs.opml", opml.as_bytes())
        .await
        .unwrap();
    let first = h.workers.start_import(h.user_id, "subs.opml").await.unwrap();
    h.runner.drain().await;

    h.blobs
        .save(h.user_id, OPML_IMPORTS, "subs.opml", opml.as_bytes())
        .await
        .unwrap();
    let second = h.workers.start_import(h.user_id, "subs.opml").await.unwrap();
    h.runner.drain().await;

    // The second import replaced the first
    let states = h
        .workers
        .tracker()
        .list_states(h.user_id, JobKind::OpmlImport)
        .await
        .unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].id, second.id);
    assert!(h.db.get_job(first.id).await.unwrap().is_none());

    let state = h.state(JobKind::OpmlImport, second.id).await;
    assert_eq!((state.status, state.total, state.processed), (JobStatus::Success, Some(4), 4));
    assert_eq!(h.notifier.finished().len(), 2);
    assert_eq!(h.db.list_feeds().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_import_of_malformed_opml_fails_and_removes_file() {
    let h = Harness::new().await;
    h.blobs
        .save(h.user_id, OPML_IMPORTS, "broken.opml", br#"<opml><body><outline xmlUrl="x"></body>"#)
        .await
        .unwrap();

    let job = h.workers.start_import(h.user_id, "broken.opml").await.unwrap();
    h.runner.drain().await;

    let state = h.state(JobKind::OpmlImport, job.id).await;
    assert_eq!(state.status, JobStatus::Error);
    assert!(h.notifier.finished().is_empty());
    assert!(!h.blobs.exists(h.user_id, OPML_IMPORTS, "broken.opml").await.unwrap());
}

#[tokio::test]
async fn test_import_with_missing_file_fails() {
    let h = Harness::new().await;
    let job = h.workers.start_import(h.user_id, "never-uploaded.opml").await.unwrap();
    h.runner.drain().await;

    assert_eq!(h.state(JobKind::OpmlImport, job.id).await.status, JobStatus::Error);
}

#[tokio::test]
async fn test_empty_import_succeeds_immediately() {
    let h = Harness::new().await;
    h.blobs
        .save(
            h.user_id,
            OPML_IMPORTS,
            "empty.opml",
            br#"<opml version="1.0"><head/><body></body></opml>"#,
        )
        .await
        .unwrap();

    let job = h.workers.start_import(h.user_id, "empty.opml").await.unwrap();
    h.runner.drain().await;

    let state = h.state(JobKind::OpmlImport, job.id).await;
    assert_eq!((state.status, state.total, state.processed), (JobStatus::Success, Some(0), 0));
    assert_eq!(h.notifier.finished().len(), 1);
}

#[tokio::test]
async fn test_import_counts_equivalent_urls_once() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/a.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss("A")))
        .expect(1)
        .mount(&h.server)
        .await;

    let opml = format!(
        r#"<opml version="1.0"><body>
    <outline type="rss" text="A" xmlUrl="{a}"/>
    <outline type="rss" text="A with slash" xmlUrl="{a}/"/>
</body></opml>"#,
        a = h.url("/a.xml"),
    );
    h.blobs
        .save(h.user_id, OPML_IMPORTS, "dupes.opml", opml.as_bytes())
        .await
        .unwrap();

    let job = h.workers.start_import(h.user_id, "dupes.opml").await.unwrap();
    h.runner.drain().await;

    let state = h.state(JobKind::OpmlImport, job.id).await;
    assert_eq!((state.status, state.total, state.processed), (JobStatus::Success, Some(1), 1));
    assert_eq!(h.db.list_feeds().await.unwrap().len(), 1);
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_bulk_subscribe_counts_failures_as_processed() {
    let h = Harness::new().await;
    h.serve_feed("/a.xml", "A").await;
    Mock::given(method("GET"))
        .and(path("/missing.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.server)
        .await;

    let urls = vec![h.url("/a.xml"), h.url("/missing.xml"), h.url("/a.xml")];
    let job = h
        .workers
        .start_bulk_subscribe(h.user_id, &urls, None)
        .await
        .unwrap();
    assert_eq!(job.total, Some(2));

    h.runner.drain().await;

    let state = h.state(JobKind::BulkSubscribe, job.id).await;
    assert_eq!((state.status, state.processed), (JobStatus::Success, 2));
    assert_eq!(h.notifier.finished().len(), 1);

    // The failed URL's placeholder is gone
    let feeds = h.db.list_feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].title, "A");
    assert!(h.db.is_subscribed(h.user_id, feeds[0].id).await.unwrap());
}

#[tokio::test]
async fn test_empty_bulk_subscribe_succeeds_without_units() {
    let h = Harness::new().await;
    let job = h
        .workers
        .start_bulk_subscribe(h.user_id, &[], None)
        .await
        .unwrap();

    let state = h.state(JobKind::BulkSubscribe, job.id).await;
    assert_eq!(state.status, JobStatus::Success);
    assert_eq!(h.runner.drain().await, 0);
    assert_eq!(h.notifier.finished().len(), 1);
}

#[tokio::test]
async fn test_subscribe_via_autodiscovery_records_feed() {
    let h = Harness::new().await;
    h.serve_feed("/a.xml", "A").await;
    Mock::given(method("GET"))
        .and(path("/blog"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><head><link rel="alternate" type="application/rss+xml" href="/a.xml"></head></html>"#,
        ))
        .mount(&h.server)
        .await;

    let job = h
        .workers
        .start_subscribe(h.user_id, &h.url("/blog"), None)
        .await
        .unwrap();
    h.runner.drain().await;

    let state = h.state(JobKind::Subscribe, job.id).await;
    assert_eq!(state.status, JobStatus::Success);
    let feed = h.db.get_feed(state.feed_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(feed.fetch_url, h.url("/a.xml"));
    assert!(h.db.is_subscribed(h.user_id, feed.id).await.unwrap());
    assert!(h.schedules.lookup(&schedule_name(feed.id)).await.unwrap().is_some());

    // Single jobs do not notify
    assert!(h.notifier.finished().is_empty());
}

#[tokio::test]
async fn test_subscribe_via_page_of_known_feed_survives_failed_refetch() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/a.xml"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/blog"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><head><link rel="alternate" type="application/rss+xml" href="/a.xml"></head></html>"#,
        ))
        .mount(&h.server)
        .await;
    let known = h.db.create_feed(&h.url("/a.xml"), 3600).await.unwrap();

    let job = h
        .workers
        .start_subscribe(h.user_id, &h.url("/blog"), None)
        .await
        .unwrap();
    h.runner.drain().await;

    let state = h.state(JobKind::Subscribe, job.id).await;
    assert_eq!((state.status, state.feed_id), (JobStatus::Success, Some(known.id)));
    assert!(h.db.is_subscribed(h.user_id, known.id).await.unwrap());
    assert_eq!(h.db.list_feeds().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_subscribe_to_invalid_url_fails_job() {
    let h = Harness::new().await;
    let job = h
        .workers
        .start_subscribe(h.user_id, "ftp://example.com/feed", None)
        .await
        .unwrap();
    h.runner.drain().await;

    assert_eq!(h.state(JobKind::Subscribe, job.id).await.status, JobStatus::Error);
    assert!(h.db.list_feeds().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_last_units_complete_job_exactly_once() {
    let h = Harness::new().await;
    let tracker = h.workers.tracker().clone();
    let job = tracker
        .start(h.user_id, JobKind::BulkSubscribe, Some(2))
        .await
        .unwrap();
    for n in 0..2 {
        h.queue
            .enqueue(Task::Subscribe {
                user_id: h.user_id,
                url: format!("https://example.com/{n}.xml"),
                folder_id: None,
                link: JobLink::Bulk(job.id),
            })
            .await
            .unwrap();
    }
    let (first, _) = h.queue.take().await.unwrap();
    let (second, _) = h.queue.take().await.unwrap();

    let t1 = tracker.clone();
    let t2 = tracker.clone();
    let job_id = job.id;
    let a = tokio::spawn(async move { t1.unit_processed(job_id, first).await.unwrap() });
    let b = tokio::spawn(async move { t2.unit_processed(job_id, second).await.unwrap() });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert!(a ^ b, "exactly one unit should complete the job");
    let state = h.state(JobKind::BulkSubscribe, job.id).await;
    assert_eq!((state.status, state.processed), (JobStatus::Success, 2));
    assert_eq!(h.notifier.finished().len(), 1);
    assert!(h.queue.is_idle().await);
}

// ============================================================================
// Unsubscribe and Folders
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_cleans_up_folder_feed_and_schedule() {
    let h = Harness::new().await;
    h.serve_feed("/a.xml", "A").await;
    let folder = h.db.create_folder(h.user_id, "Reading").await.unwrap().unwrap();

    let job = h
        .workers
        .start_subscribe(h.user_id, &h.url("/a.xml"), Some(folder.id))
        .await
        .unwrap();
    h.runner.drain().await;
    let feed_id = h.state(JobKind::Subscribe, job.id).await.feed_id.unwrap();
    assert_eq!(
        h.db.folder_for_feed(h.user_id, feed_id).await.unwrap(),
        Some(folder)
    );

    h.workers.unsubscribe(h.user_id, feed_id).await.unwrap();

    assert!(h.db.list_folders(h.user_id).await.unwrap().is_empty());
    assert!(h.db.get_feed(feed_id).await.unwrap().is_none());
    assert!(h.schedules.is_empty().await);

    let err = h.workers.unsubscribe(h.user_id, feed_id).await.unwrap_err();
    assert!(matches!(err, JobError::FeedNotFound(id) if id == feed_id));
}

#[tokio::test]
async fn test_unsubscribe_keeps_feed_with_other_subscribers() {
    let h = Harness::new().await;
    let other = h.db.create_user("grace@example.com", "Grace").await.unwrap();
    let feed = h.db.create_feed(&h.url("/a.xml"), 3600).await.unwrap();
    h.db.subscribe(h.user_id, feed.id).await.unwrap();
    h.db.subscribe(other.id, feed.id).await.unwrap();

    h.workers.unsubscribe(h.user_id, feed.id).await.unwrap();

    assert!(h.db.get_feed(feed.id).await.unwrap().is_some());
    assert!(h.db.is_subscribed(other.id, feed.id).await.unwrap());
}

#[tokio::test]
async fn test_add_feed_to_new_folder_rejects_duplicate_title() {
    let h = Harness::new().await;
    let feed = h.db.create_feed(&h.url("/a.xml"), 3600).await.unwrap();
    h.db.subscribe(h.user_id, feed.id).await.unwrap();

    let first = h
        .workers
        .add_feed_to_new_folder(h.user_id, feed.id, "Later")
        .await
        .unwrap();
    let err = h
        .workers
        .add_feed_to_new_folder(h.user_id, feed.id, "later")
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::FolderAlreadyExists(_)));

    // Moving into a second folder deletes the first once it is empty
    let second = h
        .workers
        .add_feed_to_new_folder(h.user_id, feed.id, "Elsewhere")
        .await
        .unwrap();
    assert_eq!(h.db.list_folders(h.user_id).await.unwrap(), vec![second]);
    assert!(h.db.get_folder(first.id).await.unwrap().is_none());
}

// ============================================================================
// OPML Export
// ============================================================================

#[tokio::test]
async fn test_export_writes_opml_with_folders() {
    let h = Harness::new().await;
    assert!(matches!(
        h.workers.get_export(h.user_id).await,
        Err(JobError::ExportNotFound)
    ));

    let folder = h.db.create_folder(h.user_id, "Reading").await.unwrap().unwrap();
    let filed = h.db.create_feed(&h.url("/a.xml"), 3600).await.unwrap();
    let unfiled = h.db.create_feed(&h.url("/b.xml"), 3600).await.unwrap();
    h.db.subscribe(h.user_id, filed.id).await.unwrap();
    h.db.subscribe(h.user_id, unfiled.id).await.unwrap();
    h.db.add_feed_to_folder(folder.id, filed.id).await.unwrap();

    let job = h.workers.start_export(h.user_id).await.unwrap();
    h.runner.drain().await;
    assert_eq!(h.state(JobKind::OpmlExport, job.id).await.status, JobStatus::Success);

    let xml = String::from_utf8(h.workers.get_export(h.user_id).await.unwrap()).unwrap();
    assert!(xml.contains("<ownerEmail>ada@example.com</ownerEmail>"));
    assert!(xml.contains(r#"title="Reading""#));
    assert!(xml.contains(&format!(r#"xmlUrl="{}""#, h.url("/a.xml"))));
    assert!(xml.contains(&format!(r#"xmlUrl="{}""#, h.url("/b.xml"))));

    // A fresh export replaces the previous job
    let again = h.workers.start_export(h.user_id).await.unwrap();
    h.runner.drain().await;
    let states = h
        .workers
        .tracker()
        .list_states(h.user_id, JobKind::OpmlExport)
        .await
        .unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].id, again.id);
    assert!(h.workers.get_export(h.user_id).await.is_ok());
}

// ============================================================================
// Refresh and Scheduling
// ============================================================================

#[tokio::test]
async fn test_refresh_requires_subscription() {
    let h = Harness::new().await;
    h.serve_feed("/a.xml", "A").await;
    let feed = h.db.create_feed(&h.url("/a.xml"), 3600).await.unwrap();

    let err = h.workers.start_refresh(h.user_id, feed.id).await.unwrap_err();
    assert!(matches!(err, JobError::FeedNotFound(_)));

    h.db.subscribe(h.user_id, feed.id).await.unwrap();
    let job = h.workers.start_refresh(h.user_id, feed.id).await.unwrap();
    assert_eq!(job.feed_id, Some(feed.id));
    h.runner.drain().await;

    assert_eq!(h.state(JobKind::RefreshFeed, job.id).await.status, JobStatus::Success);
    assert_eq!(h.db.get_feed(feed.id).await.unwrap().unwrap().title, "A");
}

#[tokio::test]
async fn test_scheduled_update_without_new_entries_backs_off() {
    let h = Harness::new().await;
    h.serve_feed("/a.xml", "A").await;
    let job = h
        .workers
        .start_subscribe(h.user_id, &h.url("/a.xml"), None)
        .await
        .unwrap();
    h.runner.drain().await;
    let feed_id = h.state(JobKind::Subscribe, job.id).await.feed_id.unwrap();

    h.queue.enqueue(Task::UpdateFeed { feed_id }).await.unwrap();
    h.runner.drain().await;

    let feed = h.db.get_feed(feed_id).await.unwrap().unwrap();
    assert_eq!(feed.fetch_interval_secs, 3960);
    let entry = h.schedules.lookup(&schedule_name(feed_id)).await.unwrap().unwrap();
    assert_eq!(entry.every.as_secs(), 3960);
}

#[tokio::test]
async fn test_scheduled_update_of_deleted_feed_unschedules() {
    let h = Harness::new().await;
    let feed = h.db.create_feed(&h.url("/a.xml"), 3600).await.unwrap();
    h.workers.scheduler().schedule_feed_updates(feed.id).await.unwrap();
    h.db.delete_feed(feed.id).await.unwrap();

    h.queue.enqueue(Task::UpdateFeed { feed_id: feed.id }).await.unwrap();
    h.runner.drain().await;

    assert!(h.schedules.is_empty().await);
}

#[tokio::test]
async fn test_reconcile_rebuilds_only_missing_schedules() {
    let h = Harness::new().await;
    let scheduled = h.db.create_feed(&h.url("/a.xml"), 3600).await.unwrap();
    h.db.create_feed(&h.url("/b.xml"), 3600).await.unwrap();
    h.db.create_feed(&h.url("/c.xml"), 3600).await.unwrap();
    h.workers
        .scheduler()
        .schedule_feed_updates(scheduled.id)
        .await
        .unwrap();

    assert_eq!(h.workers.scheduler().reconcile_schedules().await.unwrap(), 2);
    assert_eq!(h.schedules.len().await, 3);
    assert_eq!(h.workers.scheduler().reconcile_schedules().await.unwrap(), 0);
}

#[tokio::test]
async fn test_refresh_all_reports_each_feed() {
    let h = Harness::new().await;
    h.serve_feed("/a.xml", "A").await;
    Mock::given(method("GET"))
        .and(path("/down.xml"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;
    let ok = h.db.create_feed(&h.url("/a.xml"), 3600).await.unwrap();
    let down = h.db.create_feed(&h.url("/down.xml"), 3600).await.unwrap();

    let mut results = h.workers.refresh_all().await.unwrap();
    results.sort_by_key(|(id, _)| *id);

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, ok.id);
    assert!(results[0].1.is_ok());
    assert_eq!(results[1].0, down.id);
    assert!(results[1].1.is_err());
}
