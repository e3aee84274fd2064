use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use feedmill::config::Config;
use feedmill::feed::Fetcher;
use feedmill::jobs::{
    BlobStore, FsBlobStore, LogNotifier, MemoryQueue, Runner, Workers, OPML_IMPORTS,
};
use feedmill::schedule::MemoryScheduleBackend;
use feedmill::storage::{Database, DatabaseError, JobKind, JobState};

/// SEC-010: Largest OPML file accepted for import (5 MB).
const MAX_IMPORT_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "feedmill",
    version,
    about = "Feed acquisition engine: conditional fetching, autodiscovery and adaptive polling"
)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, value_name = "FILE", global = true, default_value = "feedmill.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import subscriptions from an OPML file
    Import {
        #[arg(long)]
        user: i64,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Export subscriptions as OPML (to stdout unless --out is given)
    Export {
        #[arg(long)]
        user: i64,
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Subscribe to one or more feed URLs
    Subscribe {
        #[arg(long)]
        user: i64,
        /// Folder to file the new subscriptions in
        #[arg(long)]
        folder: Option<i64>,
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },
    /// Fetch one feed, or every available feed
    Refresh {
        #[arg(long)]
        feed: Option<i64>,
    },
    /// Rebuild missing feed schedules
    Reconcile,
    /// Show a user's job states as JSON
    Status {
        #[arg(long)]
        user: i64,
        /// subscribe, bulk_subscribe, opml_import, opml_export or refresh_feed
        #[arg(long)]
        kind: JobKind,
    },
    /// Run the scheduler and worker loop until interrupted
    Run,
    /// Create a user
    AddUser {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
    },
}

/// Everything a command needs, wired from configuration.
struct App {
    config: Config,
    db: Database,
    fetcher: Fetcher,
    blobs: Arc<FsBlobStore>,
    schedules: Arc<MemoryScheduleBackend>,
    workers: Workers,
    runner: Runner,
}

impl App {
    async fn build(config: Config) -> Result<Self> {
        let db_path = config
            .database_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
        let db = match Database::open(db_path).await {
            Ok(db) => db,
            Err(DatabaseError::InstanceLocked) => {
                eprintln!("Error: the database is locked by another feedmill process.");
                std::process::exit(1);
            }
            Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
        };

        let fetcher = Fetcher::new(&config.fetch).context("Failed to build HTTP client")?;
        let blobs = Arc::new(FsBlobStore::new(&config.blob_dir));
        let schedules = Arc::new(MemoryScheduleBackend::new());
        let queue = Arc::new(MemoryQueue::new());
        let workers = Workers::new(
            db.clone(),
            &config,
            fetcher.clone(),
            schedules.clone(),
            queue.clone(),
            blobs.clone(),
            Arc::new(LogNotifier),
        );
        let runner = Runner::new(queue, workers.clone(), config.workers.concurrency);

        Ok(Self {
            config,
            db,
            fetcher,
            blobs,
            schedules,
            workers,
            runner,
        })
    }

    /// Drain the queue, then report the job's final state.
    async fn finish(&self, job: &JobState) -> Result<JobState> {
        self.runner.drain().await;
        self.workers
            .tracker()
            .get_state(job.user_id, job.kind, Some(job.id))
            .await
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// SEC-008: Resolve symlinks and accept only regular files of bounded size.
fn read_import_file(path: &Path) -> Result<(String, Vec<u8>)> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve import file: {}", path.display()))?;
    let metadata = std::fs::metadata(&canonical)?;
    if !metadata.is_file() {
        bail!("Import path must be a regular file");
    }
    if metadata.len() > MAX_IMPORT_SIZE {
        bail!(
            "Import file is {} bytes (max {} bytes)",
            metadata.len(),
            MAX_IMPORT_SIZE
        );
    }
    let filename = canonical
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("Import file name is not valid UTF-8"))?
        .to_string();
    let bytes = std::fs::read(&canonical)
        .with_context(|| format!("Failed to read import file: {}", canonical.display()))?;
    Ok((filename, bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    let ctx = App::build(config).await?;

    match args.command {
        Command::Import { user, file } => {
            let (filename, bytes) = read_import_file(&file)?;
            ctx.blobs
                .save(user, OPML_IMPORTS, &filename, &bytes)
                .await
                .context("Failed to store import file")?;
            let job = ctx.workers.start_import(user, &filename).await?;
            print_json(&ctx.finish(&job).await?)?;
        }
        Command::Export { user, out } => {
            let job = ctx.workers.start_export(user).await?;
            let state = ctx.finish(&job).await?;
            let xml = ctx.workers.get_export(user).await?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, &xml)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    print_json(&state)?;
                }
                None => print!("{}", String::from_utf8_lossy(&xml)),
            }
        }
        Command::Subscribe { user, folder, urls } => {
            let job = if let [url] = urls.as_slice() {
                ctx.workers.start_subscribe(user, url, folder).await?
            } else {
                ctx.workers.start_bulk_subscribe(user, &urls, folder).await?
            };
            print_json(&ctx.finish(&job).await?)?;
        }
        Command::Refresh { feed: Some(feed_id) } => {
            let feed = ctx
                .db
                .get_feed(feed_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Feed {feed_id} not found"))?;
            let outcome = ctx.fetcher.fetch(&ctx.db, &feed, false).await?;
            match outcome.feed() {
                Some(feed) => print_json(feed)?,
                None => println!("Feed {feed_id} was deleted during the refresh"),
            }
        }
        Command::Refresh { feed: None } => {
            let results = ctx.workers.refresh_all().await?;
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            println!("Refreshed {} feeds ({} failed)", results.len(), failed);
        }
        Command::Reconcile => {
            let rebuilt = ctx.workers.scheduler().reconcile_schedules().await?;
            println!("Rebuilt {rebuilt} feed schedules");
        }
        Command::Status { user, kind } => {
            let tracker = ctx.workers.tracker();
            let mut states = tracker.list_states(user, kind).await?;
            if states.is_empty() {
                states.push(tracker.get_state(user, kind, None).await?);
            }
            print_json(&states)?;
        }
        Command::Run => {
            // Schedules live in memory, so every start rebuilds them
            let rebuilt = ctx.workers.scheduler().reconcile_schedules().await?;
            tracing::info!(rebuilt, "Feed schedules restored");

            let tick = Duration::from_secs(ctx.config.schedule.tick_secs);
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };
            ctx.runner.run(ctx.schedules.clone(), tick, shutdown).await;
        }
        Command::AddUser { email, name } => {
            let user = ctx.db.create_user(&email, &name).await?;
            print_json(&user)?;
        }
    }

    Ok(())
}
