//! Configuration file parser for `feedmill.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning for each one so
//! that typos in section or key names do not go unnoticed.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. `":memory:"` keeps everything in memory.
    pub database_path: PathBuf,

    /// Root directory of the filesystem blob store (OPML uploads and exports).
    pub blob_dir: PathBuf,

    pub fetch: FetchConfig,
    pub schedule: ScheduleConfig,
    pub workers: WorkersConfig,
}

/// HTTP fetch settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-request timeout, connect through last body byte.
    pub timeout_secs: u64,
    /// SEC-003: Response bodies larger than this are rejected.
    pub max_body_bytes: usize,
    pub user_agent: String,
    /// Allow fetching loopback and private-network hosts. Off in production.
    pub allow_private_hosts: bool,
}

/// Polling cadence settings. All values are seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Interval assigned to newly created feeds.
    pub default_interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Upper bound of the random first-fire delay for a feed that was never fetched.
    pub initial_jitter_secs: u64,
    /// Upper bound of the random first-fire delay for a lost schedule whose next
    /// fire time has already passed.
    pub overdue_jitter_secs: u64,
    /// How often the `run` loop polls the schedule backend for due feeds.
    pub tick_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Maximum number of tasks executed at once.
    pub concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("feedmill.db"),
            blob_dir: PathBuf::from("blobs"),
            fetch: FetchConfig::default(),
            schedule: ScheduleConfig::default(),
            workers: WorkersConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: format!("feedmill/{}", env!("CARGO_PKG_VERSION")),
            allow_private_hosts: false,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: 3600,
            min_interval_secs: 900,
            max_interval_secs: 86_400,
            initial_jitter_secs: 3600,
            overdue_jitter_secs: 900,
            tick_secs: 30,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { concurrency: 10 }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ScheduleConfig {
    /// Clamp an interval into `[min_interval_secs, max_interval_secs]`.
    pub fn clamp(&self, secs: u64) -> u64 {
        secs.clamp(self.min_interval_secs, self.max_interval_secs)
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: &'static [(&'static str, &'static [&'static str])] = &[
        ("database_path", &[]),
        ("blob_dir", &[]),
        (
            "fetch",
            &["timeout_secs", "max_body_bytes", "user_agent", "allow_private_hosts"],
        ),
        (
            "schedule",
            &[
                "default_interval_secs",
                "min_interval_secs",
                "max_interval_secs",
                "initial_jitter_secs",
                "overdue_jitter_secs",
                "tick_secs",
            ],
        ),
        ("workers", &["concurrency"]),
    ];

    /// Load configuration from a TOML file and validate it.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            database = %config.database_path.display(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Reject settings the scheduler and worker pool cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.schedule;
        if s.min_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "schedule.min_interval_secs must be greater than 0".into(),
            ));
        }
        if s.min_interval_secs > s.max_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "schedule.min_interval_secs ({}) exceeds schedule.max_interval_secs ({})",
                s.min_interval_secs, s.max_interval_secs
            )));
        }
        if !(s.min_interval_secs..=s.max_interval_secs).contains(&s.default_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "schedule.default_interval_secs ({}) is outside [{}, {}]",
                s.default_interval_secs, s.min_interval_secs, s.max_interval_secs
            )));
        }
        if s.tick_secs == 0 {
            return Err(ConfigError::Invalid("schedule.tick_secs must be greater than 0".into()));
        }
        if self.workers.concurrency == 0 {
            return Err(ConfigError::Invalid("workers.concurrency must be greater than 0".into()));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch.timeout_secs must be greater than 0".into()));
        }
        Ok(())
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        let Some((_, section_keys)) = Config::KNOWN_KEYS.iter().find(|(k, _)| *k == key.as_str()) else {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        };
        if let Some(table) = value.as_table() {
            for sub in table.keys() {
                if !section_keys.contains(&sub.as_str()) {
                    tracing::warn!(key = %format!("{key}.{sub}"), "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
