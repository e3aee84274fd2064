use futures::StreamExt;
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use super::discovery::{discover, Discovery};
use super::parser::parse_feed;
use crate::config::FetchConfig;
use crate::storage::{Database, Feed, FeedUpdate, MergeStats};
use crate::util::validate_url;

const MAX_REDIRECTS: usize = 5;

/// Errors that can occur while fetching a feed.
///
/// Transport failures are returned as-is; nothing in here retries. The next
/// scheduled fire of the feed is the retry.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request plus body read exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// SEC-003: Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// 2xx response with nothing but whitespace in the body
    #[error("Empty response body")]
    EmptyResponse,
    /// Non-success status other than 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The body is not RSS or Atom and autodiscovery was not allowed
    #[error("Response is not a feed document")]
    NotAFeed,
    /// The body is not a feed and carries no usable feed link
    #[error("No feed link found in HTML page")]
    Autodiscovery,
    /// SEC-001: fetch_url failed validation
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl FetchError {
    fn database(e: anyhow::Error) -> Self {
        FetchError::Database(format!("{e:#}"))
    }
}

/// What a completed fetch did to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 304 Not Modified. Nothing was written.
    NotModified(Feed),
    /// The feed document was merged. `feed` is the row as stored afterwards,
    /// which after autodiscovery may be a different feed than the one requested.
    Updated { feed: Feed, stats: MergeStats },
    /// Autodiscovery led to a feed that already existed (the placeholder is
    /// gone) but refetching it failed. The feed is returned as stored.
    Known(Feed),
    /// The feed was deleted while the fetch was in flight; the result was discarded.
    Gone,
}

impl FetchOutcome {
    pub fn feed(&self) -> Option<&Feed> {
        match self {
            FetchOutcome::NotModified(feed)
            | FetchOutcome::Known(feed)
            | FetchOutcome::Updated { feed, .. } => Some(feed),
            FetchOutcome::Gone => None,
        }
    }

    /// Whether this fetch stored entries that were not there before.
    pub fn has_new_entries(&self) -> bool {
        matches!(self, FetchOutcome::Updated { stats, .. } if stats.inserted > 0)
    }
}

enum Attempt {
    Done(FetchOutcome),
    NotAFeed(Vec<u8>),
}

struct RawResponse {
    status: StatusCode,
    etag: Option<String>,
    last_modified: Option<String>,
    body: Vec<u8>,
}

/// HTTP side of feed acquisition: conditional GET, body limits and the single
/// autodiscovery hop.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_body_bytes: usize,
    allow_private_hosts: bool,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_client(config)?,
            timeout: config.timeout(),
            max_body_bytes: config.max_body_bytes,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    /// Fetch `feed` and merge the result into storage.
    ///
    /// # Behavior
    ///
    /// - Sends `If-None-Match` / `If-Modified-Since` from the stored validators
    /// - 304 leaves the feed and its entries untouched
    /// - A parsed feed overwrites title, site URL and both validators (a header
    ///   missing from this response clears the stored value)
    /// - A body that is not a feed is handed to autodiscovery when
    ///   `allow_autodiscovery` is set; the discovered feed is fetched once more
    ///   with autodiscovery off, so there is at most one hop
    ///
    /// # Errors
    ///
    /// - [`FetchError::EmptyResponse`] - 2xx with a blank body
    /// - [`FetchError::HttpStatus`] - any other non-2xx status
    /// - [`FetchError::NotAFeed`] - not a feed and no hop left
    /// - [`FetchError::Autodiscovery`] - not a feed and no feed link in the page
    /// - [`FetchError::Network`] / [`FetchError::Timeout`] - transport failures
    pub async fn fetch(
        &self,
        db: &Database,
        feed: &Feed,
        allow_autodiscovery: bool,
    ) -> Result<FetchOutcome, FetchError> {
        let body = match self.fetch_once(db, feed).await? {
            Attempt::Done(outcome) => return Ok(outcome),
            Attempt::NotAFeed(body) => body,
        };

        if !allow_autodiscovery {
            tracing::warn!(feed_id = feed.id, url = %feed.fetch_url, "Response is not a feed");
            return Err(FetchError::NotAFeed);
        }

        let html = String::from_utf8_lossy(&body);
        let (discovered, known) = match discover(db, feed, &html)
            .await
            .map_err(FetchError::database)?
        {
            Discovery::Updated(feed) => (feed, false),
            Discovery::Existing(feed) => (feed, true),
            Discovery::NoFeedLink => return Err(FetchError::Autodiscovery),
            Discovery::FeedGone => return Ok(FetchOutcome::Gone),
        };

        let result = match self.fetch_once(db, &discovered).await {
            Ok(Attempt::Done(outcome)) => Ok(outcome),
            Ok(Attempt::NotAFeed(_)) => {
                tracing::warn!(
                    feed_id = discovered.id,
                    url = %discovered.fetch_url,
                    "Autodiscovered link is not a feed either"
                );
                Err(FetchError::NotAFeed)
            }
            Err(e) => Err(e),
        };

        match result {
            // The placeholder is already gone, so the caller must still get
            // the existing feed back
            Err(e) if known => {
                tracing::warn!(
                    feed_id = discovered.id,
                    url = %discovered.fetch_url,
                    error = %e,
                    "Refetching already known feed failed"
                );
                Ok(FetchOutcome::Known(discovered))
            }
            other => other,
        }
    }

    async fn fetch_once(&self, db: &Database, feed: &Feed) -> Result<Attempt, FetchError> {
        let response = tokio::time::timeout(self.timeout, self.request(feed))
            .await
            .map_err(|_| FetchError::Timeout)??;

        if response.status == StatusCode::NOT_MODIFIED {
            tracing::debug!(feed_id = feed.id, "Feed not modified");
            return Ok(Attempt::Done(FetchOutcome::NotModified(feed.clone())));
        }
        if !response.status.is_success() {
            return Err(FetchError::HttpStatus(response.status.as_u16()));
        }
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::EmptyResponse);
        }

        let document = match parse_feed(&response.body) {
            Ok(document) => document,
            Err(e) => {
                tracing::debug!(feed_id = feed.id, error = %e, "Body did not parse as a feed");
                return Ok(Attempt::NotAFeed(response.body));
            }
        };
        if document.skipped > 0 {
            tracing::warn!(
                feed_id = feed.id,
                skipped = document.skipped,
                "Feed entries without identity skipped"
            );
        }

        let update = FeedUpdate {
            title: document.title,
            url: document.url,
            etag: response.etag,
            last_modified: response.last_modified,
        };
        let Some(stats) = db
            .merge_fetched_feed(feed.id, &update, &document.entries)
            .await
            .map_err(FetchError::database)?
        else {
            return Ok(Attempt::Done(FetchOutcome::Gone));
        };

        tracing::info!(
            feed_id = feed.id,
            inserted = stats.inserted,
            updated = stats.updated,
            skipped = stats.skipped,
            "Feed updated"
        );

        let outcome = match db.get_feed(feed.id).await.map_err(FetchError::database)? {
            Some(feed) => FetchOutcome::Updated { feed, stats },
            None => FetchOutcome::Gone,
        };
        Ok(Attempt::Done(outcome))
    }

    async fn request(&self, feed: &Feed) -> Result<RawResponse, FetchError> {
        // SEC-001: Never let a stored URL reach loopback or private ranges
        let url = validate_url(&feed.fetch_url, self.allow_private_hosts)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        let mut request = self.client.get(url);
        if let Some(etag) = feed.etag.as_deref().filter(|v| !v.is_empty()) {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = feed.last_modified.as_deref().filter(|v| !v.is_empty()) {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await?;
        let status = response.status();
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);

        let body = if status.is_success() {
            read_limited_bytes(response, self.max_body_bytes).await?
        } else {
            Vec::new()
        };

        Ok(RawResponse {
            status,
            etag,
            last_modified,
            body,
        })
    }
}

/// HTTP client shared by every fetch.
pub fn build_client(config: &FetchConfig) -> Result<reqwest::Client, FetchError> {
    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .redirect(redirect_policy())
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()?;
    Ok(client)
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("Too many redirects (max {MAX_REDIRECTS})"));
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
