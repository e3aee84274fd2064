use feed_rs::parser;
use sha2::{Digest, Sha256};

use crate::storage::ParsedEntry;
use crate::util::{strip_control_chars, unescape_html};

/// Metadata and entries extracted from one RSS/Atom document.
#[derive(Debug, Clone)]
pub struct FeedDocument {
    pub title: Option<String>,
    /// Site URL advertised by the feed (not the address it was fetched from).
    pub url: Option<String>,
    pub entries: Vec<ParsedEntry>,
    /// Entries dropped because they carried no id, link or title.
    pub skipped: usize,
}

/// Parse a response body as RSS or Atom.
///
/// Fails when the body is not a recognisable feed document, which callers
/// take as the signal to try HTML autodiscovery.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedDocument, parser::ParseFeedError> {
    // Entries without a source id get an empty one (feed-rs would invent a
    // random id), so generate_guid decides their identity.
    let feed = parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(bytes)?;

    let title = feed
        .title
        .map(|t| strip_control_chars(t.content.trim()).into_owned())
        .filter(|t| !t.is_empty());
    let url = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .map(|l| l.href.clone());

    let mut skipped = 0;
    let mut entries = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        let url = entry
            .links
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
            .or_else(|| entry.links.first())
            .map(|l| l.href.clone());
        let title = entry
            .title
            .map(|t| strip_control_chars(t.content.trim()).into_owned())
            .filter(|t| !t.is_empty());
        let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());

        let Some(guid) = generate_guid(&entry.id, url.as_deref(), title.as_deref(), published)
        else {
            skipped += 1;
            tracing::warn!("Skipping feed entry with no id, link or title");
            continue;
        };

        let author = entry
            .authors
            .first()
            .map(|p| strip_control_chars(p.name.trim()).into_owned())
            .filter(|a| !a.is_empty());
        let content = entry.content.and_then(|c| c.body);
        // Summaries often arrive with their markup escaped a second time
        let summary = entry.summary.map(|s| unescape_html(&s.content).into_owned());

        entries.push(ParsedEntry {
            guid,
            title,
            url,
            author,
            content,
            summary,
            published,
        });
    }

    Ok(FeedDocument {
        title,
        url,
        entries,
        skipped,
    })
}

/// Stable identity for an entry: the source id, else the link, else a hash of
/// link, title and date. `None` when there is nothing to identify it by.
fn generate_guid(
    id: &str,
    url: Option<&str>,
    title: Option<&str>,
    published: Option<i64>,
) -> Option<String> {
    let trimmed = id.trim();
    if !trimmed.is_empty() {
        return Some(trimmed.to_string());
    }
    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
        return Some(url.trim().to_string());
    }
    let title = title?;

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    Some(format!("{:x}", hash))
}
