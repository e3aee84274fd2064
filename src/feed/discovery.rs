use anyhow::Result;
use scraper::{Html, Selector};
use url::Url;

use crate::storage::{Database, Feed};

/// Link selectors in order of preference: Atom, then RSS, then a generic
/// `rel="feed"` link. The first selector with a match wins.
const FEED_LINK_SELECTORS: [&str; 3] = [
    r#"head link[rel~="alternate"][type="application/atom+xml"]"#,
    r#"head link[rel~="alternate"][type="application/rss+xml"]"#,
    r#"head link[rel~="feed"]"#,
];

/// Result of running autodiscovery for a placeholder feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// The placeholder now points at the discovered feed URL.
    Updated(Feed),
    /// The discovered URL belongs to a feed that already existed. The
    /// placeholder has been deleted and the existing feed is returned.
    Existing(Feed),
    /// The page carries no usable feed link.
    NoFeedLink,
    /// The placeholder was deleted while discovery was running.
    FeedGone,
}

/// Find the feed link advertised by an HTML page and reconcile it with the
/// feeds already in storage.
///
/// The HTML is assumed to have been fetched from `placeholder.fetch_url`;
/// links without a host are resolved against that URL's scheme and host.
pub async fn discover(db: &Database, placeholder: &Feed, html: &str) -> Result<Discovery> {
    let Some(href) = find_feed_link(html) else {
        tracing::warn!(url = %placeholder.fetch_url, "Feed autodiscovery found no feed link");
        return Ok(Discovery::NoFeedLink);
    };
    let Some(resolved) = resolve_href(&href, &placeholder.fetch_url) else {
        tracing::warn!(url = %placeholder.fetch_url, href = %href, "Unresolvable autodiscovered feed link");
        return Ok(Discovery::NoFeedLink);
    };

    if let Some(existing) = db.find_feed_by_url(&resolved, Some(placeholder.id)).await? {
        tracing::info!(
            url = %resolved,
            existing_id = existing.id,
            placeholder_id = placeholder.id,
            "Autodiscovered an already known feed, dropping placeholder"
        );
        db.delete_feed(placeholder.id).await?;
        return Ok(Discovery::Existing(existing));
    }

    tracing::info!(url = %resolved, feed_id = placeholder.id, "Autodiscovered new feed URL");
    if !db.set_feed_fetch_url(placeholder.id, &resolved).await? {
        return Ok(Discovery::FeedGone);
    }
    Ok(Discovery::Updated(Feed {
        fetch_url: resolved,
        ..placeholder.clone()
    }))
}

/// The `href` of the preferred feed link in an HTML document, if any.
pub fn find_feed_link(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    for selector in &FEED_LINK_SELECTORS {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        let href = document
            .select(&sel)
            .filter_map(|element| element.value().attr("href"))
            .map(str::trim)
            .find(|href| !href.is_empty());
        if let Some(href) = href {
            return Some(href.to_owned());
        }
    }

    None
}

/// Make an autodiscovered link absolute.
///
/// Absolute links are returned unchanged. Protocol-relative links take the
/// page's scheme. Anything else is treated as a path on the page's host.
fn resolve_href(href: &str, page_url: &str) -> Option<String> {
    if let Ok(url) = Url::parse(href) {
        if url.has_host() {
            return Some(href.to_owned());
        }
    }

    let page = Url::parse(page_url).ok()?;
    if href.starts_with("//") {
        return page.join(href).ok().map(String::from);
    }

    let mut origin = page;
    origin.set_query(None);
    origin.set_fragment(None);
    origin.set_path("/");
    origin.join(href).ok().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FeedUpdate, ParsedEntry};

    fn page(links: &str) -> String {
        format!("<!DOCTYPE html><html><head><title>Site</title>{links}</head><body><p>Hi</p></body></html>")
    }

    #[test]
    fn test_prefers_atom_over_rss_and_generic() {
        let html = page(
            r#"<link rel="feed" href="/generic.xml">
               <link rel="alternate" type="application/rss+xml" href="/rss.xml">
               <link rel="alternate" type="application/atom+xml" href="/atom.xml">"#,
        );
        assert_eq!(find_feed_link(&html).as_deref(), Some("/atom.xml"));
    }

    #[test]
    fn test_rss_before_generic() {
        let html = page(
            r#"<link rel="feed" href="/generic.xml">
               <link rel="alternate" type="application/rss+xml" href="/rss.xml">"#,
        );
        assert_eq!(find_feed_link(&html).as_deref(), Some("/rss.xml"));
    }

    #[test]
    fn test_generic_feed_relation() {
        let html = page(r#"<link rel="feed" href="https://example.com/all.xml">"#);
        assert_eq!(find_feed_link(&html).as_deref(), Some("https://example.com/all.xml"));
    }

    #[test]
    fn test_first_link_of_a_kind_wins() {
        let html = page(
            r#"<link rel="alternate" type="application/rss+xml" href="/one.xml">
               <link rel="alternate" type="application/rss+xml" href="/two.xml">"#,
        );
        assert_eq!(find_feed_link(&html).as_deref(), Some("/one.xml"));
    }

    #[test]
    fn test_no_feed_link() {
        let html = page(r#"<link rel="stylesheet" href="/style.css">"#);
        assert_eq!(find_feed_link(&html), None);
        assert_eq!(find_feed_link("not html at all"), None);
    }

    #[test]
    fn test_resolve_absolute_unchanged() {
        assert_eq!(
            resolve_href("http://feeds.example.com/rss", "https://example.com/blog/").as_deref(),
            Some("http://feeds.example.com/rss")
        );
    }

    #[test]
    fn test_resolve_path_against_scheme_and_host() {
        assert_eq!(
            resolve_href("/feeds.php", "https://example.com/blog/post?id=1").as_deref(),
            Some("https://example.com/feeds.php")
        );
        assert_eq!(
            resolve_href("feeds.php", "http://example.com:8080/blog/").as_deref(),
            Some("http://example.com:8080/feeds.php")
        );
    }

    #[test]
    fn test_resolve_protocol_relative() {
        assert_eq!(
            resolve_href("//cdn.example.com/feed.xml", "https://example.com/").as_deref(),
            Some("https://cdn.example.com/feed.xml")
        );
    }

    #[tokio::test]
    async fn test_discover_updates_placeholder() {
        let db = Database::open(":memory:").await.unwrap();
        let placeholder = db.create_feed("https://example.com/blog", 3600).await.unwrap();
        let html = page(r#"<link rel="alternate" type="application/atom+xml" href="/atom.xml">"#);

        let discovery = discover(&db, &placeholder, &html).await.unwrap();
        let Discovery::Updated(feed) = discovery else {
            panic!("expected Updated, got {discovery:?}");
        };
        assert_eq!(feed.id, placeholder.id);
        assert_eq!(feed.fetch_url, "https://example.com/atom.xml");

        let stored = db.get_feed(placeholder.id).await.unwrap().unwrap();
        assert_eq!(stored.fetch_url, "https://example.com/atom.xml");
    }

    #[tokio::test]
    async fn test_discover_existing_feed_deletes_placeholder() {
        let db = Database::open(":memory:").await.unwrap();
        let existing = db.create_feed("http://example.com/atom.xml", 3600).await.unwrap();
        let history = ParsedEntry {
            guid: "urn:entry:1".to_string(),
            title: Some("Earlier post".to_string()),
            url: Some("http://example.com/1".to_string()),
            author: None,
            content: None,
            summary: None,
            published: Some(1704067200),
        };
        db.merge_fetched_feed(existing.id, &FeedUpdate::default(), &[history])
            .await
            .unwrap();
        let existing = db.get_feed(existing.id).await.unwrap().unwrap();
        let entries_before = db.get_entries_for_feed(existing.id).await.unwrap();

        let placeholder = db.create_feed("https://example.com/blog", 3600).await.unwrap();
        let html = page(r#"<link rel="alternate" type="application/atom+xml" href="/atom.xml">"#);

        let discovery = discover(&db, &placeholder, &html).await.unwrap();
        assert_eq!(discovery, Discovery::Existing(existing.clone()));
        assert!(db.get_feed(placeholder.id).await.unwrap().is_none());
        assert_eq!(db.get_feed(existing.id).await.unwrap(), Some(existing.clone()));
        assert_eq!(db.get_entries_for_feed(existing.id).await.unwrap(), entries_before);
        assert_eq!(entries_before.len(), 1);
    }

    #[tokio::test]
    async fn test_discover_without_link() {
        let db = Database::open(":memory:").await.unwrap();
        let placeholder = db.create_feed("https://example.com/blog", 3600).await.unwrap();

        let discovery = discover(&db, &placeholder, &page("")).await.unwrap();
        assert_eq!(discovery, Discovery::NoFeedLink);
        assert!(db.get_feed(placeholder.id).await.unwrap().is_some());
    }
}
