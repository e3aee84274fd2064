use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use thiserror::Error;

use crate::storage::{Feed, FolderWithFeeds};

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
/// Prevents stack exhaustion from maliciously crafted deeply nested OPMLs.
const MAX_OPML_DEPTH: usize = 50;

const EXPORT_TITLE: &str = "RSS subscriptions exported by feedmill";

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Well-formed XML, but not an `<opml>` document with a `<body>`.
    #[error("Not an OPML document: {0}")]
    NotOpml(&'static str),

    /// The uploaded bytes are not UTF-8.
    #[error("OPML file is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
}

/// A feed subscription extracted from an OPML file.
///
/// URLs are returned exactly as written; they are validated when the
/// subscription is actually attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// From the `title` attribute, falling back to `text`.
    pub title: Option<String>,
    pub xml_url: String,
    pub html_url: Option<String>,
    /// Title of the innermost folder outline enclosing this feed.
    pub folder: Option<String>,
}

/// Parses OPML content and extracts feed subscriptions in document order.
///
/// Outlines with an `xmlUrl` are feeds. Outlines without one are folders;
/// feeds nested inside them carry the folder's title. Feeds at the top level of
/// `<body>` have no folder.
///
/// # Security
///
/// SEC-002: quick-xml (0.37) never parses `<!ENTITY>` declarations. Entity
/// references other than the five XML builtins fail with an escape error, so
/// external entities can never be expanded.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlFeed>, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    let mut buf = Vec::new();
    // One element per open <outline>: Some(title) for folders, None for feeds
    let mut stack: Vec<Option<String>> = Vec::new();
    let mut saw_root = false;
    let mut saw_body = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                // SEC-003: Reject excessively nested OPMLs
                if stack.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let outline = read_outline(&e, &reader)?;
                match outline.xml_url {
                    Some(xml_url) => {
                        feeds.push(feed_from(outline.title, xml_url, outline.html_url, &stack));
                        stack.push(None);
                    }
                    None => stack.push(Some(outline.title.unwrap_or_default())),
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let outline = read_outline(&e, &reader)?;
                if let Some(xml_url) = outline.xml_url {
                    feeds.push(feed_from(outline.title, xml_url, outline.html_url, &stack));
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                stack.pop();
            }
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if !saw_root {
                    if e.name().as_ref() != b"opml" {
                        return Err(OpmlError::NotOpml("root element is not <opml>"));
                    }
                    saw_root = true;
                }
                if e.name().as_ref() == b"body" {
                    saw_body = true;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(OpmlError::NotOpml("document has no <opml> element"));
    }
    if !saw_body {
        return Err(OpmlError::NotOpml("document has no <body> element"));
    }
    Ok(feeds)
}

struct Outline {
    title: Option<String>,
    xml_url: Option<String>,
    html_url: Option<String>,
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline, OpmlError> {
    let mut outline = Outline {
        title: None,
        xml_url: None,
        html_url: None,
    };
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?
            .trim()
            .to_string();
        if value.is_empty() {
            continue;
        }
        match attr.key.as_ref() {
            b"xmlUrl" => outline.xml_url = Some(value),
            b"htmlUrl" => outline.html_url = Some(value),
            b"title" => outline.title = Some(value),
            b"text" => text = Some(value),
            _ => {}
        }
    }

    outline.title = outline.title.or(text);
    Ok(outline)
}

fn feed_from(
    title: Option<String>,
    xml_url: String,
    html_url: Option<String>,
    stack: &[Option<String>],
) -> OpmlFeed {
    let folder = stack
        .iter()
        .rev()
        .find_map(|entry| entry.as_ref())
        .filter(|t| !t.is_empty())
        .cloned();
    OpmlFeed {
        title,
        xml_url,
        html_url,
        folder,
    }
}

// ============================================================================
// Export
// ============================================================================

/// Owner metadata written into the OPML `<head>`.
#[derive(Debug, Clone)]
pub struct ExportHead<'a> {
    pub owner_name: &'a str,
    pub owner_email: &'a str,
    pub date_created: DateTime<Utc>,
}

/// Serialise a user's subscriptions as an OPML 1.0 document.
///
/// Unfiled feeds come first as top-level outlines, followed by one outline per
/// folder in the order given (callers pass folders sorted by title).
pub fn export_opml(
    head: &ExportHead<'_>,
    unfiled: &[Feed],
    folders: &[FolderWithFeeds],
) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "1.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    let date_created = head.date_created.to_rfc2822();
    for (name, value) in [
        ("title", EXPORT_TITLE),
        ("ownerName", head.owner_name),
        ("ownerEmail", head.owner_email),
        ("dateCreated", date_created.as_str()),
    ] {
        write_text_element(&mut writer, name, value)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    for feed in unfiled {
        write_feed_outline(&mut writer, feed)?;
    }

    for entry in folders {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("title", entry.folder.title.as_str()));
        outline.push_attribute(("text", entry.folder.title.as_str()));
        if entry.feeds.is_empty() {
            writer
                .write_event(Event::Empty(outline))
                .context("Failed to write folder outline")?;
            continue;
        }
        writer
            .write_event(Event::Start(outline))
            .context("Failed to write folder outline")?;
        for feed in &entry.feeds {
            write_feed_outline(&mut writer, feed)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("outline")))
            .context("Failed to write folder outline end")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, value: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .with_context(|| format!("Failed to write {name} element"))?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .with_context(|| format!("Failed to write {name} text"))?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .with_context(|| format!("Failed to write {name} end"))?;
    Ok(())
}

fn write_feed_outline(writer: &mut Writer<Cursor<Vec<u8>>>, feed: &Feed) -> Result<()> {
    let mut outline = BytesStart::new("outline");
    outline.push_attribute(("type", "rss"));
    outline.push_attribute(("title", feed.title.as_str()));
    outline.push_attribute(("text", feed.title.as_str()));
    outline.push_attribute(("xmlUrl", feed.fetch_url.as_str()));
    if let Some(ref url) = feed.url {
        outline.push_attribute(("htmlUrl", url.as_str()));
    }
    writer
        .write_event(Event::Empty(outline))
        .context("Failed to write outline element")?;
    Ok(())
}
