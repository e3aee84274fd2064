//! Feed acquisition: HTTP fetching, RSS/Atom parsing, HTML autodiscovery and
//! the OPML interchange format.
//!
//! - [`parser`] - feed documents into entries with stable guids (`feed-rs`)
//! - [`fetcher`] - conditional GET and the single autodiscovery hop
//! - [`discovery`] - finding a feed link in an HTML page (`scraper`)
//! - [`opml`] - OPML import parsing and export writing (`quick-xml`)

mod discovery;
mod fetcher;
mod opml;
mod parser;

pub use discovery::{discover, find_feed_link, Discovery};
pub use fetcher::{build_client, FetchError, FetchOutcome, Fetcher};
pub use opml::{export_opml, parse_opml, ExportHead, OpmlError, OpmlFeed};
pub use parser::{parse_feed, FeedDocument};
