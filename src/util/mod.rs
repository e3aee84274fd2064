//! Small helpers shared by the fetcher, the parser and the job workers.
//!
//! - **URL validation**: SSRF guard applied before any user-supplied URL is fetched
//! - **URL variants**: equivalent spellings of a feed URL, used for deduplication
//! - **Text cleanup**: control-character stripping and one-pass HTML unescaping

mod text;
mod url_validator;
mod url_variants;

pub use text::{strip_control_chars, unescape_html};
pub use url_validator::{validate_url, UrlValidationError};
pub use url_variants::url_variants;
