//! Utility functions shared by the fetcher, discovery and storage layers.
//!
//! - **URL handling**: policy-based validation and relative link resolution
//! - **Text cleanup**: normalizing attacker-controlled feed metadata before storage
//! - **HTML scanning**: `<link>` elements for feed autodiscovery and icons
//!
//! # Examples
//!
//! ```
//! use rookery::util::{clean_text, resolve_url, validate_url, UrlPolicy};
//!
//! let url = validate_url("https://example.com/feed.xml", UrlPolicy::default()).unwrap();
//! assert_eq!(url.host_str(), Some("example.com"));
//!
//! assert_eq!(resolve_url("/rss", "https://example.com/blog/"), "https://example.com/rss");
//! assert_eq!(clean_text("  Hello\n\tWorld "), "Hello World");
//! ```

mod html;
mod text;
mod url_validator;

pub use html::{link_tags, LinkTag};
pub use text::{clean_text, strip_control_chars};
pub use url_validator::{resolve_url, validate_url, UrlPolicy, UrlValidationError};
