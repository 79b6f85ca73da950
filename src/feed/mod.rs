//! Everything between a feed URL and stored items.
//!
//! - **Fetching**: a single bounded HTTP GET with conditional headers ([`Fetcher`])
//! - **Parsing**: RSS/Atom/JSON Feed into a normalized model, salvaging what it
//!   can from damaged documents ([`parse_feed`])
//! - **Discovery**: turning an arbitrary page URL into a feed or a list of
//!   candidates ([`discover_feed`])
//! - **Favicons**: locating a site icon ([`find_favicon`])
//! - **Merge**: fingerprinting entries and persisting only unseen ones ([`merge_items`])
//! - **OPML Import**: subscription lists with folders ([`parse_opml`])
//!
//! Scheduling lives in [`crate::worker`]; nothing here keeps per-feed state.

mod discovery;
mod favicon;
mod fetcher;
mod merge;
mod opml;
mod parser;

pub use discovery::{discover_feed, Discovery, DiscoveryError, FeedCandidate};
pub use favicon::{find_favicon, sniff_image_type};
pub use fetcher::{FetchError, FetchOutcome, Fetched, Fetcher, FetcherConfig, DEFAULT_USER_AGENT};
pub use merge::{fingerprint, merge_items, to_new_items};
pub use opml::{parse_file, parse_opml, OpmlError, OpmlFeed};
pub use parser::{decode_text, parse_feed, ParseError, ParseOutcome, ParsedFeed, ParsedItem};
