use thiserror::Error;

use super::fetcher::{FetchError, FetchOutcome, Fetched, Fetcher};
use super::parser::{decode_text, parse_feed, ParsedFeed};
use crate::storage::CacheValidators;
use crate::util::{link_tags, resolve_url, validate_url};

/// `type` values of `<link rel="alternate">` elements that announce a feed.
const FEED_MIME_TYPES: &[&str] = &[
    "application/rss+xml",
    "application/atom+xml",
    "application/feed+json",
    "application/json",
    "application/rdf+xml",
];

/// Errors that can occur during feed discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The provided URL failed validation (bad scheme, SSRF policy, etc.)
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// The page or the single candidate feed could not be fetched
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Neither the URL nor any page link pointed at a parseable feed
    #[error("No feed found at this address")]
    NotAFeed,
}

/// A feed link found on an HTML page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCandidate {
    pub url: String,
    pub title: Option<String>,
}

/// What a URL turned out to point at.
#[derive(Debug, Clone)]
pub enum Discovery {
    /// A single feed, already fetched and parsed
    Feed {
        /// URL to subscribe to
        url: String,
        feed: ParsedFeed,
    },
    /// Several feeds announced by the page; the caller picks one
    Candidates(Vec<FeedCandidate>),
}

/// Discovers a feed from a URL.
///
/// A URL that serves a feed is parsed directly. An HTML page is scanned for
/// autodiscovery links: exactly one is fetched and parsed, several are
/// returned as [`Discovery::Candidates`] without fetching any of them.
///
/// # Errors
///
/// Returns [`DiscoveryError`] on validation failure, fetch failure, or if no
/// feed could be found at the URL.
pub async fn discover_feed(fetcher: &Fetcher, url: &str) -> Result<Discovery, DiscoveryError> {
    let validated = validate_url(url, fetcher.config().url_policy)
        .map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;
    let url = validated.to_string();

    let page = fetch_document(fetcher, &url).await?;
    let charset = page.charset();

    if !looks_like_html(&page) {
        match parse_feed(&page.body, charset.as_deref(), &page.final_url) {
            Ok(outcome) => {
                return Ok(Discovery::Feed {
                    url,
                    feed: outcome.feed,
                })
            }
            Err(e) => tracing::debug!(url = %url, error = %e, "Not a feed, scanning as HTML"),
        }
    }

    let html = decode_text(&page.body, charset.as_deref());
    let mut candidates = find_feed_candidates(&html, &page.final_url);

    match candidates.len() {
        0 => Err(DiscoveryError::NotAFeed),
        1 => {
            let candidate = candidates.remove(0);
            validate_url(&candidate.url, fetcher.config().url_policy)
                .map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;
            let fetched = fetch_document(fetcher, &candidate.url).await?;
            let charset = fetched.charset();
            let outcome = parse_feed(&fetched.body, charset.as_deref(), &fetched.final_url)
                .map_err(|e| {
                    tracing::debug!(url = %candidate.url, error = %e, "Advertised feed did not parse");
                    DiscoveryError::NotAFeed
                })?;
            Ok(Discovery::Feed {
                url: candidate.url,
                feed: outcome.feed,
            })
        }
        _ => Ok(Discovery::Candidates(candidates)),
    }
}

async fn fetch_document(fetcher: &Fetcher, url: &str) -> Result<Fetched, DiscoveryError> {
    match fetcher.fetch(url, &CacheValidators::default()).await? {
        FetchOutcome::Fetched(fetched) => Ok(fetched),
        FetchOutcome::NotModified => Err(DiscoveryError::NotAFeed),
    }
}

fn looks_like_html(fetched: &Fetched) -> bool {
    if let Some(mime) = fetched.mime_type() {
        if mime.contains("html") {
            return true;
        }
    }
    let head_len = fetched.body.len().min(256);
    let head = String::from_utf8_lossy(&fetched.body[..head_len]).to_ascii_lowercase();
    let head = head.trim_start_matches('\u{feff}').trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Scans HTML for `<link rel="alternate">` elements announcing a feed.
///
/// Relative hrefs resolve against `base_url`. Duplicates are dropped, first
/// occurrence wins.
fn find_feed_candidates(html: &str, base_url: &str) -> Vec<FeedCandidate> {
    let mut candidates: Vec<FeedCandidate> = Vec::new();

    for tag in link_tags(html) {
        if !tag.has_rel("alternate") {
            continue;
        }
        let is_feed = tag
            .mime_type
            .as_deref()
            .is_some_and(|t| FEED_MIME_TYPES.contains(&t));
        if !is_feed {
            continue;
        }
        let Some(href) = tag.href.as_deref().filter(|h| !h.is_empty()) else {
            continue;
        };

        let url = resolve_url(href, base_url);
        if candidates.iter().any(|c| c.url == url) {
            continue;
        }
        candidates.push(FeedCandidate {
            url,
            title: tag.title.filter(|t| !t.is_empty()),
        });
    }

    candidates
}
