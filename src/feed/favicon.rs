use std::time::Duration;
use url::Url;

use super::fetcher::{FetchOutcome, Fetched, Fetcher};
use super::parser::decode_text;
use crate::storage::CacheValidators;
use crate::util::{link_tags, resolve_url};

/// Icons larger than this are not worth storing per feed.
const MAX_ICON_BYTES: usize = 512 * 1024;

/// Declared icons tried per page; the rest are ignored.
const MAX_DECLARED_ICONS: usize = 4;

/// Look up an icon for the site at `site_url`.
///
/// Tries `/favicon.ico` at the site root first, then the first few icons the
/// home page declares with `<link rel="icon">` (or `shortcut icon` /
/// `apple-touch-icon`). The first response that is recognizably an image
/// wins. `timeout` bounds each request and the lookup as a whole.
///
/// Returns `None` when nothing usable was found; failures are logged at
/// debug level and never propagated.
pub async fn find_favicon(fetcher: &Fetcher, site_url: &str, timeout: Duration) -> Option<Vec<u8>> {
    match tokio::time::timeout(timeout, lookup(fetcher, site_url, timeout)).await {
        Ok(icon) => icon,
        Err(_) => {
            tracing::debug!(site = %site_url, "Favicon lookup timed out");
            None
        }
    }
}

async fn lookup(fetcher: &Fetcher, site_url: &str, timeout: Duration) -> Option<Vec<u8>> {
    let site = match Url::parse(site_url) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!(site = %site_url, error = %e, "Unparseable site URL, skipping favicon");
            return None;
        }
    };

    if let Ok(conventional) = site.join("/favicon.ico") {
        if let Some(icon) = fetch_icon(fetcher, conventional.as_str(), timeout).await {
            return Some(icon);
        }
    }

    let page = match fetcher
        .fetch_with_timeout(site.as_str(), &CacheValidators::default(), timeout)
        .await
    {
        Ok(FetchOutcome::Fetched(page)) => page,
        Ok(FetchOutcome::NotModified) => return None,
        Err(e) => {
            tracing::debug!(site = %site_url, error = %e, "Site page fetch failed");
            return None;
        }
    };

    for href in declared_icons(&page).into_iter().take(MAX_DECLARED_ICONS) {
        if let Some(icon) = fetch_icon(fetcher, &href, timeout).await {
            return Some(icon);
        }
    }

    tracing::debug!(site = %site_url, "No favicon found");
    None
}

/// Icon hrefs declared by an HTML page, resolved against its final URL.
fn declared_icons(page: &Fetched) -> Vec<String> {
    let charset = page.charset();
    let html = decode_text(&page.body, charset.as_deref());

    let mut hrefs: Vec<String> = Vec::new();
    for tag in link_tags(&html) {
        let is_icon = tag.has_rel("icon") || tag.has_rel("apple-touch-icon");
        let Some(href) = tag.href.as_deref().filter(|h| !h.is_empty()) else {
            continue;
        };
        if !is_icon || href.starts_with("data:") {
            continue;
        }
        let resolved = resolve_url(href, &page.final_url);
        if !hrefs.contains(&resolved) {
            hrefs.push(resolved);
        }
    }
    hrefs
}

async fn fetch_icon(fetcher: &Fetcher, url: &str, timeout: Duration) -> Option<Vec<u8>> {
    match fetcher
        .fetch_with_timeout(url, &CacheValidators::default(), timeout)
        .await
    {
        Ok(FetchOutcome::Fetched(fetched)) => {
            if fetched.body.is_empty() || fetched.body.len() > MAX_ICON_BYTES {
                return None;
            }
            let declared_image = fetched
                .mime_type()
                .is_some_and(|m| m.starts_with("image/"));
            if declared_image || sniff_image_type(&fetched.body).is_some() {
                Some(fetched.body)
            } else {
                tracing::debug!(url = %url, "Response is not an image");
                None
            }
        }
        Ok(FetchOutcome::NotModified) => None,
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Icon fetch failed");
            None
        }
    }
}

/// Identify an image by its leading bytes, returning its MIME type.
pub fn sniff_image_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return Some("image/x-icon");
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]).to_ascii_lowercase();
    let head = head.trim_start();
    if head.starts_with("<svg") || (head.starts_with("<?xml") && head.contains("<svg")) {
        return Some("image/svg+xml");
    }
    None
}
