use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL carries credentials in its userinfo part.
    #[error("Credentials in URL not allowed")]
    Credentials,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Which hosts a URL may point at.
///
/// A self-hosted aggregator commonly subscribes to feeds on the local
/// network, so private hosts are allowed unless the operator opts into
/// blocking them (`block_private_hosts` in the config file).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UrlPolicy {
    pub block_private_hosts: bool,
}

impl UrlPolicy {
    pub fn strict() -> Self {
        Self {
            block_private_hosts: true,
        }
    }
}

/// Validates a URL string for use as a fetch target.
///
/// Always rejects non-HTTP(S) schemes and embedded credentials. With
/// [`UrlPolicy::block_private_hosts`] set, also rejects localhost, loopback,
/// RFC 1918, link-local and unique-local addresses (SSRF prevention).
///
/// # Examples
///
/// ```
/// use rookery::util::{validate_url, UrlPolicy};
///
/// assert!(validate_url("https://example.com/feed.xml", UrlPolicy::strict()).is_ok());
/// assert!(validate_url("http://192.168.1.1/feed", UrlPolicy::strict()).is_err());
/// assert!(validate_url("http://192.168.1.1/feed", UrlPolicy::default()).is_ok());
/// assert!(validate_url("file:///etc/passwd", UrlPolicy::default()).is_err());
/// ```
pub fn validate_url(url_str: &str, policy: UrlPolicy) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlValidationError::Credentials);
    }

    if !policy.block_private_hosts {
        return Ok(url);
    }

    if let Some(host) = url.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(UrlValidationError::Localhost);
        }

        // Strip brackets from IPv6 addresses for parsing
        let host_for_parse = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

/// Resolves a potentially relative link against a base URL.
///
/// Protocol-relative links (`//host/path`) inherit the base scheme. When the
/// base itself cannot be parsed the link is returned unchanged.
pub fn resolve_url(href: &str, base_url: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_owned();
    }

    if let Ok(base) = Url::parse(base_url) {
        // SEC-014: join() runs the URL parser, normalizing paths and
        // protocol-relative forms instead of formatting strings by hand
        if let Ok(resolved) = base.join(href) {
            return resolved.to_string();
        }
    }

    href.to_owned()
}
