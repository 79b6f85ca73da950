use futures::StreamExt;
use reqwest::header::{
    HeaderMap, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::storage::CacheValidators;
use crate::util::{validate_url, UrlPolicy, UrlValidationError};

pub const DEFAULT_USER_AGENT: &str = concat!("rookery/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while fetching a remote document.
///
/// The `Display` text is what gets stored as a feed's last error.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request or body read did not finish within the timeout
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with a non-success status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// DNS, connection, TLS or body-read failure
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),
    /// The redirect chain exceeded the configured hop count
    #[error("Too many redirects")]
    TooManyRedirects,
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// URL (or a redirect target) failed validation
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// HTTP client settings shared by every fetch.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
    pub user_agent: String,
    pub url_policy: UrlPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 10,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            url_policy: UrlPolicy::default(),
        }
    }
}

/// A successfully downloaded document.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: Vec<u8>,
    /// URL after following redirects
    pub final_url: String,
    /// Raw `Content-Type` header, if any
    pub content_type: Option<String>,
    /// Validators to send on the next conditional request
    pub validators: CacheValidators,
}

impl Fetched {
    /// The `charset` parameter of the `Content-Type` header, lowercased.
    pub fn charset(&self) -> Option<String> {
        self.content_type.as_deref().and_then(charset_from_content_type)
    }

    /// The media type without parameters, lowercased.
    pub fn mime_type(&self) -> Option<String> {
        let content_type = self.content_type.as_deref()?;
        let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
        (!mime.is_empty()).then_some(mime)
    }
}

/// Result of a conditional GET.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The server answered 304: nothing changed since the validators were issued
    NotModified,
    Fetched(Fetched),
}

/// Single-shot HTTP GET with timeout, bounded redirects, a body size limit
/// and conditional-request support. Cheap to clone.
///
/// There are no retries: a failed fetch is reported once and the next
/// scheduled refresh tries again.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let max_redirects = config.max_redirects;
        let url_policy = config.url_policy;

        // SEC: redirect targets get the same validation as the first URL.
        // `previous()` includes the original request, so N hops are allowed.
        let redirect = Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(TooManyRedirectsMarker);
            }
            match validate_url(attempt.url().as_str(), url_policy) {
                Ok(_) => attempt.follow(),
                Err(e) => attempt.error(e),
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect)
            .timeout(config.timeout)
            .build()
            .map_err(FetchError::Network)?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Fetch `url`, sending `validators` as conditional headers when present.
    ///
    /// The whole exchange (connect, redirects, body) is bounded by the
    /// configured timeout.
    pub async fn fetch(
        &self,
        url: &str,
        validators: &CacheValidators,
    ) -> Result<FetchOutcome, FetchError> {
        self.fetch_with_timeout(url, validators, self.config.timeout)
            .await
    }

    /// Like [`fetch`](Self::fetch), with an explicit deadline.
    pub async fn fetch_with_timeout(
        &self,
        url: &str,
        validators: &CacheValidators,
        timeout: Duration,
    ) -> Result<FetchOutcome, FetchError> {
        let url = validate_url(url, self.config.url_policy)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        tokio::time::timeout(timeout, self.fetch_inner(url, validators))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    /// Unconditional GET returning the body as text, decoded by its declared charset.
    pub async fn get_body(&self, url: &str) -> Result<String, FetchError> {
        match self.fetch(url, &CacheValidators::default()).await? {
            FetchOutcome::Fetched(fetched) => {
                let charset = fetched.charset();
                Ok(super::parser::decode_text(&fetched.body, charset.as_deref()))
            }
            // Only possible if the server ignores the missing validators
            FetchOutcome::NotModified => Err(FetchError::HttpStatus(304)),
        }
    }

    async fn fetch_inner(
        &self,
        url: url::Url,
        validators: &CacheValidators,
    ) -> Result<FetchOutcome, FetchError> {
        let mut request = self.client.get(url);
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.map_err(classify_error)?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let final_url = response.url().to_string();
        let content_type = header_string(response.headers(), CONTENT_TYPE.as_str());
        let validators = CacheValidators {
            etag: header_string(response.headers(), ETAG.as_str()),
            last_modified: header_string(response.headers(), LAST_MODIFIED.as_str()),
        };
        let body = read_limited_bytes(response, self.config.max_body_bytes).await?;

        Ok(FetchOutcome::Fetched(Fetched {
            body,
            final_url,
            content_type,
            validators,
        }))
    }
}

/// Error payload used to tell a hop-count overflow apart from a rejected target.
#[derive(Debug)]
struct TooManyRedirectsMarker;

impl std::fmt::Display for TooManyRedirectsMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("too many redirects")
    }
}

impl std::error::Error for TooManyRedirectsMarker {}

fn classify_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    if err.is_redirect() {
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            if let Some(invalid) = cause.downcast_ref::<UrlValidationError>() {
                return FetchError::InvalidUrl(invalid.to_string());
            }
            source = cause.source();
        }
        return FetchError::TooManyRedirects;
    }
    FetchError::Network(err)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

pub(crate) fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        (!value.is_empty()).then(|| value.to_ascii_lowercase())
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify_error)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> Fetcher {
        Fetcher::new(FetcherConfig::default()).unwrap()
    }

    fn fetched(outcome: FetchOutcome) -> Fetched {
        match outcome {
            FetchOutcome::Fetched(f) => f,
            FetchOutcome::NotModified => panic!("Expected a body, got NotModified"),
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<rss/>")
                    .insert_header("Content-Type", "application/rss+xml; charset=ISO-8859-1")
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
            )
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let result = fetched(fetcher().fetch(&url, &CacheValidators::default()).await.unwrap());

        assert_eq!(result.body, b"<rss/>");
        assert_eq!(result.final_url, url);
        assert_eq!(result.charset().as_deref(), Some("iso-8859-1"));
        assert_eq!(result.mime_type().as_deref(), Some("application/rss+xml"));
        assert_eq!(result.validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            result.validators.last_modified.as_deref(),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_conditional_headers_and_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .and(header("If-Modified-Since", "Mon, 01 Jan 2024 00:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let validators = CacheValidators {
            etag: Some("\"v1\"".to_string()),
            last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        };
        let outcome = fetcher()
            .fetch(&format!("{}/feed", server.uri()), &validators)
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::NotModified));
    }

    #[tokio::test]
    async fn test_http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch(&format!("{}/feed", server.uri()), &CacheValidators::default())
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus(404) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }
        assert_eq!(FetchError::HttpStatus(404).to_string(), "HTTP error: status 404");
    }

    #[tokio::test]
    async fn test_server_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch(&format!("{}/feed", server.uri()), &CacheValidators::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(503)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<rss/>")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch_with_timeout(
                &format!("{}/feed", server.uri()),
                &CacheValidators::default(),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout), "got {err:?}");
    }

    #[tokio::test]
    async fn test_follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("Location", format!("{}/new", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let result = fetched(
            fetcher()
                .fetch(&format!("{}/old", server.uri()), &CacheValidators::default())
                .await
                .unwrap(),
        );
        assert_eq!(result.final_url, format!("{}/new", server.uri()));
        assert_eq!(result.body, b"moved");
    }

    #[tokio::test]
    async fn test_too_many_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("{}/loop", server.uri())),
            )
            .mount(&server)
            .await;

        let config = FetcherConfig {
            max_redirects: 3,
            ..Default::default()
        };
        let err = Fetcher::new(config)
            .unwrap()
            .fetch(&format!("{}/loop", server.uri()), &CacheValidators::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects), "got {err:?}");
    }

    #[tokio::test]
    async fn test_redirect_limit_is_inclusive() {
        let server = MockServer::start().await;
        for (from, to) in [("/r1", "/r2"), ("/r2", "/r3"), ("/r3", "/done")] {
            Mock::given(method("GET"))
                .and(path(from))
                .respond_with(
                    ResponseTemplate::new(302).insert_header("Location", format!("{}{}", server.uri(), to)),
                )
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/done"))
            .respond_with(ResponseTemplate::new(200).set_body_string("arrived"))
            .mount(&server)
            .await;

        let start = format!("{}/r1", server.uri());
        let three_hops = Fetcher::new(FetcherConfig {
            max_redirects: 3,
            ..Default::default()
        })
        .unwrap();
        let result = fetched(three_hops.fetch(&start, &CacheValidators::default()).await.unwrap());
        assert_eq!(result.final_url, format!("{}/done", server.uri()));

        let two_hops = Fetcher::new(FetcherConfig {
            max_redirects: 2,
            ..Default::default()
        })
        .unwrap();
        let err = two_hops
            .fetch(&start, &CacheValidators::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects), "got {err:?}");
    }

    #[tokio::test]
    async fn test_private_host_rejected_when_strict() {
        let config = FetcherConfig {
            url_policy: UrlPolicy::strict(),
            ..Default::default()
        };
        let err = Fetcher::new(config)
            .unwrap()
            .fetch("http://127.0.0.1:1/feed", &CacheValidators::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_response_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
            .mount(&server)
            .await;

        let config = FetcherConfig {
            max_body_bytes: 1024,
            ..Default::default()
        };
        let err = Fetcher::new(config)
            .unwrap()
            .fetch(&format!("{}/big", server.uri()), &CacheValidators::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = fetcher()
            .fetch("ftp://example.com/feed", &CacheValidators::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_get_body_decodes_charset() {
        let server = MockServer::start().await;
        // "café" in ISO-8859-1
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![b'c', b'a', b'f', 0xE9])
                    .insert_header("Content-Type", "text/html; charset=iso-8859-1"),
            )
            .mount(&server)
            .await;

        let body = fetcher()
            .get_body(&format!("{}/page", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "café");
    }

    #[test]
    fn test_charset_from_content_type() {
        assert_eq!(
            charset_from_content_type("text/xml; charset=\"Windows-1251\"").as_deref(),
            Some("windows-1251")
        );
        assert_eq!(charset_from_content_type("text/xml"), None);
        assert_eq!(charset_from_content_type("text/xml; q=1"), None);
    }
}
