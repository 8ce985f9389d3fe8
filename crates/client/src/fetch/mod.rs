//! HTTP transport for ActivityStreams documents.
//!
//! ### URL Canonicalization
//! - Trim whitespace, ensure scheme (default: `https`)
//! - Lowercase host, remove fragments
//! - Preserve query string
//!
//! ### Status classification
//! - 404/410: the document is gone (`NotFound`)
//! - 429: `RateLimited`, honouring `Retry-After`
//! - other 4xx: rejected request, never retried
//! - 5xx: server trouble, retried, honouring `Retry-After`
//!
//! ### Limits
//! - Max redirects: 5
//! - Max body bytes: 5MB (configurable)

pub mod url;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use std::time::{Duration, Instant};

pub use url::{UrlError, canonicalize, is_well_formed};

use crate::loader::{LoadOptions, Loader};
use outpost_core::cachecontrol::parse_http_date;
use outpost_core::{AppConfig, Document, Error, now_unix};

/// Media types requested from remote servers.
pub const ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Configuration for the fetch client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "outpost/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 5MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
            timeout: config.timeout(),
            max_redirects: 5,
        }
    }
}

/// Response from a fetch operation.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// The canonicalized URL requested
    pub url: Url,
    /// The final URL after redirects
    pub final_url: Url,
    /// HTTP status code
    pub status: StatusCode,
    /// Response body bytes
    pub bytes: Bytes,
    /// Response headers
    pub headers: header::HeaderMap,
    /// Time taken to fetch in milliseconds
    pub fetch_ms: u64,
}

impl FetchResponse {
    /// Decode the body as a JSON object and attach the response headers.
    ///
    /// The document keeps the URL as requested so that the cache can register
    /// it as an alias of the document's own id.
    pub fn into_document(self) -> Result<Document, Error> {
        let object: Value = serde_json::from_slice(&self.bytes)?;
        if !object.is_object() {
            return Err(Error::Decode(format!("{} did not return a JSON object", self.url)));
        }

        let mut headers: Vec<(String, String)> = Vec::new();
        for name in self.headers.keys() {
            let values: Vec<&str> = self
                .headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            if !values.is_empty() {
                headers.push((name.as_str().to_string(), values.join(", ")));
            }
        }

        Ok(Document::new(self.url.as_str(), object).with_headers(headers))
    }
}

/// HTTP transport: fetches and decodes one document, nothing more.
pub struct FetchClient {
    http: Client,
    config: FetchConfig,
}

impl FetchClient {
    /// Create a new fetch client with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    /// Fetch a URL, returning raw bytes and metadata.
    ///
    /// Non-success statuses are classified into retryable and permanent errors.
    pub async fn fetch(&self, url_str: &str) -> Result<FetchResponse, Error> {
        let start = Instant::now();
        let url = canonicalize(url_str).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let response = self
            .http
            .get(url.as_str())
            .header(header::ACCEPT, ACCEPT)
            .send()
            .await
            .map_err(|e| classify_send_error(&url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &url, response.headers()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", len, self.config.max_bytes)));
        }

        let final_url = response.url().clone();
        let headers = response.headers().clone();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_send_error(&url, &e))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", bytes.len(), self.config.max_bytes)));
        }

        let fetch_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(%url, %final_url, fetch_ms, bytes = bytes.len(), "fetched document");

        Ok(FetchResponse { url, final_url, status, bytes, headers, fetch_ms })
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }
}

#[async_trait]
impl Loader for FetchClient {
    async fn load(&self, uri: &str, _options: &LoadOptions) -> Result<Document, Error> {
        self.fetch(uri).await?.into_document()
    }
}

fn classify_send_error(url: &Url, err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::FetchTimeout(format!("{url}: {err}"))
    } else if err.is_decode() {
        Error::Decode(format!("{url}: {err}"))
    } else {
        Error::Network(format!("{url}: {err}"))
    }
}

/// Map a non-success status onto the error taxonomy.
pub fn status_error(status: StatusCode, url: &Url, headers: &header::HeaderMap) -> Error {
    let url = url.to_string();
    let retry_after = headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| retry_after(v, now_unix()));

    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Error::NotFound(url),
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited { url, retry_after },
        s if s.is_server_error() => Error::HttpServer { status: s.as_u16(), url, retry_after },
        s => Error::HttpClient { status: s.as_u16(), url },
    }
}

/// Parse `Retry-After` as delay-seconds or an HTTP-date relative to `now`.
pub fn retry_after(value: &str, now: i64) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    parse_http_date(value).map(|at| Duration::from_secs(at.saturating_sub(now).max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::ErrorKind;
    use rstest::rstest;

    fn url() -> Url {
        Url::parse("https://remote.example/notes/1").unwrap()
    }

    #[test]
    fn test_fetch_config_from_app_config() {
        let config = FetchConfig::default();
        assert_eq!(config.user_agent, "outpost/0.1");
        assert_eq!(config.max_bytes, 5 * 1024 * 1024);
        assert_eq!(config.timeout, Duration::from_millis(20000));
        assert_eq!(config.max_redirects, 5);
    }

    #[tokio::test]
    async fn test_fetch_client_new() {
        assert!(FetchClient::new(FetchConfig::default()).is_ok());
    }

    #[rstest]
    #[case(StatusCode::NOT_FOUND, ErrorKind::NotFound)]
    #[case(StatusCode::GONE, ErrorKind::NotFound)]
    #[case(StatusCode::FORBIDDEN, ErrorKind::Client)]
    #[case(StatusCode::UNAUTHORIZED, ErrorKind::Client)]
    #[case(StatusCode::TOO_MANY_REQUESTS, ErrorKind::Transient)]
    #[case(StatusCode::BAD_GATEWAY, ErrorKind::Transient)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, ErrorKind::Transient)]
    fn test_status_classification(#[case] status: StatusCode, #[case] kind: ErrorKind) {
        assert_eq!(status_error(status, &url(), &header::HeaderMap::new()).kind(), kind);
    }

    #[test]
    fn test_retry_after_header_is_honoured() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, header::HeaderValue::from_static("120"));
        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, &url(), &headers);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = 784_111_777; // Sun, 06 Nov 1994 08:49:37 GMT
        assert_eq!(retry_after("Sun, 06 Nov 1994 08:50:37 GMT", now), Some(Duration::from_secs(60)));
        assert_eq!(retry_after("Sun, 06 Nov 1994 08:48:37 GMT", now), Some(Duration::ZERO));
        assert_eq!(retry_after("soon", now), None);
    }

    #[test]
    fn test_into_document_keeps_headers() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("max-age=60"));
        headers.append(header::VARY, header::HeaderValue::from_static("Accept"));
        headers.append(header::VARY, header::HeaderValue::from_static("Signature"));

        let response = FetchResponse {
            url: url(),
            final_url: url(),
            status: StatusCode::OK,
            bytes: Bytes::from_static(br#"{"id": "https://remote.example/notes/1", "type": "Note"}"#),
            headers,
            fetch_ms: 12,
        };

        let doc = response.into_document().unwrap();
        assert_eq!(doc.url(), "https://remote.example/notes/1");
        assert_eq!(doc.header("Cache-Control"), Some("max-age=60"));
        assert_eq!(doc.header("vary"), Some("Accept, Signature"));
        assert!(doc.is_object());
    }

    #[test]
    fn test_into_document_rejects_non_objects() {
        let response = FetchResponse {
            url: url(),
            final_url: url(),
            status: StatusCode::OK,
            bytes: Bytes::from_static(b"[1, 2, 3]"),
            headers: header::HeaderMap::new(),
            fetch_ms: 1,
        };
        let err = response.into_document().unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
