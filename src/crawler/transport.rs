//! HTTP transport
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building HTTP clients with proper user agent strings
//! - Conditional GET requests from stored validators
//! - Redirect following with the final URL reported back
//! - Body size capping
//! - Error classification

use crate::config::{FetchConfig, UserAgentConfig};
use crate::record::{FetchRecord, META_ETAG, META_LAST_MODIFIED};
use reqwest::header::{CONTENT_TYPE, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::{redirect::Policy, Client};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Maximum redirect hops followed for one request
pub const MAX_REDIRECTS: usize = 10;

/// Response to one fetch attempt
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code
    pub code: u16,
    /// URL the body was served from, after redirects
    pub final_url: String,
    pub content_type: Option<String>,
    /// Response headers, names lowercased
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// The body was cut off at the size cap
    pub truncated: bool,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map_or(false, |ct| ct.to_lowercase().contains("html"))
    }

    /// Body decoded as UTF-8, invalid sequences replaced
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Failure of a single fetch attempt
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Returns true if another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidUrl(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            Self::Body(e.to_string())
        } else if e.is_builder() {
            Self::InvalidUrl(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Fetches the resource a record names
///
/// Implementations are shared by every worker of a round. A server error
/// (5xx) or an I/O failure is an `Err`; every other status code is a
/// [`Response`].
pub trait Transport: Send + Sync + 'static {
    fn fetch(
        &self,
        record: &FetchRecord,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `user_agent` - The user agent configuration
/// * `fetch` - Timeouts
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use sumi_harvest::config::{FetchConfig, UserAgentConfig};
/// use sumi_harvest::crawler::build_http_client;
///
/// let user_agent = UserAgentConfig {
///     crawler_name: "SumiHarvest".to_string(),
///     crawler_version: "1.0".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&user_agent, &FetchConfig::default()).unwrap();
/// ```
pub fn build_http_client(
    user_agent: &UserAgentConfig,
    fetch: &FetchConfig,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent.header_value())
        .timeout(Duration::from_millis(fetch.timeout_ms))
        .connect_timeout(Duration::from_millis(fetch.connect_timeout_ms))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .build()
}

/// [`Transport`] over a reqwest client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    max_body_bytes: usize,
}

impl HttpTransport {
    pub fn new(user_agent: &UserAgentConfig, fetch: &FetchConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(user_agent, fetch)?,
            max_body_bytes: fetch.max_body_bytes,
        })
    }

    pub fn with_client(client: Client, max_body_bytes: usize) -> Self {
        Self {
            client,
            max_body_bytes,
        }
    }

    async fn get(&self, record: &FetchRecord) -> Result<Response, TransportError> {
        let url = url::Url::parse(record.url())
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", record.url(), e)))?;

        let mut request = self.client.get(url);
        if let Some(since) = record.meta(META_LAST_MODIFIED) {
            request = request.header(IF_MODIFIED_SINCE, since);
        }
        if let Some(etag) = record.meta(META_ETAG) {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let mut response = request.send().await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::Server(status.as_u16()));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await? {
            let room = self.max_body_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(Response {
            code: status.as_u16(),
            final_url,
            content_type,
            headers,
            body,
            truncated,
        })
    }
}

impl Transport for HttpTransport {
    fn fetch(
        &self,
        record: &FetchRecord,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send {
        self.get(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(max_body_bytes: usize) -> HttpTransport {
        let user_agent = UserAgentConfig {
            crawler_name: "TestHarvest".to_string(),
            crawler_version: "1.0".to_string(),
            contact_url: "https://example.com/about".to_string(),
            contact_email: "admin@example.com".to_string(),
        };
        let fetch = FetchConfig {
            max_body_bytes,
            ..FetchConfig::default()
        };
        HttpTransport::new(&user_agent, &fetch).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_html() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(header(
                "user-agent",
                "TestHarvest/1.0 (+https://example.com/about; admin@example.com)",
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body>hi</body></html>", "text/html")
                    .insert_header("etag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let record = FetchRecord::new(format!("{}/", server.uri()));
        let response = transport(1024).fetch(&record).await.unwrap();

        assert_eq!(response.code, 200);
        assert!(response.is_html());
        assert_eq!(response.header("ETag"), Some("\"v1\""));
        assert_eq!(response.text(), "<html><body>hi</body></html>");
        assert!(!response.truncated);
    }

    #[tokio::test]
    async fn test_server_error_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let record = FetchRecord::new(format!("{}/busy", server.uri()));
        let result = transport(1024).fetch(&record).await;
        assert!(matches!(result, Err(TransportError::Server(503))));
    }

    #[tokio::test]
    async fn test_not_found_is_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let record = FetchRecord::new(format!("{}/missing", server.uri()));
        let response = transport(1024).fetch(&record).await.unwrap();
        assert_eq!(response.code, 404);
    }

    #[tokio::test]
    async fn test_redirect_reports_final_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", "/new"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let record = FetchRecord::new(format!("{}/old", server.uri()));
        let response = transport(1024).fetch(&record).await.unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.final_url, format!("{}/new", server.uri()));
    }

    #[tokio::test]
    async fn test_body_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(100)))
            .mount(&server)
            .await;

        let record = FetchRecord::new(format!("{}/big", server.uri()));
        let response = transport(10).fetch(&record).await.unwrap();
        assert_eq!(response.body.len(), 10);
        assert!(response.truncated);
    }

    #[tokio::test]
    async fn test_conditional_headers_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let record =
            FetchRecord::new(format!("{}/cached", server.uri())).with_meta(META_ETAG, "\"v1\"");
        let response = transport(1024).fetch(&record).await.unwrap();
        assert_eq!(response.code, 304);
    }

    #[tokio::test]
    async fn test_invalid_url_not_retryable() {
        let record = FetchRecord::new("not a url");
        let err = transport(1024).fetch(&record).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
        assert!(!err.is_retryable());
        assert!(TransportError::Timeout.is_retryable());
    }
}
