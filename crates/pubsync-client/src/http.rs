use async_trait::async_trait;
use pubsync_core::config::{HttpConfig, SourceConnection};
use pubsync_core::contract::PageFetcher;
use pubsync_core::error::SyncError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// HTTP implementation of [`PageFetcher`].
///
/// Every request gets the source's timeout and static headers. Transient
/// failures (connect errors, timeouts, 429 and 5xx) are retried with backoff;
/// everything else fails immediately.
///
/// # Examples
///
/// ```no_run
/// use pubsync_client::HttpPageFetcher;
/// use pubsync_core::{HttpConfig, PageFetcher, SourceConnection};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = HttpPageFetcher::new(HttpConfig::default())?;
/// let source = SourceConnection::new("openzaak", "https://zaken.example.org/zaken/api/v1/");
/// let body = fetcher
///     .fetch_page(&source, "zaken", &[("page".to_string(), "1".to_string())])
///     .await?;
/// println!("{}", body);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpPageFetcher {
    client: Client,
    config: HttpConfig,
}

impl HttpPageFetcher {
    /// Creates a fetcher with the given retry and timeout settings.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Configuration` if the HTTP client cannot be built.
    pub fn new(config: HttpConfig) -> Result<Self, SyncError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(concat!("pubsync/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| SyncError::Configuration(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Builds the page URL from the source's base URL, the endpoint and the query.
    ///
    /// Absolute endpoints are used as they are; relative ones are joined onto
    /// the base URL, which is treated as a directory.
    fn page_url(
        source: &SourceConnection,
        endpoint: &str,
        query: &[(String, String)],
    ) -> Result<Url, SyncError> {
        let mut url = match Url::parse(endpoint) {
            Ok(absolute) => absolute,
            Err(_) => {
                let mut base = source.base_url.clone();
                if !base.ends_with('/') {
                    base.push('/');
                }
                Url::parse(&base)
                    .and_then(|b| b.join(endpoint.trim_start_matches('/')))
                    .map_err(|e| {
                        SyncError::InvalidUrl(format!("{} + {}: {}", source.base_url, endpoint, e))
                    })?
            }
        };

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn source_headers(source: &SourceConnection) -> Result<HeaderMap, SyncError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &source.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                SyncError::Configuration(format!("invalid header name `{}`: {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                SyncError::Configuration(format!("invalid value for header `{}`: {}", name, e))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Makes an HTTP GET request with automatic retry on transient failures.
    ///
    /// Whether a failure is retried is decided by [`SyncError::is_retryable`].
    /// Backoff is linear for network errors, timeouts and server errors (5xx),
    /// and exponential for rate limiting (429).
    async fn request_with_retry(
        &self,
        url: &Url,
        source: &SourceConnection,
    ) -> Result<reqwest::Response, SyncError> {
        let headers = Self::source_headers(source)?;
        let timeout = source.timeout();
        let base_delay = self.config.retry_base_delay;
        let max_retries = self.config.max_retries.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let sent = self
                .client
                .get(url.clone())
                .headers(headers.clone())
                .timeout(timeout)
                .send()
                .await;

            let (error, delay) = match sent {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        (SyncError::RateLimitExceeded, base_delay * 2_u32.pow(attempt))
                    } else if status.is_server_error() {
                        let error = SyncError::ServerError {
                            status: status.as_u16(),
                            url: url.to_string(),
                        };
                        (error, base_delay * attempt)
                    } else {
                        let error =
                            SyncError::Fetch(format!("HTTP {} from {}", status.as_u16(), url));
                        (error, Duration::ZERO)
                    }
                }
                Err(e) if e.is_timeout() => (SyncError::Timeout(timeout.as_secs()), base_delay * attempt),
                Err(e) if e.is_connect() => (
                    SyncError::NetworkError(format!("connection failed: {}", e)),
                    base_delay * attempt,
                ),
                Err(e) => (SyncError::Fetch(e.to_string()), Duration::ZERO),
            };

            if !error.is_retryable() || attempt >= max_retries {
                return Err(error);
            }

            warn!(
                source = %source.name,
                url = %url,
                attempt,
                error = %error,
                "Request failed, retrying"
            );
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(
        &self,
        source: &SourceConnection,
        endpoint: &str,
        query: &[(String, String)],
    ) -> Result<Value, SyncError> {
        let url = Self::page_url(source, endpoint, query)?;
        debug!(source = %source.name, url = %url, "GET page");

        let resp = self.request_with_retry(&url, source).await?;
        resp.json::<Value>()
            .await
            .map_err(|e| SyncError::Fetch(format!("undecodable body from {}: {}", url, e)))
    }
}
