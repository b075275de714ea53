use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

use crate::shutdown::Shutdown;

/// User-Agent sent with every outbound feed request.
pub const USER_AGENT: &str = "RSS-Telegram-Bot/1.0";

/// Total deadline for one request: connect, headers and body.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching a URL.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Any response other than 200 OK
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the total deadline
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// The shutdown signal fired while the request was in flight
    #[error("Request cancelled")]
    Cancelled,
}

/// A successfully fetched response body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub body: Vec<u8>,
    /// Raw `Content-Type` header, empty when the server sent none.
    pub content_type: String,
}

/// HTTP GET client for feeds and discovery pages.
///
/// No retries happen here: the monitor decides what a failure means.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_body_size: usize,
}

impl Fetcher {
    /// Builds a fetcher with its own HTTP client identifying as [`USER_AGENT`].
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Wraps an existing client. The caller is responsible for its User-Agent.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: FETCH_TIMEOUT,
            max_body_size: MAX_FEED_SIZE,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    /// Fetches `url`, returning the body and its declared content type.
    ///
    /// # Errors
    ///
    /// - [`FetchError::HttpStatus`] for any status other than 200
    /// - [`FetchError::Network`] for transport failures
    /// - [`FetchError::Timeout`] when the deadline elapses
    /// - [`FetchError::ResponseTooLarge`] when the body exceeds the size limit
    /// - [`FetchError::Cancelled`] when `shutdown` fires first
    pub async fn fetch(&self, url: &str, shutdown: &Shutdown) -> Result<FetchedBody, FetchError> {
        if shutdown.is_triggered() {
            return Err(FetchError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = shutdown.triggered() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.fetch_inner(url)) => {
                result.map_err(|_| FetchError::Timeout)?
            }
        }
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchedBody, FetchError> {
        let response = self.client.get(url).send().await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();

        let body = read_limited_bytes(response, self.max_body_size).await?;
        tracing::trace!(url = %url, bytes = body.len(), content_type = %content_type, "Fetched");

        Ok(FetchedBody { body, content_type })
    }
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
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
