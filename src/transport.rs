//! Network transport for delivering payloads to the collector.
//!
//! The shipper only depends on the [`Transport`] trait; [`HttpTransport`]
//! is the production implementation on top of reqwest. Each attempt uses
//! a fresh connection that is closed after the response is read.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

/// Collector path payloads are posted to.
pub const LOGS_PATH: &str = "/logs";

/// Bytes of response body retained for diagnostics.
pub const MAX_RESPONSE_BODY: usize = 512;

/// Errors that can occur while talking to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Name resolution or TCP connect failed
    #[error("connection failed: {0}")]
    Connect(String),

    /// The attempt did not finish within the request timeout
    #[error("request timed out")]
    Timeout,

    /// Sending the request or reading the response failed
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// One HTTP POST to the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRequest {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub body: String,
}

impl PostRequest {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Status and (bounded) body of a collector response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Delivers a single request and reports the collector's answer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: &PostRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport whose every attempt is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Request` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: &PostRequest) -> Result<TransportResponse, TransportError> {
        let url = request.url();
        debug!(url = %url, bytes = request.body.len(), "Posting payload");

        let mut response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONNECTION, "close")
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status().as_u16();

        let mut body = Vec::new();
        while body.len() < MAX_RESPONSE_BODY {
            match response.chunk().await? {
                Some(chunk) => {
                    let room = MAX_RESPONSE_BODY - body.len();
                    body.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                None => break,
            }
        }

        Ok(TransportResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
