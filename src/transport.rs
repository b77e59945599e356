//! HTTP transport layer and response classification

use crate::errors::{ExporterError, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Client, Url};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

/// Content type of a newline-delimited JSON batch
pub const CONTENT_TYPE_JSON_STREAM: &str = "application/x-json-stream";

/// Longest response body kept for diagnostics
const MAX_BODY_SNIPPET: usize = 512;

/// A single outbound POST. Cloned whenever a redirect is followed.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub url: Url,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl OutboundRequest {
    pub fn new(url: Url, body: Vec<u8>) -> Self {
        Self {
            url,
            content_type: CONTENT_TYPE_JSON_STREAM,
            body,
        }
    }

    /// Same request aimed at another URL
    pub fn with_url(&self, url: Url) -> Self {
        Self {
            url,
            ..self.clone()
        }
    }
}

/// The parts of a response the pipeline cares about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            location: None,
            body: String::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// Failures that happen before any response status is available
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request could not be built: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidRequest(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Sends one request without following redirects
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn execute(&self, request: OutboundRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// Coarse outcome of an HTTP status code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Retryable,
    Permanent,
}

/// Classify a terminal status code.
///
/// Redirects reach this point only once they could not be followed any further.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 | 500..=599 => StatusClass::Retryable,
        _ => StatusClass::Permanent,
    }
}

pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Permanent,
}

/// A classified delivery failure handed to the listener chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendFailure {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub message: String,
}

impl SendFailure {
    pub fn from_response(response: &HttpResponse) -> Self {
        let kind = match classify_status(response.status) {
            StatusClass::Retryable => FailureKind::Retryable,
            _ => FailureKind::Permanent,
        };

        let message = match response.status {
            400 => format!("Bad request: {}", response.body),
            401 | 403 => format!("Not authorized ({}): {}", response.status, response.body),
            404 => format!("Ingestion endpoint not found: {}", response.body),
            408 => format!("Request timeout: {}", response.body),
            413 => format!("Batch too large: {}", response.body),
            429 => format!("Rate limited: {}", response.body),
            500..=599 => format!("Server error {}: {}", response.status, response.body),
            300..=399 => format!("Unfollowed redirect {}", response.status),
            _ => format!("Unexpected response {}: {}", response.status, response.body),
        };

        Self {
            kind,
            status: Some(response.status),
            message,
        }
    }

    pub fn from_transport(error: &TransportError) -> Self {
        let kind = if error.is_retryable() {
            FailureKind::Retryable
        } else {
            FailureKind::Permanent
        };

        Self {
            kind,
            status: None,
            message: error.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

/// reqwest-backed sender with automatic redirects turned off
#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: Client,
    timeout: Duration,
}

impl ReqwestSender {
    /// Create a new HTTP sender
    pub fn new(http_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(format!("telemetry_exporter/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ExporterError::Http)?;

        Ok(Self {
            client,
            timeout: http_timeout,
        })
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn execute(&self, request: OutboundRequest) -> std::result::Result<HttpResponse, TransportError> {
        debug!("POST {} ({} bytes)", request.url, request.body.len());

        let response = timeout(
            self.timeout,
            self.client
                .post(request.url)
                .header(CONTENT_TYPE, request.content_type)
                .body(request.body)
                .send(),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_BODY_SNIPPET {
            let mut cut = MAX_BODY_SNIPPET;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        Ok(HttpResponse {
            status,
            location,
            body,
        })
    }
}
