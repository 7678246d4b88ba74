use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{StatusCode, Url};
use thiserror::Error;

use crate::fetch::FetchErrorKind;

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::OK,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            retry_after: None,
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{message}")]
    Other { message: String, retryable: bool },
}

impl TransportError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            TransportError::Timeout | TransportError::Connect(_) => FetchErrorKind::Transient,
            TransportError::Other { retryable: true, .. } => FetchErrorKind::Transient,
            TransportError::Other { retryable: false, .. } => FetchErrorKind::Permanent,
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync + std::fmt::Debug {
    async fn get(&self, url: &Url) -> Result<UpstreamResponse, TransportError>;
}

/// Maps a non-success status to the fetch failure it represents.
pub fn classify_status(status: StatusCode) -> Option<FetchErrorKind> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(FetchErrorKind::RateLimited)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        Some(FetchErrorKind::Transient)
    } else {
        Some(FetchErrorKind::Permanent)
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other {
            message: err.to_string(),
            retryable: err.is_request() || err.is_body(),
        }
    }
}

/// `Retry-After` in its delta-seconds form; HTTP dates are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpUpstreamConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpUpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: HttpUpstreamConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn get(&self, url: &Url) -> Result<UpstreamResponse, TransportError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp
            .bytes()
            .await
            .map_err(|err| classify_reqwest_error(&err))?
            .to_vec();

        Ok(UpstreamResponse {
            status,
            retry_after,
            body,
        })
    }
}
