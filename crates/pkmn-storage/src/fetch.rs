use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use pkmn_core::{Clock, FetchSource, RawRecord, WorkItem};
use rand::Rng;
use reqwest::Url;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{Fingerprint, ResponseCache};
use crate::rate_limit::RateLimiter;
use crate::upstream::{classify_status, TransportError, Upstream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    Transient,
    Permanent,
    RateLimited,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchErrorKind::Transient => "transient",
            FetchErrorKind::Permanent => "permanent",
            FetchErrorKind::RateLimited => "rate_limited",
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{kind} failure fetching {url} after {attempts} attempt(s): {message}")]
    Failed {
        kind: FetchErrorKind,
        url: String,
        attempts: usize,
        message: String,
    },
    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    pub fn kind(&self) -> Option<FetchErrorKind> {
        match self {
            FetchError::Failed { kind, .. } => Some(*kind),
            FetchError::Cancelled { .. } => None,
        }
    }
}

/// Exponential backoff with optional additive jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = delay.mul_f64(self.jitter.min(1.0));
        delay + spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: Url,
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub listing_ttl: Duration,
    pub detail_ttl: Duration,
}

impl FetcherConfig {
    /// Normalizes the base URL so relative request paths append to it instead of
    /// replacing its last segment.
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            request_timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
            listing_ttl: Duration::from_secs(60 * 60),
            detail_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    fn ttl_for(&self, item: &WorkItem) -> Duration {
        if item.is_page() {
            self.listing_ttl
        } else {
            self.detail_ttl
        }
    }
}

/// Cache-first, rate-limited, retrying GET for a single [`WorkItem`].
///
/// Every network attempt takes exactly one permit from the shared limiter; cache hits
/// take none.
#[derive(Debug, Clone)]
pub struct Fetcher {
    upstream: Arc<dyn Upstream>,
    limiter: Arc<RateLimiter>,
    cache: ResponseCache,
    clock: Arc<dyn Clock>,
    config: FetcherConfig,
}

impl Fetcher {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        limiter: Arc<RateLimiter>,
        cache: ResponseCache,
        clock: Arc<dyn Clock>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            upstream,
            limiter,
            cache,
            clock,
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn resolve(&self, item: &WorkItem) -> Result<Url, FetchError> {
        self.config
            .base_url
            .join(item.request_path())
            .map_err(|err| FetchError::Failed {
                kind: FetchErrorKind::Permanent,
                url: item.request_path().to_string(),
                attempts: 0,
                message: format!("invalid request path: {err}"),
            })
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<RawRecord, FetchError> {
        let url = self.resolve(item)?;
        let fingerprint = Fingerprint::for_request("GET", &url);

        if let Some(entry) = self.cache.get(&fingerprint).await {
            return Ok(RawRecord {
                work_item: item.clone(),
                body: entry.body,
                fetched_at: entry.fetched_at,
                source: FetchSource::Cache,
            });
        }

        let span = info_span!("http_fetch", %run_id, item = %item, url = %url);
        self.fetch_from_network(item, url, fingerprint, cancel)
            .instrument(span)
            .await
    }

    async fn fetch_from_network(
        &self,
        item: &WorkItem,
        url: Url,
        fingerprint: Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<RawRecord, FetchError> {
        let policy = self.config.backoff;
        let cancelled = || FetchError::Cancelled {
            url: url.to_string(),
        };
        let mut attempts = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = self.limiter.acquire() => {}
            }
            attempts += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                res = tokio::time::timeout(self.config.request_timeout, self.upstream.get(&url)) => res,
            };

            let (kind, message, retry_after) = match outcome {
                Ok(Ok(resp)) => match classify_status(resp.status) {
                    None => {
                        let fetched_at = self.clock.now();
                        self.cache
                            .put(fingerprint, &url, &resp.body, fetched_at, self.config.ttl_for(item))
                            .await;
                        debug!(attempts, bytes = resp.body.len(), "fetched");
                        return Ok(RawRecord {
                            work_item: item.clone(),
                            body: resp.body,
                            fetched_at,
                            source: FetchSource::Network,
                        });
                    }
                    Some(kind) => (
                        kind,
                        format!("http status {}", resp.status.as_u16()),
                        resp.retry_after,
                    ),
                },
                Ok(Err(err)) => (err.kind(), err.to_string(), None),
                Err(_) => (
                    FetchErrorKind::Transient,
                    TransportError::Timeout.to_string(),
                    None,
                ),
            };

            let retry_index = attempts - 1;
            if kind == FetchErrorKind::Permanent || retry_index >= policy.max_retries {
                warn!(attempts, %kind, error = %message, "fetch failed");
                return Err(FetchError::Failed {
                    kind,
                    url: url.to_string(),
                    attempts,
                    message,
                });
            }

            let delay = policy.jittered_delay(retry_index);
            if kind == FetchErrorKind::RateLimited {
                // The penalty holds back every fetcher, this one included, at its next acquire.
                let penalty = retry_after.unwrap_or(delay);
                warn!(attempts, penalty_ms = penalty.as_millis() as u64, "upstream rate limited");
                self.limiter.penalize(penalty);
                continue;
            }

            warn!(attempts, delay_ms = delay.as_millis() as u64, error = %message, "transient fetch failure; retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
