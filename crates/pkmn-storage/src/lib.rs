//! Network-facing leaves of the pipeline: the shared rate limiter, the durable
//! response cache, the upstream HTTP transport and the retrying fetcher built on them.

mod cache;
mod fetch;
mod rate_limit;
mod upstream;

pub use cache::{CacheBackend, CacheEntry, CacheError, Fingerprint, FsCacheBackend, ResponseCache};
pub use fetch::{BackoffPolicy, FetchError, FetchErrorKind, Fetcher, FetcherConfig};
pub use rate_limit::{RateLimitConfig, RateLimiter, RatePermit};
pub use upstream::{
    classify_reqwest_error, classify_status, parse_retry_after, HttpUpstream, HttpUpstreamConfig,
    TransportError, Upstream, UpstreamResponse,
};

pub use reqwest::{StatusCode, Url};

pub const CRATE_NAME: &str = "pkmn-storage";
