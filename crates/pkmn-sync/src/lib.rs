//! Orchestration layer: configuration, snapshot stores, the incremental loader, the
//! fetcher pool and the coordinator that ties one sync run together.

mod breaker;
mod config;
mod coordinator;
mod loader;
mod pool;
mod report;
mod store;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use pkmn_core::{Clock, RunRecord, SystemClock};
use pkmn_storage::{
    Fetcher, Fingerprint, FsCacheBackend, HttpUpstream, RateLimiter, ResponseCache, Upstream,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use config::{CatalogSelection, KindSelection, SyncConfig};
pub use coordinator::{PipelineCoordinator, PipelineOptions};
pub use loader::IncrementalLoader;
pub use pool::{FetchOutcome, FetcherPool, PoolHandle};
pub use report::{render_summary, write_reports};
pub use store::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore, StoreError};

pub const CRATE_NAME: &str = "pkmn-sync";

/// Long-lived pipeline: owns the shared rate limiter, so consecutive runs in one process
/// draw from the same request budget.
#[derive(Debug)]
pub struct SyncPipeline {
    config: SyncConfig,
    selection: CatalogSelection,
    store: Arc<dyn SnapshotStore>,
    upstream: Arc<dyn Upstream>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    use_cache: bool,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        selection: CatalogSelection,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        let upstream = HttpUpstream::new(config.http_upstream_config())?;
        Ok(Self::with_upstream(config, selection, store, Arc::new(upstream)))
    }

    pub fn with_upstream(
        config: SyncConfig,
        selection: CatalogSelection,
        store: Arc<dyn SnapshotStore>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
        Self {
            config,
            selection,
            store,
            upstream,
            limiter,
            clock: Arc::new(SystemClock),
            use_cache: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bypasses the response cache for this pipeline even when a cache dir is configured.
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn coordinator(&self) -> Result<PipelineCoordinator> {
        let cache = if self.use_cache {
            response_cache(&self.config, self.clock.clone())
        } else {
            ResponseCache::disabled(self.clock.clone())
        };
        let fetcher = Fetcher::new(
            self.upstream.clone(),
            self.limiter.clone(),
            cache,
            self.clock.clone(),
            self.config.fetcher_config()?,
        );
        let pool = FetcherPool::new(fetcher, self.config.fetch_workers, self.config.queue_capacity);
        let loader = IncrementalLoader::new(self.store.clone(), self.clock.clone());
        let options = PipelineOptions {
            plan: self.selection.plan(),
            page_size: self.selection.page_size.max(1),
            breaker: self.config.breaker_config(),
            deadline: self.config.run_deadline(),
            ..PipelineOptions::default()
        };
        Ok(PipelineCoordinator::new(pool, loader, self.clock.clone(), options))
    }

    /// Runs once and writes the run reports when a reports dir is configured. Only setup
    /// and report I/O errors surface here; run failures are in the returned record.
    pub async fn run_once(&self, cancel: CancellationToken) -> Result<RunRecord> {
        let record = self.coordinator()?.run(cancel).await;
        if let Some(dir) = &self.config.reports_dir {
            let run_dir = write_reports(dir, &record).await?;
            info!(reports = %run_dir.display(), "run reports written");
        }
        Ok(record)
    }
}

/// Cache configured by `config`, or a disabled one when no cache dir is set.
pub fn response_cache(config: &SyncConfig, clock: Arc<dyn Clock>) -> ResponseCache {
    match &config.cache_dir {
        Some(dir) => ResponseCache::new(Arc::new(FsCacheBackend::new(dir.clone())), clock),
        None => ResponseCache::disabled(clock),
    }
}

pub async fn open_store(config: &SyncConfig, in_memory: bool) -> Result<Arc<dyn SnapshotStore>> {
    if in_memory {
        return Ok(Arc::new(MemorySnapshotStore::new()));
    }
    let store = PgSnapshotStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(Arc::new(store))
}

pub async fn prune_cache(config: &SyncConfig) -> Result<usize> {
    let cache = enabled_cache(config)?;
    Ok(cache.prune_expired().await)
}

/// Drops the cached response for `path` (relative to the API base URL, e.g.
/// `pokemon/25`). Returns whether an entry existed.
pub async fn invalidate_cached_path(config: &SyncConfig, path: &str) -> Result<bool> {
    let cache = enabled_cache(config)?;
    let base = config.fetcher_config()?.base_url;
    let url = base
        .join(path.trim_start_matches('/'))
        .with_context(|| format!("resolving {path} against {base}"))?;
    Ok(cache.invalidate(&Fingerprint::for_request("GET", &url)).await)
}

fn enabled_cache(config: &SyncConfig) -> Result<ResponseCache> {
    let cache = response_cache(config, Arc::new(SystemClock));
    if !cache.is_enabled() {
        bail!("no cache directory configured (PKMN_CACHE_DIR)");
    }
    Ok(cache)
}

