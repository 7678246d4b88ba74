use std::sync::Arc;

use pkmn_core::{RawRecord, WorkItem};
use pkmn_storage::{FetchError, Fetcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct FetchOutcome {
    pub item: WorkItem,
    pub result: Result<RawRecord, FetchError>,
}

/// Fixed set of fetch workers sharing one work queue.
///
/// Work is enqueued without bound; finished fetches go through a bounded channel, so a
/// slow consumer stalls the workers instead of piling up fetched bodies.
#[derive(Debug, Clone)]
pub struct FetcherPool {
    fetcher: Fetcher,
    workers: usize,
    queue_capacity: usize,
}

impl FetcherPool {
    pub fn new(fetcher: Fetcher, workers: usize, queue_capacity: usize) -> Self {
        Self {
            fetcher,
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn spawn(&self, run_id: Uuid, cancel: CancellationToken) -> PoolHandle {
        let (work_tx, work_rx) = mpsc::unbounded_channel::<WorkItem>();
        let (outcome_tx, outcome_rx) = mpsc::channel::<FetchOutcome>(self.queue_capacity);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut tasks = JoinSet::new();
        for worker in 0..self.workers {
            let fetcher = self.fetcher.clone();
            let work_rx = Arc::clone(&work_rx);
            let outcome_tx = outcome_tx.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                loop {
                    let next = {
                        let mut rx = work_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            item = rx.recv() => item,
                        }
                    };
                    let Some(item) = next else {
                        break;
                    };
                    let result = fetcher.fetch(run_id, &item, &cancel).await;
                    if outcome_tx.send(FetchOutcome { item, result }).await.is_err() {
                        break;
                    }
                }
                debug!(worker, "fetch worker stopped");
            });
        }

        PoolHandle {
            work_tx: Some(work_tx),
            outcomes: outcome_rx,
            tasks,
            in_flight: 0,
        }
    }
}

#[derive(Debug)]
pub struct PoolHandle {
    work_tx: Option<mpsc::UnboundedSender<WorkItem>>,
    outcomes: mpsc::Receiver<FetchOutcome>,
    tasks: JoinSet<()>,
    in_flight: usize,
}

impl PoolHandle {
    /// Queues `item`; returns false once the pool is closed.
    pub fn submit(&mut self, item: WorkItem) -> bool {
        match &self.work_tx {
            Some(tx) if tx.send(item).is_ok() => {
                self.in_flight += 1;
                true
            }
            _ => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Next finished fetch, or `None` when nothing is outstanding or every worker has
    /// stopped.
    pub async fn next_outcome(&mut self) -> Option<FetchOutcome> {
        if self.in_flight == 0 {
            return None;
        }
        let outcome = self.outcomes.recv().await?;
        self.in_flight -= 1;
        Some(outcome)
    }

    /// Closes the queue and waits for every worker to exit. Items still queued are
    /// dropped.
    pub async fn shutdown(mut self) {
        self.work_tx.take();
        self.outcomes.close();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                tracing::warn!(error = %err, "fetch worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use pkmn_core::{EntityKind, ManualClock};
    use pkmn_storage::{
        FetcherConfig, RateLimitConfig, RateLimiter, ResponseCache, StatusCode, TransportError,
        Upstream, UpstreamResponse, Url,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echoes the path back; `/pokemon/13` answers 404.
    #[derive(Debug, Default)]
    struct EchoUpstream {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for EchoUpstream {
        async fn get(&self, url: &Url) -> Result<UpstreamResponse, TransportError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if url.path().ends_with("/13") {
                return Ok(UpstreamResponse::status(StatusCode::NOT_FOUND));
            }
            Ok(UpstreamResponse::ok(url.path().as_bytes().to_vec()))
        }
    }

    fn pool(upstream: Arc<EchoUpstream>, workers: usize) -> FetcherPool {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
        ));
        let fetcher = Fetcher::new(
            upstream,
            Arc::new(RateLimiter::new(RateLimitConfig {
                max_requests: 1000,
                window: Duration::from_secs(1),
            })),
            ResponseCache::disabled(clock.clone()),
            clock,
            FetcherConfig::new(Url::parse("http://pokeapi.test/api/v2/").unwrap()),
        );
        FetcherPool::new(fetcher, workers, 2)
    }

    #[tokio::test(start_paused = true)]
    async fn every_item_yields_exactly_one_outcome() {
        let upstream = Arc::new(EchoUpstream::default());
        let mut handle = pool(upstream.clone(), 3).spawn(Uuid::new_v4(), CancellationToken::new());
        for id in 10..20 {
            assert!(handle.submit(WorkItem::entity(EntityKind::Pokemon, id)));
        }

        let mut seen = Vec::new();
        let mut failed = Vec::new();
        while let Some(outcome) = handle.next_outcome().await {
            match outcome.result {
                Ok(raw) => seen.push(String::from_utf8(raw.body).unwrap()),
                Err(_) => failed.push(outcome.item.label()),
            }
        }
        handle.shutdown().await;

        seen.sort();
        assert_eq!(seen.len(), 9);
        assert_eq!(seen[0], "/api/v2/pokemon/10");
        assert_eq!(failed, vec!["pokemon/13".to_string()]);
        assert!(upstream.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_workers() {
        let upstream = Arc::new(EchoUpstream::default());
        let cancel = CancellationToken::new();
        let mut handle = pool(upstream, 1).spawn(Uuid::new_v4(), cancel.clone());
        for id in 1..50 {
            handle.submit(WorkItem::entity(EntityKind::Pokemon, id));
        }

        let first = handle.next_outcome().await.expect("one outcome");
        assert!(first.result.is_ok());
        cancel.cancel();

        let mut drained = 0;
        while handle.next_outcome().await.is_some() {
            drained += 1;
        }
        assert!(drained < 48);
        assert!(handle.in_flight() > 0);
        handle.shutdown().await;
    }
}
