use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use pkmn_core::{
    AbortReason, Clock, DerivedAggregate, EntityKind, FailureKind, NormalizedEntity, RawRecord,
    RunRecord, RunStage, WorkItem, WorkTarget,
};
use pkmn_storage::{FetchError, FetchErrorKind};
use pkmn_transform::{derive_aggregates, normalize, parse_listing_page};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::loader::IncrementalLoader;
use crate::pool::{FetchOutcome, FetcherPool, PoolHandle};
use crate::store::{SnapshotStore, StoreError};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Kinds to enumerate, with an optional cap on entities per kind.
    pub plan: Vec<(EntityKind, Option<usize>)>,
    pub page_size: usize,
    pub breaker: BreakerConfig,
    pub deadline: Option<Duration>,
    /// Log a progress line every this many finished work items.
    pub progress_every: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            plan: EntityKind::ALL.iter().map(|k| (*k, None)).collect(),
            page_size: 100,
            breaker: BreakerConfig::default(),
            deadline: None,
            progress_every: 50,
        }
    }
}

/// Enumeration state of one entity kind.
#[derive(Debug)]
struct KindProgress {
    limit: Option<usize>,
    enumerated: usize,
    cursors: HashSet<String>,
    seen_ids: HashSet<u32>,
    /// Every listing page and every enumerated entity of the kind went through.
    complete: bool,
    /// The limit cut enumeration short of the upstream's full list.
    truncated: bool,
}

impl KindProgress {
    fn has_room(&self) -> bool {
        self.limit.map_or(true, |limit| self.enumerated < limit)
    }
}

/// Drives one run: enumerate, fetch, normalize and load entities as they stream in,
/// then derive and load aggregates.
#[derive(Debug, Clone)]
pub struct PipelineCoordinator {
    pool: FetcherPool,
    loader: IncrementalLoader,
    clock: Arc<dyn Clock>,
    options: PipelineOptions,
}

struct RunState {
    record: RunRecord,
    kinds: HashMap<EntityKind, KindProgress>,
    types: Vec<NormalizedEntity>,
    breaker: CircuitBreaker,
    abort: Option<AbortReason>,
    finished_items: usize,
}

impl PipelineCoordinator {
    pub fn new(
        pool: FetcherPool,
        loader: IncrementalLoader,
        clock: Arc<dyn Clock>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            pool,
            loader,
            clock,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        self.loader.store()
    }

    /// Executes one run to a terminal stage. Item failures end up in the record; only a
    /// tripped breaker, cancellation or the deadline fail the run as a whole.
    pub async fn run(&self, cancel: CancellationToken) -> RunRecord {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_with_id(run_id, cancel).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid, cancel: CancellationToken) -> RunRecord {
        let mut state = RunState {
            record: RunRecord::new(run_id, self.clock.now()),
            kinds: self
                .options
                .plan
                .iter()
                .map(|(kind, limit)| {
                    (
                        *kind,
                        KindProgress {
                            limit: *limit,
                            enumerated: 0,
                            cursors: HashSet::new(),
                            seen_ids: HashSet::new(),
                            complete: true,
                            truncated: false,
                        },
                    )
                })
                .collect(),
            types: Vec::new(),
            breaker: CircuitBreaker::new(self.options.breaker),
            abort: None,
            finished_items: 0,
        };
        info!(kinds = ?self.options.plan, workers = self.pool.workers(), "sync run starting");

        let run_token = cancel.child_token();
        let deadline = self.options.deadline.map(|d| Instant::now() + d);
        advance(&mut state.record, RunStage::Fetching);
        self.stream_entities(run_id, &run_token, deadline, &mut state).await;

        if state.abort.is_none() && cancel.is_cancelled() {
            state.abort = Some(AbortReason::Cancelled);
        }
        if state.abort.is_none() {
            advance(&mut state.record, RunStage::Transforming);
            let aggregates = self.derive(&state);

            advance(&mut state.record, RunStage::Loading);
            if let Some(aggregates) = aggregates {
                self.load_aggregates(&aggregates, &cancel, deadline, &mut state).await;
            }
        }

        match state.abort.take() {
            Some(reason) => {
                warn!(?reason, "sync run aborted");
                state.record.abort_reason = Some(reason);
                advance(&mut state.record, RunStage::Failed);
            }
            None => advance(&mut state.record, RunStage::Completed),
        }
        state.record.finished_at = Some(self.clock.now());

        let counts = state.record.counts;
        info!(
            status = %state.record.status,
            fetched = counts.fetched,
            cache_hit = counts.cache_hit,
            failed = counts.failed,
            inserted = counts.inserted,
            updated = counts.updated,
            unchanged = counts.unchanged,
            "sync run finished"
        );

        if let Err(err) = self.store().record_run(&state.record).await {
            warn!(error = %err, "failed to persist run record");
        }
        state.record
    }

    async fn stream_entities(
        &self,
        run_id: Uuid,
        run_token: &CancellationToken,
        deadline: Option<Instant>,
        state: &mut RunState,
    ) {
        let mut pool = self.pool.spawn(run_id, run_token.clone());
        for (kind, limit) in &self.options.plan {
            let page_size = limit.map_or(self.options.page_size, |l| l.min(self.options.page_size));
            if page_size == 0 {
                continue;
            }
            let first = WorkItem::first_page(*kind, page_size);
            if let Some(progress) = state.kinds.get_mut(kind) {
                progress.cursors.insert(first.request_path().to_string());
            }
            pool.submit(first);
        }

        loop {
            let outcome = tokio::select! {
                biased;
                _ = sleep_until(deadline), if state.abort.is_none() => {
                    warn!("run deadline reached; cancelling");
                    state.abort = Some(AbortReason::DeadlineExceeded);
                    run_token.cancel();
                    continue;
                }
                outcome = pool.next_outcome() => outcome,
            };
            let Some(FetchOutcome { item, result }) = outcome else {
                break;
            };
            let cancelled = matches!(result, Err(FetchError::Cancelled { .. }));
            let ok = match result {
                Ok(raw) => self.handle_record(raw, &mut pool, state).await,
                Err(err) => {
                    self.handle_fetch_error(&item, err, state);
                    false
                }
            };
            if cancelled {
                continue;
            }

            state.finished_items += 1;
            let tripped = if ok {
                state.breaker.record_success();
                None
            } else {
                state.breaker.record_failure()
            };
            if let Some(reason) = tripped {
                if state.abort.is_none() {
                    warn!(?reason, "circuit breaker tripped; cancelling run");
                    state.abort = Some(reason);
                }
                run_token.cancel();
            }

            if self.options.progress_every > 0 && state.finished_items % self.options.progress_every == 0 {
                info!(
                    finished = state.finished_items,
                    pending = pool.in_flight(),
                    failed = state.record.counts.failed,
                    "sync progress"
                );
            }
        }
        pool.shutdown().await;
    }

    /// Returns whether the item succeeded.
    async fn handle_record(
        &self,
        raw: RawRecord,
        pool: &mut PoolHandle,
        state: &mut RunState,
    ) -> bool {
        if raw.from_cache() {
            state.record.counts.cache_hit += 1;
        } else {
            state.record.counts.fetched += 1;
        }

        if let WorkTarget::Page { kind, .. } = raw.work_item.target() {
            let kind = *kind;
            return match parse_listing_page(&raw.body) {
                Ok(page) => {
                    let Some(progress) = state.kinds.get_mut(&kind) else {
                        return true;
                    };
                    for item in page.work_items(kind) {
                        if !progress.has_room() {
                            progress.truncated = true;
                            break;
                        }
                        if let WorkTarget::Entity(key) = item.target() {
                            if !progress.seen_ids.insert(key.id) {
                                debug!(%item, "already enumerated this run");
                                continue;
                            }
                        }
                        progress.enumerated += 1;
                        pool.submit(item);
                    }
                    if let Some(next) = page.next {
                        if !progress.has_room() {
                            progress.truncated = true;
                        } else if progress.cursors.insert(next.clone()) {
                            pool.submit(WorkItem::page(kind, next));
                        } else {
                            warn!(%kind, cursor = %next, "listing cursor repeated; stopping enumeration");
                            progress.complete = false;
                        }
                    }
                    debug!(%kind, enumerated = progress.enumerated, "listing page processed");
                    true
                }
                Err(err) => {
                    self.mark_incomplete(kind, state);
                    state
                        .record
                        .record_failure(raw.work_item.label(), FailureKind::Malformed, err.to_string());
                    false
                }
            };
        }

        let kind = raw.work_item.kind();
        let entity = match normalize(&raw) {
            Ok(entity) => entity,
            Err(err) => {
                warn!(item = %raw.work_item, error = %err, "malformed record");
                self.mark_incomplete(kind, state);
                state
                    .record
                    .record_failure(raw.work_item.label(), FailureKind::Malformed, err.to_string());
                return false;
            }
        };

        match self.loader.reconcile_entity(&entity).await {
            Ok(outcome) => {
                debug!(entity = %entity.key(), ?outcome, "reconciled");
                state.record.counts.record_reconcile(outcome);
                if kind == EntityKind::Type {
                    state.types.push(entity);
                }
                true
            }
            Err(err) => {
                warn!(entity = %entity.key(), error = %err, "reconcile failed");
                self.mark_incomplete(kind, state);
                state
                    .record
                    .record_failure(raw.work_item.label(), storage_failure_kind(&err), err.to_string());
                false
            }
        }
    }

    fn handle_fetch_error(&self, item: &WorkItem, err: FetchError, state: &mut RunState) {
        let kind = match err.kind() {
            Some(FetchErrorKind::Transient) => FailureKind::FetchTransient,
            Some(FetchErrorKind::Permanent) => FailureKind::FetchPermanent,
            Some(FetchErrorKind::RateLimited) => FailureKind::FetchRateLimited,
            None => {
                debug!(%item, "fetch cancelled in flight");
                return;
            }
        };
        warn!(%item, error = %err, "fetch failed");
        self.mark_incomplete(item.kind(), state);
        state.record.record_failure(item.label(), kind, err.to_string());
    }

    fn mark_incomplete(&self, kind: EntityKind, state: &mut RunState) {
        if let Some(progress) = state.kinds.get_mut(&kind) {
            progress.complete = false;
        }
    }

    /// Aggregates only when the whole Type list normalized and loaded, so a partial
    /// matrix never supersedes a complete one.
    fn derive(&self, state: &RunState) -> Option<Vec<DerivedAggregate>> {
        let types = state.kinds.get(&EntityKind::Type)?;
        if !types.complete {
            warn!("type catalog incomplete this run; skipping aggregate derivation");
            return None;
        }
        if types.truncated {
            warn!(limit = ?types.limit, "type selection is limited; skipping aggregate derivation");
            return None;
        }
        if state.types.is_empty() {
            return None;
        }
        let aggregates = derive_aggregates(&state.types);
        info!(types = state.types.len(), aggregates = aggregates.len(), "aggregates derived");
        Some(aggregates)
    }

    async fn load_aggregates(
        &self,
        aggregates: &[DerivedAggregate],
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        state: &mut RunState,
    ) {
        let mut all_loaded = true;
        for aggregate in aggregates {
            if cancel.is_cancelled() {
                state.abort = Some(AbortReason::Cancelled);
                return;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("run deadline reached while loading aggregates");
                state.abort = Some(AbortReason::DeadlineExceeded);
                return;
            }
            match self.loader.reconcile_aggregate(aggregate).await {
                Ok(outcome) => state.record.aggregates.record(outcome),
                Err(err) => {
                    all_loaded = false;
                    warn!(aggregate = aggregate.key(), error = %err, "aggregate reconcile failed");
                    state.record.record_failure(
                        aggregate.key(),
                        storage_failure_kind(&err),
                        err.to_string(),
                    );
                }
            }
        }
        state.record.aggregates_derived = all_loaded;
    }
}

fn storage_failure_kind(err: &StoreError) -> FailureKind {
    if err.is_conflict() {
        FailureKind::StorageConflict
    } else {
        FailureKind::Storage
    }
}

fn advance(record: &mut RunRecord, next: RunStage) {
    debug_assert!(
        record.status.can_transition_to(next),
        "illegal run transition {} -> {}",
        record.status,
        next
    );
    debug!(from = %record.status, to = %next, "run stage");
    record.status = next;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
