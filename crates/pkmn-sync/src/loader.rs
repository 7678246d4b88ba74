use std::sync::Arc;

use pkmn_core::{Clock, DerivedAggregate, NormalizedEntity, ReconcileOutcome, SnapshotDraft};
use tracing::debug;

use crate::store::{SnapshotStore, StoreError};

/// Reconciles normalized values against the latest stored revision.
///
/// Reconciling is idempotent per identity: the same value twice yields `Inserted` then
/// `Unchanged`, and only a different content hash appends a new revision.
#[derive(Debug, Clone)]
pub struct IncrementalLoader {
    store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    max_conflict_retries: usize,
}

impl IncrementalLoader {
    pub fn new(store: Arc<dyn SnapshotStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_conflict_retries: 1,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: usize) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub async fn reconcile_entity(
        &self,
        entity: &NormalizedEntity,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.reconcile(&entity.to_snapshot_draft()).await
    }

    pub async fn reconcile_aggregate(
        &self,
        aggregate: &DerivedAggregate,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.reconcile(&aggregate.to_snapshot_draft()).await
    }

    /// A revision race is retried with a fresh read, up to `max_conflict_retries` times.
    pub async fn reconcile(&self, draft: &SnapshotDraft) -> Result<ReconcileOutcome, StoreError> {
        let mut conflicts = 0usize;
        loop {
            let latest = self.store.latest(draft.table, &draft.identity).await?;
            let expected = match &latest {
                Some(stored) if stored.content_hash == draft.content_hash => {
                    return Ok(ReconcileOutcome::Unchanged)
                }
                Some(stored) => Some(stored.revision),
                None => None,
            };

            match self
                .store
                .append_revision(draft, expected, self.clock.now())
                .await
            {
                Ok(stored) => {
                    debug!(identity = %draft.identity, revision = stored.revision, "revision appended");
                    return Ok(if expected.is_none() {
                        ReconcileOutcome::Inserted
                    } else {
                        ReconcileOutcome::Updated
                    });
                }
                Err(err) if err.is_conflict() && conflicts < self.max_conflict_retries => {
                    conflicts += 1;
                    debug!(identity = %draft.identity, error = %err, "revision race; re-reading");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
