use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Per-run state machine. `Failed` is reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Pending,
    Fetching,
    Transforming,
    Loading,
    Completed,
    Failed,
}

impl RunStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Completed | RunStage::Failed)
    }

    pub fn can_transition_to(&self, next: RunStage) -> bool {
        use RunStage::*;
        match (self, next) {
            (Pending, Fetching) | (Fetching, Transforming) | (Transforming, Loading) => true,
            (Loading, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStage::Pending => "pending",
            RunStage::Fetching => "fetching",
            RunStage::Transforming => "transforming",
            RunStage::Loading => "loading",
            RunStage::Completed => "completed",
            RunStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FetchTransient,
    FetchPermanent,
    FetchRateLimited,
    Malformed,
    StorageConflict,
    Storage,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::FetchTransient => "fetch_transient",
            FailureKind::FetchPermanent => "fetch_permanent",
            FailureKind::FetchRateLimited => "fetch_rate_limited",
            FailureKind::Malformed => "malformed",
            FailureKind::StorageConflict => "storage_conflict",
            FailureKind::Storage => "storage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    CircuitBreakerTripped { failed: usize, attempted: usize },
    Cancelled,
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl ReconcileCounts {
    pub fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Inserted => self.inserted += 1,
            ReconcileOutcome::Updated => self.updated += 1,
            ReconcileOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Work item counters. `fetched` counts network fetches, `cache_hit` cache-served
/// items; reconcile counters cover catalog entities only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: usize,
    pub cache_hit: usize,
    pub failed: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub inserted: usize,
}

impl RunCounts {
    pub fn record_reconcile(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Inserted => self.inserted += 1,
            ReconcileOutcome::Updated => self.updated += 1,
            ReconcileOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStage,
    pub counts: RunCounts,
    pub aggregates: ReconcileCounts,
    pub aggregates_derived: bool,
    pub failures: Vec<ItemFailure>,
    pub abort_reason: Option<AbortReason>,
}

impl RunRecord {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            status: RunStage::Pending,
            counts: RunCounts::default(),
            aggregates: ReconcileCounts::default(),
            aggregates_derived: false,
            failures: Vec::new(),
            abort_reason: None,
        }
    }

    pub fn record_failure(&mut self, item: impl Into<String>, kind: FailureKind, message: impl Into<String>) {
        self.counts.failed += 1;
        self.failures.push(ItemFailure {
            item: item.into(),
            kind,
            message: message.into(),
        });
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStage::Completed
    }

    pub fn failures_of(&self, kind: FailureKind) -> impl Iterator<Item = &ItemFailure> {
        self.failures.iter().filter(move |f| f.kind == kind)
    }
}
