//! Core domain model for the Pokémon catalog ETL engine.

mod clock;
mod entity;
mod run;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{
    AbilityAttributes, AbilitySlot, AggregatePayload, DamageRelations, DefenseProfile,
    DerivedAggregate, EffectivenessCell, EntityAttributes, EntityKey, MoveLearn,
    NormalizedEntity, OffenseProfile, PokemonAttributes, StatValue, TypeAttributes, TypeProfile,
    TypeSlot,
};
pub use run::{
    AbortReason, FailureKind, ItemFailure, ReconcileCounts, ReconcileOutcome, RunCounts,
    RunRecord, RunStage,
};

pub const CRATE_NAME: &str = "pkmn-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Type,
    Ability,
    Pokemon,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Type, EntityKind::Ability, EntityKind::Pokemon];

    pub fn resource(&self) -> &'static str {
        match self {
            EntityKind::Type => "type",
            EntityKind::Ability => "ability",
            EntityKind::Pokemon => "pokemon",
        }
    }

    pub fn from_resource(resource: &str) -> Option<Self> {
        match resource.trim().to_ascii_lowercase().as_str() {
            "type" | "types" => Some(EntityKind::Type),
            "ability" | "abilities" => Some(EntityKind::Ability),
            "pokemon" => Some(EntityKind::Pokemon),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum WorkTarget {
    /// One catalog entity addressed by its numeric id.
    Entity(EntityKey),
    /// One listing page; the cursor is whatever the upstream handed back as `next`.
    Page { kind: EntityKind, cursor: String },
}

/// One unit of fetch work. Fields are private so an enqueued item cannot change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    target: WorkTarget,
    request_path: String,
}

impl WorkItem {
    pub fn entity(kind: EntityKind, id: u32) -> Self {
        Self {
            request_path: format!("{}/{}", kind.resource(), id),
            target: WorkTarget::Entity(EntityKey { kind, id }),
        }
    }

    pub fn page(kind: EntityKind, cursor: impl Into<String>) -> Self {
        let cursor = cursor.into();
        Self {
            request_path: cursor.clone(),
            target: WorkTarget::Page { kind, cursor },
        }
    }

    pub fn first_page(kind: EntityKind, page_size: usize) -> Self {
        Self::page(
            kind,
            format!("{}?limit={}&offset=0", kind.resource(), page_size.max(1)),
        )
    }

    pub fn target(&self) -> &WorkTarget {
        &self.target
    }

    /// Path relative to the API base URL, or an absolute URL for upstream cursors.
    pub fn request_path(&self) -> &str {
        &self.request_path
    }

    pub fn kind(&self) -> EntityKind {
        match &self.target {
            WorkTarget::Entity(key) => key.kind,
            WorkTarget::Page { kind, .. } => *kind,
        }
    }

    pub fn is_page(&self) -> bool {
        matches!(self.target, WorkTarget::Page { .. })
    }

    /// Stable human-readable label used in logs and run records.
    pub fn label(&self) -> String {
        match &self.target {
            WorkTarget::Entity(key) => key.identity(),
            WorkTarget::Page { kind, cursor } => format!("page:{kind}:{cursor}"),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Network,
    Cache,
}

/// As-fetched payload for one work item. Consumed by the transformer, then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub work_item: WorkItem,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub source: FetchSource,
}

impl RawRecord {
    pub fn from_cache(&self) -> bool {
        self.source == FetchSource::Cache
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTable {
    Entities,
    Aggregates,
}

impl SnapshotTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotTable::Entities => "entity_revisions",
            SnapshotTable::Aggregates => "aggregate_revisions",
        }
    }
}

/// Reconcile input: the identity, hash and payload of something that should be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDraft {
    pub table: SnapshotTable,
    pub identity: String,
    pub content_hash: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub table: SnapshotTable,
    pub identity: String,
    pub revision: i64,
    pub content_hash: String,
    pub payload: serde_json::Value,
    pub as_of: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl StoredSnapshot {
    pub fn is_current(&self) -> bool {
        self.superseded_at.is_none()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of the canonical JSON encoding of `value`.
///
/// Only types without map fields are hashed here, so serde's field order makes the
/// encoding canonical.
pub fn content_hash<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).expect("domain values always serialize to JSON");
    sha256_hex(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn entity_work_items_address_the_resource_path() {
        let item = WorkItem::entity(EntityKind::Pokemon, 25);
        assert_eq!(item.request_path(), "pokemon/25");
        assert_eq!(item.label(), "pokemon/25");
        assert_eq!(item.kind(), EntityKind::Pokemon);
        assert!(!item.is_page());
    }

    #[test]
    fn page_work_items_keep_the_cursor_opaque() {
        let cursor = "https://pokeapi.co/api/v2/type?offset=20&limit=20";
        let item = WorkItem::page(EntityKind::Type, cursor);
        assert_eq!(item.request_path(), cursor);
        assert!(item.is_page());

        let first = WorkItem::first_page(EntityKind::Ability, 0);
        assert_eq!(first.request_path(), "ability?limit=1&offset=0");
    }

    #[test]
    fn resource_names_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_resource(kind.resource()), Some(kind));
        }
        assert_eq!(EntityKind::from_resource("abilities"), Some(EntityKind::Ability));
        assert_eq!(EntityKind::from_resource("move"), None);
    }
}
