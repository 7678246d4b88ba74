use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pkmn_core::{RunRecord, SnapshotDraft, SnapshotTable, StoredSnapshot};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("revision conflict on {table}/{identity}: expected latest {expected:?}, found {found:?}")]
    Conflict {
        table: &'static str,
        identity: String,
        expected: Option<i64>,
        found: Option<i64>,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Append-only revision log for entities and aggregates, keyed by
/// `(identity, revision)`.
#[async_trait]
pub trait SnapshotStore: Send + Sync + Debug {
    async fn latest(
        &self,
        table: SnapshotTable,
        identity: &str,
    ) -> Result<Option<StoredSnapshot>, StoreError>;

    /// All revisions of `identity`, oldest first.
    async fn history(
        &self,
        table: SnapshotTable,
        identity: &str,
    ) -> Result<Vec<StoredSnapshot>, StoreError>;

    /// Atomically supersedes revision `expected_latest` (if any) and appends the next
    /// revision. Fails with [`StoreError::Conflict`] when the current revision is no
    /// longer `expected_latest`; nothing is written in that case.
    async fn append_revision(
        &self,
        draft: &SnapshotDraft,
        expected_latest: Option<i64>,
        as_of: DateTime<Utc>,
    ) -> Result<StoredSnapshot, StoreError>;

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError>;
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    revisions: Mutex<HashMap<(SnapshotTable, String), Vec<StoredSnapshot>>>,
    runs: Mutex<Vec<RunRecord>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of current revisions in `table`.
    pub fn current_count(&self, table: SnapshotTable) -> usize {
        self.revisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|((t, _), revs)| *t == table && revs.iter().any(StoredSnapshot::is_current))
            .count()
    }

    pub fn identities(&self, table: SnapshotTable) -> Vec<String> {
        let mut ids: Vec<String> = self
            .revisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|(t, _)| *t == table)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn latest(
        &self,
        table: SnapshotTable,
        identity: &str,
    ) -> Result<Option<StoredSnapshot>, StoreError> {
        let revisions = self.revisions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(revisions
            .get(&(table, identity.to_string()))
            .and_then(|revs| revs.iter().find(|r| r.is_current()).cloned()))
    }

    async fn history(
        &self,
        table: SnapshotTable,
        identity: &str,
    ) -> Result<Vec<StoredSnapshot>, StoreError> {
        let revisions = self.revisions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(revisions
            .get(&(table, identity.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn append_revision(
        &self,
        draft: &SnapshotDraft,
        expected_latest: Option<i64>,
        as_of: DateTime<Utc>,
    ) -> Result<StoredSnapshot, StoreError> {
        let mut revisions = self.revisions.lock().unwrap_or_else(|e| e.into_inner());
        let revs = revisions
            .entry((draft.table, draft.identity.clone()))
            .or_default();

        let current = revs.iter().position(StoredSnapshot::is_current);
        let found = current.map(|i| revs[i].revision);
        if found != expected_latest {
            return Err(StoreError::Conflict {
                table: draft.table.as_str(),
                identity: draft.identity.clone(),
                expected: expected_latest,
                found,
            });
        }

        if let Some(i) = current {
            revs[i].superseded_at = Some(as_of);
        }
        let stored = StoredSnapshot {
            table: draft.table,
            identity: draft.identity.clone(),
            revision: found.unwrap_or(0) + 1,
            content_hash: draft.content_hash.clone(),
            payload: draft.payload.clone(),
            as_of,
            superseded_at: None,
        };
        revs.push(stored.clone());
        Ok(stored)
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        match runs.iter_mut().find(|r| r.run_id == record.run_id) {
            Some(existing) => *existing = record.clone(),
            None => runs.push(record.clone()),
        }
        Ok(())
    }
}

const UNIQUE_VIOLATION: &str = "23505";

/// Postgres-backed store over the tables created by `migrations/`.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn snapshot_from_row(table: SnapshotTable, row: &PgRow) -> Result<StoredSnapshot, StoreError> {
        Ok(StoredSnapshot {
            table,
            identity: row.try_get("identity")?,
            revision: row.try_get("revision")?,
            content_hash: row.try_get("content_hash")?,
            payload: row.try_get("payload")?,
            as_of: row.try_get("as_of")?,
            superseded_at: row.try_get("superseded_at")?,
        })
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn latest(
        &self,
        table: SnapshotTable,
        identity: &str,
    ) -> Result<Option<StoredSnapshot>, StoreError> {
        let sql = format!(
            r#"
            SELECT identity, revision, content_hash, payload, as_of, superseded_at
              FROM {}
             WHERE identity = $1
               AND superseded_at IS NULL
            "#,
            table.as_str()
        );
        let row = sqlx::query(&sql)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::snapshot_from_row(table, &r)).transpose()
    }

    async fn history(
        &self,
        table: SnapshotTable,
        identity: &str,
    ) -> Result<Vec<StoredSnapshot>, StoreError> {
        let sql = format!(
            r#"
            SELECT identity, revision, content_hash, payload, as_of, superseded_at
              FROM {}
             WHERE identity = $1
             ORDER BY revision
            "#,
            table.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(identity)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::snapshot_from_row(table, r))
            .collect()
    }

    async fn append_revision(
        &self,
        draft: &SnapshotDraft,
        expected_latest: Option<i64>,
        as_of: DateTime<Utc>,
    ) -> Result<StoredSnapshot, StoreError> {
        let table = draft.table.as_str();
        let conflict = |found: Option<i64>| StoreError::Conflict {
            table,
            identity: draft.identity.clone(),
            expected: expected_latest,
            found,
        };

        let mut tx = self.pool.begin().await?;

        let current: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT revision FROM {table} WHERE identity = $1 AND superseded_at IS NULL FOR UPDATE"
        ))
        .bind(&draft.identity)
        .fetch_optional(&mut *tx)
        .await?;
        if current != expected_latest {
            return Err(conflict(current));
        }

        if let Some(revision) = current {
            let updated = sqlx::query(&format!(
                "UPDATE {table} SET superseded_at = $3 WHERE identity = $1 AND revision = $2 AND superseded_at IS NULL"
            ))
            .bind(&draft.identity)
            .bind(revision)
            .bind(as_of)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() != 1 {
                return Err(conflict(None));
            }
        }

        let revision = current.unwrap_or(0) + 1;
        let inserted = sqlx::query(&format!(
            "INSERT INTO {table} (identity, revision, content_hash, payload, as_of) VALUES ($1, $2, $3, $4, $5)"
        ))
        .bind(&draft.identity)
        .bind(revision)
        .bind(&draft.content_hash)
        .bind(&draft.payload)
        .bind(as_of)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                return Err(conflict(current));
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await?;

        Ok(StoredSnapshot {
            table: draft.table,
            identity: draft.identity.clone(),
            revision,
            content_hash: draft.content_hash.clone(),
            payload: draft.payload.clone(),
            as_of,
            superseded_at: None,
        })
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let json = serde_json::to_value(record)?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (run_id, started_at, finished_at, status, record)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (run_id) DO UPDATE
               SET finished_at = EXCLUDED.finished_at,
                   status = EXCLUDED.status,
                   record = EXCLUDED.record
            "#,
        )
        .bind(record.run_id)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.status.to_string())
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
