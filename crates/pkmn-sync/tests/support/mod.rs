#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pkmn_core::{EntityKind, ManualClock, RunRecord, SnapshotDraft, SnapshotTable, StoredSnapshot};
use pkmn_storage::{StatusCode, TransportError, Upstream, UpstreamResponse, Url};
use pkmn_sync::{
    CatalogSelection, KindSelection, MemorySnapshotStore, SnapshotStore, StoreError, SyncConfig,
    SyncPipeline,
};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const BASE: &str = "http://pokeapi.test/api/v2/";

/// In-process stand-in for the catalog API: serves listings with absolute `next`
/// cursors and entity documents, with scriptable failures and latency.
#[derive(Debug, Default)]
pub struct FakePokeApi {
    catalog: Mutex<BTreeMap<EntityKind, BTreeMap<u32, Value>>>,
    fail_next: Mutex<HashMap<String, VecDeque<StatusCode>>>,
    fail_always: Mutex<HashMap<String, StatusCode>>,
    requests: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
    looping: Mutex<BTreeSet<EntityKind>>,
}

impl FakePokeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// bulbasaur, ivysaur, venusaur
    pub fn with_starters() -> Arc<Self> {
        let api = Self::new();
        api.put(EntityKind::Pokemon, 1, pokemon_body(1, "bulbasaur", 69));
        api.put(EntityKind::Pokemon, 2, pokemon_body(2, "ivysaur", 130));
        api.put(EntityKind::Pokemon, 3, pokemon_body(3, "venusaur", 1000));
        api
    }

    /// normal, fire, water
    pub fn with_types() -> Arc<Self> {
        let api = Self::new();
        api.put(EntityKind::Type, 1, type_body(1, "normal", &[], &[], &[]));
        api.put(EntityKind::Type, 10, type_body(10, "fire", &[], &["fire", "water"], &[]));
        api.put(EntityKind::Type, 11, type_body(11, "water", &["fire"], &["water"], &[]));
        api
    }

    pub fn put(&self, kind: EntityKind, id: u32, body: Value) {
        self.catalog
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .insert(id, body);
    }

    /// Answers the next requests for `path` (e.g. `pokemon/3`) with `statuses` first.
    pub fn fail_next(&self, path: &str, statuses: &[StatusCode]) {
        self.fail_next
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend(statuses.iter().copied());
    }

    pub fn fail_always(&self, path: &str, status: StatusCode) {
        self.fail_always.lock().unwrap().insert(path.to_string(), status);
    }

    /// Every listing page of `kind` points `next` back at the first page.
    pub fn loop_listing(&self, kind: EntityKind) {
        self.looping.lock().unwrap().insert(kind);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }

    fn listing(&self, kind: EntityKind, url: &Url) -> Value {
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let limit: usize = query.get("limit").and_then(|v| v.parse().ok()).unwrap_or(20);
        let offset: usize = query.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);

        let catalog = self.catalog.lock().unwrap();
        let ids: Vec<u32> = catalog
            .get(&kind)
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default();
        let results: Vec<Value> = ids
            .iter()
            .skip(offset)
            .take(limit)
            .map(|id| {
                let name = catalog[&kind][id]["name"].clone();
                json!({ "name": name, "url": format!("{BASE}{}/{id}/", kind.resource()) })
            })
            .collect();
        let next = if self.looping.lock().unwrap().contains(&kind) {
            Some(format!("{BASE}{}?offset=0&limit={limit}", kind.resource()))
        } else {
            (offset + limit < ids.len())
                .then(|| format!("{BASE}{}?offset={}&limit={limit}", kind.resource(), offset + limit))
        };
        json!({ "count": ids.len(), "next": next, "previous": null, "results": results })
    }
}

#[async_trait]
impl Upstream for FakePokeApi {
    async fn get(&self, url: &Url) -> Result<UpstreamResponse, TransportError> {
        let path = url
            .path()
            .trim_start_matches("/api/v2/")
            .trim_end_matches('/')
            .to_string();
        self.requests.lock().unwrap().push(path.clone());

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(status) = self.fail_always.lock().unwrap().get(&path) {
            return Ok(UpstreamResponse::status(*status));
        }
        let scripted = self
            .fail_next
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(VecDeque::pop_front);
        if let Some(status) = scripted {
            return Ok(UpstreamResponse::status(status));
        }

        let mut segments = path.split('/');
        let kind = segments.next().and_then(EntityKind::from_resource);
        let id = segments.next().map(|s| s.parse::<u32>());
        let body = match (kind, id) {
            (Some(kind), None) => Some(self.listing(kind, url)),
            (Some(kind), Some(Ok(id))) => self
                .catalog
                .lock()
                .unwrap()
                .get(&kind)
                .and_then(|entries| entries.get(&id))
                .cloned(),
            _ => None,
        };
        Ok(match body {
            Some(body) => UpstreamResponse::ok(serde_json::to_vec(&body).unwrap()),
            None => UpstreamResponse::status(StatusCode::NOT_FOUND),
        })
    }
}

pub fn pokemon_body(id: u32, name: &str, weight: u32) -> Value {
    json!({
        "id": id,
        "name": name,
        "height": 7,
        "weight": weight,
        "base_experience": 64,
        "is_default": true,
        "order": id,
        "stats": [
            { "base_stat": 45, "stat": { "name": "hp", "url": format!("{BASE}stat/1/") } }
        ],
        "types": [
            { "slot": 1, "type": { "name": "grass", "url": format!("{BASE}type/12/") } }
        ],
        "abilities": [
            { "slot": 1, "is_hidden": false, "ability": { "name": "overgrow", "url": format!("{BASE}ability/65/") } }
        ],
        "moves": []
    })
}

pub fn type_body(id: u32, name: &str, double: &[&str], half: &[&str], none: &[&str]) -> Value {
    let targets = |names: &[&str]| -> Vec<Value> {
        names
            .iter()
            .map(|n| json!({ "name": n, "url": format!("{BASE}type/{n}/") }))
            .collect()
    };
    json!({
        "id": id,
        "name": name,
        "damage_relations": {
            "double_damage_to": targets(double),
            "half_damage_to": targets(half),
            "no_damage_to": targets(none),
        }
    })
}

/// Memory store whose aggregate appends take `delay` each.
#[derive(Debug)]
pub struct SlowAggregateStore {
    inner: Arc<MemorySnapshotStore>,
    delay: Duration,
}

#[async_trait]
impl SnapshotStore for SlowAggregateStore {
    async fn latest(
        &self,
        table: SnapshotTable,
        identity: &str,
    ) -> Result<Option<StoredSnapshot>, StoreError> {
        self.inner.latest(table, identity).await
    }

    async fn history(
        &self,
        table: SnapshotTable,
        identity: &str,
    ) -> Result<Vec<StoredSnapshot>, StoreError> {
        self.inner.history(table, identity).await
    }

    async fn append_revision(
        &self,
        draft: &SnapshotDraft,
        expected_latest: Option<i64>,
        as_of: DateTime<Utc>,
    ) -> Result<StoredSnapshot, StoreError> {
        if draft.table == SnapshotTable::Aggregates {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.append_revision(draft, expected_latest, as_of).await
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.inner.record_run(record).await
    }
}

pub fn start_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
    ))
}

pub fn selection(kind: EntityKind, page_size: usize) -> CatalogSelection {
    limited_selection(kind, page_size, None)
}

pub fn limited_selection(kind: EntityKind, page_size: usize, limit: Option<usize>) -> CatalogSelection {
    CatalogSelection {
        page_size,
        kinds: vec![KindSelection {
            kind,
            enabled: true,
            limit,
        }],
    }
}

/// Everything one scenario needs; the cache dir outlives individual runs.
pub struct Harness {
    pub api: Arc<FakePokeApi>,
    pub store: Arc<MemorySnapshotStore>,
    pub clock: Arc<ManualClock>,
    pub cache_dir: TempDir,
    pub reports_dir: TempDir,
    pub pipeline: SyncPipeline,
}

impl Harness {
    pub fn new(api: Arc<FakePokeApi>, selection: CatalogSelection, env: &[(&str, &str)]) -> Self {
        Self::build(api, selection, env, None)
    }

    /// Uncached harness whose store spends `delay` on every aggregate append.
    pub fn with_slow_aggregates(
        api: Arc<FakePokeApi>,
        selection: CatalogSelection,
        env: &[(&str, &str)],
        delay: Duration,
    ) -> Self {
        Self::build(api, selection, env, Some(delay))
    }

    fn build(
        api: Arc<FakePokeApi>,
        selection: CatalogSelection,
        env: &[(&str, &str)],
        aggregate_delay: Option<Duration>,
    ) -> Self {
        let cache_dir = tempfile::tempdir().unwrap();
        let reports_dir = tempfile::tempdir().unwrap();
        let mut vars: HashMap<String, String> = HashMap::from([
            ("PKMN_API_BASE_URL".to_string(), BASE.to_string()),
            ("PKMN_RATE_LIMIT".to_string(), "1000".to_string()),
            ("PKMN_RATE_WINDOW_SECS".to_string(), "1".to_string()),
            ("PKMN_FETCH_WORKERS".to_string(), "3".to_string()),
            ("PKMN_CACHE_DIR".to_string(), cache_dir.path().display().to_string()),
            ("PKMN_REPORTS_DIR".to_string(), reports_dir.path().display().to_string()),
        ]);
        for (key, value) in env {
            vars.insert(key.to_string(), value.to_string());
        }
        let config = SyncConfig::from_lookup(|key| vars.get(key).cloned());

        let store = Arc::new(MemorySnapshotStore::new());
        let clock = start_clock();
        let pipeline = match aggregate_delay {
            None => SyncPipeline::with_upstream(config, selection, store.clone(), api.clone()),
            Some(delay) => {
                let slow = Arc::new(SlowAggregateStore {
                    inner: store.clone(),
                    delay,
                });
                SyncPipeline::with_upstream(config, selection, slow, api.clone()).without_cache()
            }
        }
        .with_clock(clock.clone());

        Self {
            api,
            store,
            clock,
            cache_dir,
            reports_dir,
            pipeline,
        }
    }
}
