use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pkmn_core::{sha256_hex, Clock};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const ENTRY_EXTENSION: &str = "entry";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest of the method, the URL without fragment or trailing slash, and the query
    /// pairs sorted and length-prefixed so distinct requests never share an encoding.
    pub fn for_request(method: &str, url: &Url) -> Self {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();

        let path = url.path();
        let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };

        let mut canonical = format!(
            "{}\n{}://{}:{}{}\n",
            method.to_ascii_uppercase(),
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default(),
            path
        );
        for (k, v) in &pairs {
            canonical.push_str(&format!("{}:{}={}:{}&", k.len(), k, v.len(), v));
        }
        Self(sha256_hex(canonical.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.fetched_at);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => age < ttl,
            Err(_) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt cache entry {path}")]
    Corrupt { path: String },
}

#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    async fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;
    async fn store(&self, entry: &CacheEntry) -> Result<(), CacheError>;
    async fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError>;
    /// Deletes entries no longer valid at `now`, returning how many were removed.
    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    fingerprint: Fingerprint,
    url: String,
    fetched_at: DateTime<Utc>,
    ttl_secs: u64,
    body_len: usize,
}

/// Filesystem cache: one `<root>/<fp[..2]>/<fp>.entry` file per fingerprint holding a
/// single-line JSON header followed by the raw body.
#[derive(Debug, Clone)]
pub struct FsCacheBackend {
    root: PathBuf,
}

impl FsCacheBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let fp = fingerprint.as_str();
        let shard = fp.get(..2).unwrap_or("00");
        self.root
            .join(shard)
            .join(format!("{fp}.{ENTRY_EXTENSION}"))
    }

    fn decode(path: &Path, bytes: &[u8]) -> Result<CacheEntry, CacheError> {
        let corrupt = || CacheError::Corrupt {
            path: path.display().to_string(),
        };
        let split = bytes.iter().position(|b| *b == b'\n').ok_or_else(corrupt)?;
        let header: EntryHeader = serde_json::from_slice(&bytes[..split])?;
        let body = bytes[split + 1..].to_vec();
        if body.len() != header.body_len {
            return Err(corrupt());
        }
        Ok(CacheEntry {
            fingerprint: header.fingerprint,
            url: header.url,
            body,
            fetched_at: header.fetched_at,
            ttl: Duration::from_secs(header.ttl_secs),
        })
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        match fs::read(path).await {
            Ok(bytes) => Self::decode(path, &bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl CacheBackend for FsCacheBackend {
    async fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        self.read_entry(&self.entry_path(fingerprint)).await
    }

    /// Writes to a temp file next to the target and renames it over the old entry, so
    /// readers see either the previous entry or the new one.
    async fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(&entry.fingerprint);
        let Some(parent) = path.parent() else {
            return Err(CacheError::Corrupt {
                path: path.display().to_string(),
            });
        };
        fs::create_dir_all(parent).await?;

        let header = EntryHeader {
            fingerprint: entry.fingerprint.clone(),
            url: entry.url.clone(),
            fetched_at: entry.fetched_at,
            ttl_secs: entry.ttl.as_secs(),
            body_len: entry.body.len(),
        };
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&entry.body);

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        match fs::remove_file(self.entry_path(fingerprint)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let mut removed = 0usize;
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                    continue;
                }
                let expired = match self.read_entry(&path).await {
                    Ok(Some(entry)) => !entry.is_valid_at(now),
                    Ok(None) => false,
                    Err(CacheError::Io(err)) => return Err(CacheError::Io(err)),
                    Err(_) => true,
                };
                if expired {
                    match fs::remove_file(&path).await {
                        Ok(()) => removed += 1,
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// TTL-aware facade over a [`CacheBackend`].
///
/// Backend failures are logged and swallowed: a broken cache behaves like an empty one
/// and never stops a run.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    backend: Option<Arc<dyn CacheBackend>>,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: Some(backend),
            clock,
        }
    }

    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: None,
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Returns the entry only while it is still inside its TTL.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let backend = self.backend.as_ref()?;
        match backend.load(fingerprint).await {
            Ok(Some(entry)) if entry.is_valid_at(self.clock.now()) => {
                debug!(%fingerprint, url = %entry.url, "cache hit");
                Some(entry)
            }
            Ok(Some(entry)) => {
                debug!(%fingerprint, url = %entry.url, "cache entry expired");
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(%fingerprint, error = %err, "cache unavailable; treating as miss");
                None
            }
        }
    }

    pub async fn put(
        &self,
        fingerprint: Fingerprint,
        url: &Url,
        body: &[u8],
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let entry = CacheEntry {
            fingerprint,
            url: url.to_string(),
            body: body.to_vec(),
            fetched_at,
            ttl,
        };
        if let Err(err) = backend.store(&entry).await {
            warn!(fingerprint = %entry.fingerprint, error = %err, "cache write failed");
        }
    }

    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        match backend.remove(fingerprint).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(%fingerprint, error = %err, "cache invalidation failed");
                false
            }
        }
    }

    pub async fn prune_expired(&self) -> usize {
        let Some(backend) = self.backend.as_ref() else {
            return 0;
        };
        match backend.remove_expired(self.clock.now()).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(error = %err, "cache prune failed");
                0
            }
        }
    }
}
