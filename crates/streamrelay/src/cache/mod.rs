// Persistent Segment Cache: size- and age-bounded on-disk store of segment bytes.
//
// Layout: one `<sha256>.bin` payload plus one `<sha256>.json` sidecar per entry.
// An in-memory index mirrors the sidecars and is rebuilt when the cache is opened.

mod entry;
mod key;

pub use entry::{CacheEntryMeta, CacheStats};
pub use key::CacheKey;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;

const PAYLOAD_EXT: &str = "bin";
const SIDECAR_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";

/// A cache hit.
#[derive(Debug, Clone)]
pub struct CachedSegment {
    pub meta: CacheEntryMeta,
    pub bytes: Bytes,
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CleanupReport {
    pub expired: usize,
    pub evicted: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.expired + self.evicted
    }
}

/// Shared, keyed segment store. Writes are last-writer-wins per key.
#[derive(Debug)]
pub struct SegmentCache {
    root: PathBuf,
    config: CacheConfig,
    index: DashMap<CacheKey, CacheEntryMeta>,
}

impl SegmentCache {
    /// Open (or create) the cache directory and rebuild the index from its sidecars.
    pub async fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let root = config.directory.clone();
        tokio::fs::create_dir_all(&root).await?;

        let cache = Self {
            root,
            config,
            index: DashMap::new(),
        };
        cache.load_index().await?;
        info!(
            dir = %cache.root.display(),
            entries = cache.index.len(),
            generation = %cache.config.generation,
            "Segment cache opened"
        );
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn generation(&self) -> &str {
        &self.config.generation
    }

    async fn load_index(&self) -> Result<(), CacheError> {
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(TEMP_EXT) => {
                    // Leftover from an interrupted write.
                    let _ = tokio::fs::remove_file(&path).await;
                }
                Some(SIDECAR_EXT) => match read_sidecar(&path).await {
                    Ok(meta) => {
                        if tokio::fs::try_exists(path.with_extension(PAYLOAD_EXT))
                            .await
                            .unwrap_or(false)
                        {
                            self.index.insert(meta.key.clone(), meta);
                        } else {
                            debug!(path = %path.display(), "Dropping sidecar without payload");
                            let _ = tokio::fs::remove_file(&path).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Discarding unreadable cache entry");
                        let _ = tokio::fs::remove_file(&path).await;
                        let _ = tokio::fs::remove_file(path.with_extension(PAYLOAD_EXT)).await;
                    }
                },
                _ => {}
            }
        }
        Ok(())
    }

    fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.{PAYLOAD_EXT}", key.digest()))
    }

    fn sidecar_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.{SIDECAR_EXT}", key.digest()))
    }

    fn is_fresh(&self, meta: &CacheEntryMeta, now: DateTime<Utc>) -> bool {
        meta.generation == self.config.generation
            && meta.age(now).to_std().map(|age| age < self.config.max_age()).unwrap_or(true)
    }

    /// Store `bytes` under `key`, then enforce the size cap.
    pub async fn put(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        content_type: Option<String>,
    ) -> Result<CacheEntryMeta, CacheError> {
        let meta = self.store(key, bytes, content_type, Utc::now()).await?;
        if self.total_size() > self.config.max_size_bytes {
            self.evict_over_capacity().await;
        }
        Ok(meta)
    }

    async fn store(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        content_type: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<CacheEntryMeta, CacheError> {
        let mut meta = CacheEntryMeta::new(key.clone(), bytes.len() as u64, content_type, &self.config.generation);
        meta.created_at = created_at;
        meta.last_accessed_at = created_at;

        write_atomic(&self.root, &self.payload_path(key), &bytes).await?;
        let sidecar = serde_json::to_vec(&meta)?;
        write_atomic(&self.root, &self.sidecar_path(key), &sidecar).await?;

        self.index.insert(key.clone(), meta.clone());
        debug!(key = %key, size = meta.size_bytes, "Cached segment");
        Ok(meta)
    }

    /// Fresh entry for `key`, if any. Expired or foreign-generation entries read as misses.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CachedSegment>, CacheError> {
        self.read(key, false).await
    }

    /// Like [`get`](Self::get), but also returns entries past their maximum age.
    /// Used as a last resort when the network is down.
    pub async fn get_stale(&self, key: &CacheKey) -> Result<Option<CachedSegment>, CacheError> {
        self.read(key, true).await
    }

    async fn read(&self, key: &CacheKey, allow_expired: bool) -> Result<Option<CachedSegment>, CacheError> {
        let now = Utc::now();
        let Some(meta) = self.index.get(key).map(|m| m.clone()) else {
            return Ok(None);
        };
        let usable = if allow_expired {
            meta.generation == self.config.generation
        } else {
            self.is_fresh(&meta, now)
        };
        if !usable {
            return Ok(None);
        }

        let bytes = match tokio::fs::read(self.payload_path(key)).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.remove_if(key, |_, m| m.created_at == meta.created_at);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut meta = meta;
        meta.last_accessed_at = now;
        if let Some(mut current) = self.index.get_mut(key)
            && current.created_at == meta.created_at
        {
            current.last_accessed_at = now;
        }
        Ok(Some(CachedSegment { meta, bytes }))
    }

    /// True when `key` would be served by [`get`](Self::get).
    pub fn contains_fresh(&self, key: &CacheKey) -> bool {
        let now = Utc::now();
        self.index
            .get(key)
            .map(|meta| self.is_fresh(&meta, now))
            .unwrap_or(false)
    }

    pub fn total_size(&self) -> u64 {
        self.index.iter().map(|e| e.size_bytes).sum()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let entries: Vec<CacheEntryMeta> = self.index.iter().map(|e| e.value().clone()).collect();
        CacheStats::from_entries(
            entries.iter(),
            self.config.max_size_bytes,
            self.config.near_capacity_ratio,
        )
    }

    /// Remove entries past their maximum age, then evict until under the size cap.
    ///
    /// Running it again without new writes removes nothing.
    pub async fn evict_expired(&self) -> CleanupReport {
        let now = Utc::now();
        let max_age = self.config.max_age();
        let expired: Vec<CacheEntryMeta> = self
            .index
            .iter()
            .filter(|e| e.age(now).to_std().map(|age| age >= max_age).unwrap_or(false))
            .map(|e| e.value().clone())
            .collect();

        let mut report = CleanupReport::default();
        for meta in &expired {
            if self.remove_entry(meta).await {
                report.expired += 1;
            }
        }
        report.evicted = self.evict_over_capacity().await;

        if report.total() > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = self.index.len(),
                "Cache cleanup finished"
            );
        }
        report
    }

    /// Remove the oldest share of entries (by creation time) until the total fits the cap.
    async fn evict_over_capacity(&self) -> usize {
        let mut evicted = 0;
        loop {
            let total = self.total_size();
            if total <= self.config.max_size_bytes || self.index.is_empty() {
                break;
            }

            let mut entries: Vec<CacheEntryMeta> = self.index.iter().map(|e| e.value().clone()).collect();
            entries.sort_by_key(|m| m.created_at);
            let round = ((entries.len() as f64 * self.config.eviction_ratio).ceil() as usize).clamp(1, entries.len());

            let mut removed = 0;
            for meta in entries.iter().take(round) {
                if self.remove_entry(meta).await {
                    removed += 1;
                }
            }
            debug!(total, round, removed, "Capacity eviction round");
            evicted += removed;
            if removed == 0 {
                break;
            }
        }
        if evicted > 0 {
            info!(evicted, max_bytes = self.config.max_size_bytes, "Evicted oldest cache entries");
        }
        evicted
    }

    /// Drop `meta` unless the key was rewritten since it was read.
    async fn remove_entry(&self, meta: &CacheEntryMeta) -> bool {
        let removed = self
            .index
            .remove_if(&meta.key, |_, current| current.created_at == meta.created_at)
            .is_some();
        if removed {
            self.delete_files(&meta.key).await;
        }
        removed
    }

    async fn delete_files(&self, key: &CacheKey) {
        for path in [self.payload_path(key), self.sidecar_path(key)] {
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to delete cache file");
            }
        }
    }

    /// Wipe every entry, including files the index does not know about.
    pub async fn clear_all(&self) -> Result<usize, CacheError> {
        let removed = self.index.len();
        self.index.clear();

        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let ours = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some(PAYLOAD_EXT | SIDECAR_EXT | TEMP_EXT)
            );
            if ours && let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(e.into());
            }
        }
        info!(removed, "Cache cleared");
        Ok(removed)
    }

    /// Drop entries written under any other cache generation.
    pub async fn purge_other_generations(&self) -> usize {
        let stale: Vec<CacheEntryMeta> = self
            .index
            .iter()
            .filter(|e| e.generation != self.config.generation)
            .map(|e| e.value().clone())
            .collect();
        let mut purged = 0;
        for meta in &stale {
            if self.remove_entry(meta).await {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, generation = %self.config.generation, "Purged entries from other cache generations");
        }
        purged
    }

    /// Run [`evict_expired`](Self::evict_expired) on the configured interval until `token` fires.
    pub fn spawn_cleanup(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let period = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Cache cleanup task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.evict_expired().await;
                    }
                }
            }
        })
    }
}

async fn read_sidecar(path: &Path) -> Result<CacheEntryMeta, CacheError> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw).map_err(|source| CacheError::Metadata {
        path: path.to_path_buf(),
        source,
    })
}

/// Write to a temporary file in `dir`, then rename over `target`.
async fn write_atomic(dir: &Path, target: &Path, data: &[u8]) -> Result<(), CacheError> {
    let temp = dir.join(format!("{}.{TEMP_EXT}", uuid::Uuid::new_v4()));
    tokio::fs::write(&temp, data).await?;
    if let Err(e) = tokio::fs::rename(&temp, target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}
