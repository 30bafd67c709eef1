use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::CacheKey;

/// Sidecar metadata stored next to every cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub key: CacheKey,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub generation: String,
}

impl CacheEntryMeta {
    pub fn new(key: CacheKey, size_bytes: u64, content_type: Option<String>, generation: &str) -> Self {
        let now = Utc::now();
        Self {
            key,
            size_bytes,
            created_at: now,
            last_accessed_at: now,
            content_type,
            generation: generation.to_string(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

/// Point-in-time view of the cache for the management surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
    pub total_size_mb: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub max_size_bytes: u64,
    /// Total size is above the configured warning ratio of the cap.
    pub near_capacity: bool,
}

impl CacheStats {
    pub(crate) fn from_entries<'a>(
        entries: impl Iterator<Item = &'a CacheEntryMeta>,
        max_size_bytes: u64,
        near_capacity_ratio: f64,
    ) -> Self {
        let mut stats = Self {
            total_entries: 0,
            total_size_bytes: 0,
            total_size_mb: 0.0,
            oldest_entry: None,
            newest_entry: None,
            max_size_bytes,
            near_capacity: false,
        };
        for entry in entries {
            stats.total_entries += 1;
            stats.total_size_bytes += entry.size_bytes;
            stats.oldest_entry = Some(match stats.oldest_entry {
                Some(t) => t.min(entry.created_at),
                None => entry.created_at,
            });
            stats.newest_entry = Some(match stats.newest_entry {
                Some(t) => t.max(entry.created_at),
                None => entry.created_at,
            });
        }
        stats.total_size_mb = stats.total_size_bytes as f64 / (1024.0 * 1024.0);
        stats.near_capacity = max_size_bytes > 0
            && stats.total_size_bytes as f64 > max_size_bytes as f64 * near_capacity_ratio;
        stats
    }
}
