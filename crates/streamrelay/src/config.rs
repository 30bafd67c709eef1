use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{Backoff, RetryPolicy};

/// Forwarded client address used when the caller does not override it.
pub const DEFAULT_FORWARDED_IP: &str = "202.108.22.5";

/// User agents rotated across outbound relay requests.
pub const DEFAULT_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
];

/// Name of the current cache generation. Rotate on incompatible layout changes.
pub const DEFAULT_CACHE_GENERATION: &str = "video-cache-v1";

const GIB: u64 = 1024 * 1024 * 1024;

// --- Relay Configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Total attempts per relayed request, including the first one
    pub max_attempts: u32,
    /// Base for the exponential backoff between attempts
    pub backoff_base_ms: u64,
    /// Independent timeout applied to every attempt
    pub attempt_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub user_agents: Vec<String>,
    pub forwarded_ip: String,
    /// Maximum idle connections kept per upstream host
    pub pool_max_idle_per_host: usize,
    /// Public origin written into rewritten manifests (e.g. `https://relay.example.com`).
    /// When unset the origin is derived from the incoming request.
    pub public_origin: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 100,
            attempt_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            forwarded_ip: DEFAULT_FORWARDED_IP.to_string(),
            pool_max_idle_per_host: 20,
            public_origin: None,
        }
    }
}

impl RelayConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::relay_default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(Backoff::Exponential, Duration::from_millis(self.backoff_base_ms))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// --- Resolver Configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Absolute URL of the relay endpoint, e.g. `http://127.0.0.1:3000/proxy`
    pub relay_endpoint: String,
    /// Master playlists pointing at master playlists stop resolving past this depth
    pub max_variant_depth: usize,
    /// Upper bound for one manifest request through the relay (covers its retries)
    pub request_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            relay_endpoint: "http://127.0.0.1:3000/proxy".to_string(),
            max_variant_depth: 5,
            request_timeout_ms: 180_000,
        }
    }
}

impl ResolverConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// --- Download Queue Configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Segments in flight at once for one generation
    pub concurrency: usize,
    pub request_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            request_timeout_ms: 180_000,
        }
    }
}

impl QueueConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// --- Scheduler Configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How many segments ahead of the playhead prefetching starts
    pub segment_offset: usize,
    /// Start-index window treated as sequential playback
    pub sequential_window: usize,
    /// Native buffer depth (seconds) above which prefetching is skipped
    pub buffer_health_secs: f64,
    pub initial_debounce_ms: u64,
    pub seek_debounce_ms: u64,
    pub steady_debounce_ms: u64,
    /// Position jumps larger than this (seconds) use the seek debounce
    pub seek_jump_secs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            segment_offset: 3,
            sequential_window: 3,
            buffer_health_secs: 30.0,
            initial_debounce_ms: 100,
            seek_debounce_ms: 2_000,
            steady_debounce_ms: 500,
            seek_jump_secs: 2.0,
        }
    }
}

// --- Persistent Cache Configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub directory: PathBuf,
    /// Soft cap on the summed payload size
    pub max_size_bytes: u64,
    /// Entries older than this are removed on cleanup
    pub max_age_secs: u64,
    /// Share of entries (oldest first) removed per capacity eviction round
    pub eviction_ratio: f64,
    pub cleanup_interval_secs: u64,
    /// Cache generation identity; entries from other generations are purged on activation
    pub generation: String,
    /// Fraction of the cap above which stats report the cache as nearly full
    pub near_capacity_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("cache/segments"),
            max_size_bytes: GIB,
            max_age_secs: 7 * 24 * 60 * 60,
            eviction_ratio: 0.3,
            cleanup_interval_secs: 5 * 60,
            generation: DEFAULT_CACHE_GENERATION.to_string(),
            near_capacity_ratio: 0.8,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// --- Edge Cache Configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub enabled: bool,
    /// Path suffixes served stale-while-revalidate
    pub manifest_suffixes: Vec<String>,
    /// Path suffixes served cache-first
    pub segment_suffixes: Vec<String>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            manifest_suffixes: vec![".m3u8".to_string()],
            segment_suffixes: vec![".ts".to_string()],
        }
    }
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub relay: RelayConfig,
    pub resolver: ResolverConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub edge: EdgeConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_defaults_match_retry_contract() {
        let config = RelayConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.attempt_timeout(), Duration::from_secs(30));
        assert_eq!(config.user_agents.len(), 3);
        assert_eq!(config.forwarded_ip, DEFAULT_FORWARDED_IP);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_before_attempt(2), Duration::from_millis(100));
    }

    #[test]
    fn cache_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_size_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.max_age(), Duration::from_secs(604_800));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(config.generation, "video-cache-v1");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"scheduler":{"segment_offset":5},"queue":{}}"#).unwrap();
        assert_eq!(config.scheduler.segment_offset, 5);
        assert_eq!(config.scheduler.sequential_window, 3);
        assert_eq!(config.queue.concurrency, 3);
        assert_eq!(config.relay.max_attempts, 5);
    }
}
