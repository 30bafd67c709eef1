// HLS relay, prefetch scheduling and two-layer segment caching
pub mod cache;
pub mod config;
pub mod edge;
pub mod error;
pub mod manifest;
pub mod queue;
pub mod relay;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod session;

// Export common types for ease of use
pub use cache::{CacheEntryMeta, CacheKey, CacheStats, CleanupReport, SegmentCache};
pub use config::{
    CacheConfig, EdgeConfig, EngineConfig, QueueConfig, RelayConfig, ResolverConfig, SchedulerConfig,
};
pub use edge::{EdgeCache, EdgePolicy, EdgeRequest, EdgeResponse, EdgeSource, EdgeStore, RelayTransport, Transport};
pub use error::{AttemptFailure, CacheError, EdgeError, RelayError, ResolveError, ServerError};
pub use manifest::{ManifestResolver, ManifestTimeline, Segment};
pub use queue::{QueueReport, SegmentQueue};
pub use relay::{RelayBody, RelayEndpoint, RelayFetcher, RelayOptions, RelayResponse, is_manifest, rewrite_manifest};
pub use retry::{RetryAction, RetryPolicy, retry_with_backoff};
pub use scheduler::{
    BufferedRange, PlaybackObservation, PrefetchDecision, PrefetchScheduler, SchedulerPhase, SchedulerState,
};
pub use server::{AppState, RelayServer, ServerConfig, router};
pub use session::{PrefetchSession, is_prefetch_eligible};
