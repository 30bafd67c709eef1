// Prefetch Session: one player/source pairing. Owns the scheduler, runs the
// debounce timer and hands new generations to the download queue.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::SchedulerConfig;
use crate::error::ResolveError;
use crate::manifest::{ManifestResolver, ManifestTimeline};
use crate::queue::{QueueReport, SegmentQueue};
use crate::relay::RelayEndpoint;
use crate::scheduler::{PlaybackObservation, PrefetchDecision, PrefetchScheduler, SchedulerPhase};

struct SessionInner {
    source: Option<String>,
    /// Bumped on every source change; stale manifest loads and timers compare against it.
    epoch: u64,
    /// Bumped on every observation; only the latest pending decision may run.
    observation_seq: u64,
    timeline: Option<Arc<ManifestTimeline>>,
    scheduler: PrefetchScheduler,
    pending: Option<JoinHandle<()>>,
    running: Option<JoinHandle<QueueReport>>,
}

impl SessionInner {
    fn abort_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    fn teardown(&mut self) {
        self.epoch += 1;
        self.abort_pending();
        self.scheduler.reset();
        self.timeline = None;
    }
}

pub struct PrefetchSession {
    inner: Arc<Mutex<SessionInner>>,
    resolver: ManifestResolver,
    queue: SegmentQueue,
}

/// Only HLS playlists are prefetched.
pub fn is_prefetch_eligible(source: &str) -> bool {
    let upstream = RelayEndpoint::upstream_of(source);
    match Url::parse(&upstream) {
        Ok(url) => url.path().to_ascii_lowercase().ends_with(".m3u8"),
        Err(_) => upstream.ends_with(".m3u8"),
    }
}

impl PrefetchSession {
    pub fn new(resolver: ManifestResolver, queue: SegmentQueue, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                source: None,
                epoch: 0,
                observation_seq: 0,
                timeline: None,
                scheduler: PrefetchScheduler::new(config),
                pending: None,
                running: None,
            })),
            resolver,
            queue,
        }
    }

    /// Switch to `source`: cancel everything tied to the previous one, then
    /// resolve the new manifest.
    ///
    /// Returns `Ok(None)` for sources that are not prefetched, or when another
    /// source replaced this one while it was resolving.
    pub async fn load_source(&self, source: &str) -> Result<Option<Arc<ManifestTimeline>>, ResolveError> {
        let epoch = {
            let mut inner = self.inner.lock();
            inner.teardown();
            inner.source = Some(source.to_string());
            inner.epoch
        };

        if !is_prefetch_eligible(source) {
            debug!(source, "Source is not an HLS playlist, prefetch disabled");
            return Ok(None);
        }

        let timeline = match self.resolver.resolve_timeline(source).await {
            Ok(timeline) => timeline,
            Err(e) if e.is_unavailable() => {
                warn!(source, error = %e, "Network unavailable, skipping prefetch");
                return Err(e);
            }
            Err(e) => {
                error!(source, error = %e, "Failed to load manifest for prefetch");
                return Err(e);
            }
        };

        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            debug!(source, "Source changed while resolving, discarding timeline");
            return Ok(None);
        }
        inner.timeline = Some(Arc::clone(&timeline));
        inner.scheduler.manifest_loaded();
        info!(
            source,
            segments = timeline.len(),
            duration = timeline.total_duration(),
            "Prefetch session ready"
        );
        Ok(Some(timeline))
    }

    /// Feed a player update. Replaces any decision still waiting out its debounce.
    pub fn observe(&self, observation: PlaybackObservation) {
        let mut inner = self.inner.lock();
        let Some(timeline) = inner.timeline.clone() else {
            return;
        };
        inner.abort_pending();
        inner.observation_seq += 1;

        let Some(delay) = inner.scheduler.observe(&observation) else {
            return;
        };

        let shared = Arc::clone(&self.inner);
        let queue = self.queue.clone();
        let epoch = inner.epoch;
        let seq = inner.observation_seq;

        inner.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut inner = shared.lock();
            if inner.epoch != epoch || inner.observation_seq != seq {
                return;
            }
            inner.pending = None;
            if let PrefetchDecision::Start {
                start_index, token, ..
            } = inner.scheduler.decide(&observation, &timeline)
            {
                inner.running = Some(queue.enqueue(timeline, start_index, token));
            }
        }));
    }

    pub fn source(&self) -> Option<String> {
        self.inner.lock().source.clone()
    }

    pub fn timeline(&self) -> Option<Arc<ManifestTimeline>> {
        self.inner.lock().timeline.clone()
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.inner.lock().scheduler.phase()
    }

    pub fn last_start_index(&self) -> Option<usize> {
        self.inner.lock().scheduler.state().last_start_index
    }

    /// Generations started since the current manifest loaded.
    pub fn generations_started(&self) -> u64 {
        self.inner.lock().scheduler.state().generation_count
    }

    pub fn active_generation(&self) -> Option<CancellationToken> {
        self.inner.lock().scheduler.active_generation().cloned()
    }

    /// Handle of the most recently started generation, if not taken yet.
    pub fn take_running(&self) -> Option<JoinHandle<QueueReport>> {
        self.inner.lock().running.take()
    }

    /// Cancel the active generation and any pending decision. The session goes idle.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.teardown();
        inner.source = None;
    }
}

impl Drop for PrefetchSession {
    fn drop(&mut self) {
        self.close();
    }
}
