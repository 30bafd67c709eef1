// Segment Download Queue: bounded-concurrency prefetch of upcoming segments,
// cancellable as a unit through the generation's token.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, SegmentCache};
use crate::config::QueueConfig;
use crate::error::RelayError;
use crate::manifest::{ManifestTimeline, Segment};
use crate::relay::{RelayEndpoint, RelayFetcher, RelayOptions};

/// Tally of one generation's work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    pub start_index: usize,
    pub downloaded: usize,
    pub cached_hits: usize,
    pub failed: usize,
    /// The generation was cancelled before every segment was handled.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentOutcome {
    Downloaded,
    CacheHit,
    Failed,
    Cancelled,
}

/// Downloads segments ahead of playback into the persistent cache.
#[derive(Debug, Clone)]
pub struct SegmentQueue {
    fetcher: RelayFetcher,
    cache: Arc<SegmentCache>,
    config: QueueConfig,
    options: RelayOptions,
}

impl SegmentQueue {
    pub fn new(fetcher: RelayFetcher, cache: Arc<SegmentCache>, config: QueueConfig) -> Self {
        Self {
            fetcher,
            cache,
            config,
            options: RelayOptions::default(),
        }
    }

    /// Spoofing overrides applied to every segment request.
    pub fn with_options(mut self, options: RelayOptions) -> Self {
        self.options = options;
        self
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    /// Start a generation in the background. Cancelling `token` stops it.
    pub fn enqueue(
        &self,
        timeline: Arc<ManifestTimeline>,
        start_index: usize,
        token: CancellationToken,
    ) -> JoinHandle<QueueReport> {
        let queue = self.clone();
        tokio::spawn(async move { queue.run(&timeline, start_index, &token).await })
    }

    /// Download from `start_index` to the end of the timeline, at most
    /// `concurrency` segments at a time.
    pub async fn run(
        &self,
        timeline: &ManifestTimeline,
        start_index: usize,
        token: &CancellationToken,
    ) -> QueueReport {
        let mut report = QueueReport {
            start_index,
            ..Default::default()
        };
        let concurrency = self.config.concurrency.max(1);
        let mut pending = timeline.segments.iter().enumerate().skip(start_index);
        let mut in_flight = FuturesUnordered::new();

        debug!(
            start_index,
            total = timeline.len(),
            concurrency,
            "Prefetch generation started"
        );

        loop {
            while in_flight.len() < concurrency && !token.is_cancelled() {
                let Some((index, segment)) = pending.next() else {
                    break;
                };
                in_flight.push(self.download(index, segment, token));
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            match outcome {
                SegmentOutcome::Downloaded => report.downloaded += 1,
                SegmentOutcome::CacheHit => report.cached_hits += 1,
                SegmentOutcome::Failed => report.failed += 1,
                SegmentOutcome::Cancelled => {}
            }
        }

        report.cancelled = token.is_cancelled();
        info!(
            start_index,
            downloaded = report.downloaded,
            cached_hits = report.cached_hits,
            failed = report.failed,
            cancelled = report.cancelled,
            "Prefetch generation finished"
        );
        report
    }

    async fn download(&self, index: usize, segment: &Segment, token: &CancellationToken) -> SegmentOutcome {
        if token.is_cancelled() {
            return SegmentOutcome::Cancelled;
        }

        let key = CacheKey::normalize(&segment.url);
        if self.cache.contains_fresh(&key) {
            return SegmentOutcome::CacheHit;
        }

        let target = RelayEndpoint::upstream_of(&segment.url);
        let fetched = tokio::select! {
            _ = token.cancelled() => return SegmentOutcome::Cancelled,
            fetched = tokio::time::timeout(self.config.request_timeout(), self.fetch(&target, token)) => fetched,
        };

        let (status, content_type, bytes) = match fetched {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(RelayError::Cancelled)) => return SegmentOutcome::Cancelled,
            Ok(Err(e)) => {
                warn!(index, url = %target, error = %e, "Segment prefetch failed");
                return SegmentOutcome::Failed;
            }
            Err(_) => {
                warn!(index, url = %target, "Segment prefetch timed out");
                return SegmentOutcome::Failed;
            }
        };

        if status != StatusCode::OK {
            debug!(index, url = %target, status = status.as_u16(), "Not caching non-200 segment");
            return SegmentOutcome::Failed;
        }

        // A superseded generation must not write.
        if token.is_cancelled() {
            return SegmentOutcome::Cancelled;
        }

        match self.cache.put(&key, bytes, content_type).await {
            Ok(meta) => {
                debug!(index, key = %key, size = meta.size_bytes, "Segment prefetched");
                SegmentOutcome::Downloaded
            }
            Err(e) => {
                warn!(index, key = %key, error = %e, "Failed to cache segment");
                SegmentOutcome::Failed
            }
        }
    }

    async fn fetch(
        &self,
        target: &str,
        token: &CancellationToken,
    ) -> Result<(StatusCode, Option<String>, bytes::Bytes), RelayError> {
        let response = self.fetcher.relay(target, &self.options, token).await?;
        let status = response.status;
        let content_type = response.content_type().map(str::to_string);
        let bytes = response.into_bytes().await?;
        Ok((status, content_type, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use crate::config::{CacheConfig, RelayConfig};

    #[derive(Clone, Default)]
    struct Upstream {
        hits: Arc<DashMap<String, usize>>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay: Duration,
    }

    async fn segment(State(upstream): State<Upstream>, Path(name): Path<String>) -> Response {
        *upstream.hits.entry(name.clone()).or_insert(0) += 1;
        let now = upstream.active.fetch_add(1, Ordering::SeqCst) + 1;
        upstream.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(upstream.delay).await;
        upstream.active.fetch_sub(1, Ordering::SeqCst);

        if name.starts_with("missing") {
            return AxumStatus::NOT_FOUND.into_response();
        }
        (
            [(axum::http::header::CONTENT_TYPE, "video/mp2t")],
            format!("bytes-of-{name}"),
        )
            .into_response()
    }

    async fn spawn_upstream(delay: Duration) -> (String, Upstream) {
        let upstream = Upstream {
            delay,
            ..Default::default()
        };
        let app = Router::new()
            .route("/v/{name}", get(segment))
            .with_state(upstream.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), upstream)
    }

    fn timeline(base: &str, names: &[&str]) -> Arc<ManifestTimeline> {
        let endpoint = RelayEndpoint::from_origin("http://relay.local").unwrap();
        let segments = names
            .iter()
            .enumerate()
            .map(|(i, name)| Segment {
                url: endpoint.wrap(&format!("{base}/v/{name}")),
                duration: 4.0,
                start_time: 4.0 * i as f64,
            })
            .collect();
        Arc::new(ManifestTimeline {
            source_url: format!("{base}/v/index.m3u8"),
            segments,
            ..Default::default()
        })
    }

    async fn queue(dir: &TempDir) -> SegmentQueue {
        let cache = SegmentCache::open(CacheConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        let fetcher = RelayFetcher::new(RelayConfig {
            backoff_base_ms: 1,
            ..Default::default()
        })
        .unwrap();
        SegmentQueue::new(fetcher, Arc::new(cache), QueueConfig::default())
    }

    #[tokio::test]
    async fn downloads_from_start_index_and_skips_cached() {
        let (base, upstream) = spawn_upstream(Duration::ZERO).await;
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let timeline = timeline(&base, &["s0.ts", "s1.ts", "s2.ts", "s3.ts", "s4.ts"]);

        let report = queue
            .enqueue(timeline.clone(), 2, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.downloaded, 3);
        assert_eq!(report.cached_hits, 0);
        assert!(!report.cancelled);
        assert!(upstream.hits.get("s0.ts").is_none());

        let cached = queue
            .cache()
            .get(&CacheKey::normalize(&timeline.segments[3].url))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&cached.bytes[..], b"bytes-of-s3.ts");
        assert_eq!(cached.meta.content_type.as_deref(), Some("video/mp2t"));

        let again = queue.run(&timeline, 2, &CancellationToken::new()).await;
        assert_eq!(again.cached_hits, 3);
        assert_eq!(again.downloaded, 0);
        assert_eq!(*upstream.hits.get("s3.ts").unwrap(), 1);
    }

    #[tokio::test]
    async fn failures_are_skipped() {
        let (base, _) = spawn_upstream(Duration::ZERO).await;
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let timeline = timeline(&base, &["s0.ts", "missing.ts", "s2.ts"]);

        let report = queue.run(&timeline, 0, &CancellationToken::new()).await;
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.failed, 1);
        assert!(!queue.cache().contains_fresh(&CacheKey::normalize(&timeline.segments[1].url)));
    }

    #[tokio::test]
    async fn never_exceeds_the_concurrency_window() {
        let (base, upstream) = spawn_upstream(Duration::from_millis(50)).await;
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let names: Vec<String> = (0..9).map(|i| format!("s{i}.ts")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let timeline = timeline(&base, &names);

        let report = queue.run(&timeline, 0, &CancellationToken::new()).await;
        assert_eq!(report.downloaded, 9);
        assert!(upstream.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancelled_generation_writes_nothing() {
        let (base, _) = spawn_upstream(Duration::from_millis(500)).await;
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let timeline = timeline(&base, &["s0.ts", "s1.ts", "s2.ts", "s3.ts"]);
        let token = CancellationToken::new();

        let handle = queue.enqueue(timeline, 0, token.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let report = handle.await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.downloaded, 0);
        assert!(queue.cache().is_empty());
    }

    #[tokio::test]
    async fn start_past_the_end_does_nothing() {
        let (base, _) = spawn_upstream(Duration::ZERO).await;
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir).await;
        let timeline = timeline(&base, &["s0.ts"]);

        let report = queue.run(&timeline, 5, &CancellationToken::new()).await;
        assert_eq!(report, QueueReport { start_index: 5, ..Default::default() });
    }
}
