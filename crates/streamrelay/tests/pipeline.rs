//! End to end: upstream CDN -> relay server (with edge cache) -> manifest resolver
//! -> prefetch session and download queue -> persistent cache -> edge hits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use streamrelay_engine::{
    AppState, CacheConfig, EdgeCache, EdgeConfig, ManifestResolver, PlaybackObservation, PrefetchSession,
    QueueConfig, RelayConfig, RelayEndpoint, RelayFetcher, RelayServer, RelayTransport, ResolverConfig,
    SchedulerConfig, SegmentCache, SegmentQueue, ServerConfig,
};

const SEGMENTS: usize = 8;
const SEGMENT_SECS: f64 = 4.0;

#[derive(Clone, Default)]
struct Cdn {
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl Cdn {
    fn record(&self, path: &str) {
        *self.hits.lock().entry(path.to_string()).or_default() += 1;
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }

    fn segment_hits(&self) -> usize {
        self.hits
            .lock()
            .iter()
            .filter(|(path, _)| path.ends_with(".ts"))
            .map(|(_, n)| n)
            .sum()
    }
}

async fn master(State(cdn): State<Cdn>) -> impl IntoResponse {
    cdn.record("master.m3u8");
    (
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720\nhi/index.m3u8\n",
    )
}

async fn media(State(cdn): State<Cdn>) -> impl IntoResponse {
    cdn.record("index.m3u8");
    let mut body = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n");
    for i in 0..SEGMENTS {
        body.push_str(&format!("#EXTINF:{SEGMENT_SECS:.1},\nseg/seg{i}.ts\n"));
    }
    body.push_str("#EXT-X-ENDLIST\n");
    ([(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")], body)
}

async fn segment(State(cdn): State<Cdn>, Path(name): Path<String>) -> impl IntoResponse {
    cdn.record(&name);
    ([(header::CONTENT_TYPE, "video/mp2t")], format!("payload-of-{name}"))
}

async fn down(State(cdn): State<Cdn>) -> StatusCode {
    cdn.record("down.m3u8");
    StatusCode::SERVICE_UNAVAILABLE
}

async fn spawn_cdn() -> (String, Cdn) {
    let cdn = Cdn::default();
    let app = Router::new()
        .route("/live/master.m3u8", get(master))
        .route("/live/hi/index.m3u8", get(media))
        .route("/live/hi/seg/{name}", get(segment))
        .route("/down/index.m3u8", get(down))
        .with_state(cdn.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), cdn)
}

struct Harness {
    _dir: TempDir,
    relay_origin: String,
    cache: Arc<SegmentCache>,
    fetcher: RelayFetcher,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(
            SegmentCache::open(CacheConfig {
                directory: dir.path().to_path_buf(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let fetcher = RelayFetcher::new(RelayConfig {
            backoff_base_ms: 1,
            ..Default::default()
        })
        .unwrap();
        let edge = EdgeCache::new(
            Arc::new(RelayTransport::new(fetcher.clone())),
            cache.clone(),
            EdgeConfig::default(),
        );
        edge.activate().await;

        let state = AppState::new(ServerConfig::default(), fetcher.clone(), cache.clone()).with_edge(Arc::new(edge));
        let server = RelayServer::new(state);
        let shutdown = server.cancel_token();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));

        Self {
            _dir: dir,
            relay_origin: format!("http://{addr}"),
            cache,
            fetcher,
            shutdown,
        }
    }

    fn endpoint(&self) -> RelayEndpoint {
        RelayEndpoint::from_origin(&self.relay_origin).unwrap()
    }

    fn resolver(&self) -> ManifestResolver {
        ManifestResolver::new(ResolverConfig {
            relay_endpoint: self.endpoint().to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn session(&self) -> PrefetchSession {
        let queue = SegmentQueue::new(self.fetcher.clone(), self.cache.clone(), QueueConfig::default());
        PrefetchSession::new(self.resolver(), queue, SchedulerConfig::default())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn prefetched_segments_are_served_by_the_edge() {
    let (cdn_base, cdn) = spawn_cdn().await;
    let harness = Harness::start().await;
    let session = harness.session();

    let timeline = session
        .load_source(&format!("{cdn_base}/live/master.m3u8"))
        .await
        .unwrap()
        .expect("playlist sources are prefetched");
    assert_eq!(timeline.len(), SEGMENTS);
    for (i, segment) in timeline.segments.iter().enumerate() {
        assert_eq!(segment.start_time, i as f64 * SEGMENT_SECS);
        assert_eq!(
            RelayEndpoint::upstream_of(&segment.url),
            format!("{cdn_base}/live/hi/seg/seg{i}.ts")
        );
    }

    session.observe(PlaybackObservation::at(0.0));
    let mut running = None;
    for _ in 0..250 {
        if let Some(handle) = session.take_running() {
            running = Some(handle);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let report = running.expect("a generation starts").await.unwrap();
    assert_eq!(report.start_index, 3);
    assert_eq!(report.downloaded, SEGMENTS - 3);
    assert_eq!(report.failed, 0);
    assert!(!report.cancelled);
    assert_eq!(cdn.segment_hits(), SEGMENTS - 3);

    let http = reqwest::Client::new();
    let endpoint = harness.endpoint();

    let hit = http
        .get(endpoint.wrap(&format!("{cdn_base}/live/hi/seg/seg4.ts")))
        .send()
        .await
        .unwrap();
    assert_eq!(hit.status(), StatusCode::OK);
    assert_eq!(hit.headers()["x-edge-cache"], "HIT");
    assert_eq!(hit.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(hit.text().await.unwrap(), "payload-of-seg4.ts");
    assert_eq!(cdn.hits("seg4.ts"), 1);

    let miss = http
        .get(endpoint.wrap(&format!("{cdn_base}/live/hi/seg/seg0.ts")))
        .send()
        .await
        .unwrap();
    assert_eq!(miss.headers()["x-edge-cache"], "MISS");
    assert_eq!(miss.text().await.unwrap(), "payload-of-seg0.ts");
    let again = http
        .get(endpoint.wrap(&format!("{cdn_base}/live/hi/seg/seg0.ts")))
        .send()
        .await
        .unwrap();
    assert_eq!(again.headers()["x-edge-cache"], "HIT");
    assert_eq!(cdn.hits("seg0.ts"), 1);

    // Six segments plus the master and media playlists.
    let stats: serde_json::Value = http
        .get(format!("{}/cache/stats", harness.relay_origin))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_entries"], SEGMENTS - 3 + 1 + 2);
    assert_eq!(cdn.hits("master.m3u8"), 1);
    assert_eq!(cdn.hits("index.m3u8"), 1);
}

#[tokio::test]
async fn second_session_reuses_cached_segments() {
    let (cdn_base, cdn) = spawn_cdn().await;
    let harness = Harness::start().await;
    let source = format!("{cdn_base}/live/hi/index.m3u8");

    let first = harness.session();
    let timeline = first.load_source(&source).await.unwrap().unwrap();
    let queue = SegmentQueue::new(harness.fetcher.clone(), harness.cache.clone(), QueueConfig::default());
    let report = queue.run(&timeline, 0, &CancellationToken::new()).await;
    assert_eq!(report.downloaded, SEGMENTS);
    drop(first);

    let second = harness.session();
    let timeline = second.load_source(&source).await.unwrap().unwrap();
    let report = queue.run(&timeline, 2, &CancellationToken::new()).await;
    assert_eq!(report.downloaded, 0);
    assert_eq!(report.cached_hits, SEGMENTS - 2);
    assert_eq!(cdn.segment_hits(), SEGMENTS);
}

#[tokio::test]
async fn exhausted_upstream_surfaces_as_unavailable() {
    let (cdn_base, cdn) = spawn_cdn().await;
    let harness = Harness::start().await;
    let session = harness.session();

    let err = session
        .load_source(&format!("{cdn_base}/down/index.m3u8"))
        .await
        .unwrap_err();
    assert!(err.is_unavailable(), "unexpected error: {err}");
    assert_eq!(cdn.hits("down.m3u8"), 5);
    assert!(session.timeline().is_none());
}
