// Manifest Resolver: fetches HLS playlists through the relay and flattens them
// into an ordered segment timeline.

use std::sync::Arc;

use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist, parse_playlist_res};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::config::ResolverConfig;
use crate::error::ResolveError;
use crate::relay::RelayEndpoint;

/// One media segment on the playback timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub url: String,
    /// Seconds.
    pub duration: f64,
    /// Seconds from the start of the playlist.
    pub start_time: f64,
}

impl Segment {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Ordered segments of one media playlist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestTimeline {
    pub source_url: String,
    pub segments: Vec<Segment>,
    pub is_encrypted: bool,
    pub key_uri: Option<String>,
}

impl ManifestTimeline {
    /// Build a timeline from a parsed media playlist. Segment URIs are resolved against `base`.
    pub fn from_media_playlist(source_url: impl Into<String>, playlist: &MediaPlaylist, base: &Url) -> Self {
        let mut timeline = Self {
            source_url: source_url.into(),
            ..Default::default()
        };

        let mut cursor = 0.0_f64;
        for media in &playlist.segments {
            if let Some(key) = &media.key
                && key.method != KeyMethod::None
            {
                timeline.is_encrypted = true;
                if timeline.key_uri.is_none() {
                    timeline.key_uri = key.uri.as_deref().map(|uri| resolve(base, uri));
                }
            }

            if media.uri.trim().is_empty() {
                continue;
            }

            let duration = extinf_seconds(media.duration);
            timeline.segments.push(Segment {
                url: resolve(base, media.uri.trim()),
                duration,
                start_time: cursor,
            });
            cursor += duration;
        }

        timeline
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.last().map(Segment::end_time).unwrap_or(0.0)
    }

    /// Index of the segment playing at `time`.
    ///
    /// Positions before the start map to the first segment and positions past the end
    /// to the last one. `None` only for an empty timeline.
    pub fn segment_index_at(&self, time: f64) -> Option<usize> {
        if self.segments.is_empty() {
            return None;
        }
        let idx = self.segments.partition_point(|s| s.end_time() <= time);
        Some(idx.min(self.segments.len() - 1))
    }
}

/// `#EXTINF` value as written in the playlist. The parser keeps it as an `f32`, and
/// widening that directly turns `10.01` into `10.010000228881836`.
fn extinf_seconds(duration: f32) -> f64 {
    duration.to_string().parse().unwrap_or(f64::from(duration))
}

fn resolve(base: &Url, uri: &str) -> String {
    base.join(uri)
        .map(String::from)
        .unwrap_or_else(|_| uri.to_string())
}

/// Body the relay returns when it gives up on an upstream.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayFailure {
    #[serde(default)]
    attempts: Option<u32>,
    #[serde(default)]
    last_status: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// Resolves playlist URLs into timelines, talking only to the relay endpoint.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    client: reqwest::Client,
    endpoint: RelayEndpoint,
    config: ResolverConfig,
}

impl ManifestResolver {
    pub fn new(config: ResolverConfig) -> Result<Self, ResolveError> {
        let endpoint = RelayEndpoint::parse(&config.relay_endpoint).map_err(|e| ResolveError::InvalidUrl {
            input: config.relay_endpoint.clone(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ResolveError::fetch(endpoint.as_str(), None, e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    /// Fetch `manifest_url` and flatten it into a timeline.
    ///
    /// Master playlists resolve to their first variant, recursively.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn resolve_timeline(&self, manifest_url: &str) -> Result<Arc<ManifestTimeline>, ResolveError> {
        self.resolve_at_depth(manifest_url.to_string(), 0).await.map(Arc::new)
    }

    fn resolve_at_depth(
        &self,
        manifest_url: String,
        depth: usize,
    ) -> futures::future::BoxFuture<'_, Result<ManifestTimeline, ResolveError>> {
        Box::pin(async move {
            if depth > self.config.max_variant_depth {
                return Err(ResolveError::TooDeep {
                    url: manifest_url,
                    depth: self.config.max_variant_depth,
                });
            }

            let upstream = RelayEndpoint::upstream_of(&manifest_url);
            let base = Url::parse(&upstream).map_err(|e| ResolveError::InvalidUrl {
                input: manifest_url.clone(),
                reason: e.to_string(),
            })?;

            let body = self.fetch(&manifest_url).await?;
            match parse_playlist_res(&body) {
                Ok(Playlist::MasterPlaylist(master)) => {
                    let Some(variant) = master.variants.iter().find(|v| !v.uri.trim().is_empty()) else {
                        debug!(url = %upstream, "Master playlist has no variants");
                        return Ok(ManifestTimeline {
                            source_url: manifest_url,
                            ..Default::default()
                        });
                    };
                    let variant_url = resolve(&base, variant.uri.trim());
                    debug!(url = %upstream, variant = %variant_url, depth, "Following first variant");
                    self.resolve_at_depth(variant_url, depth + 1).await
                }
                Ok(Playlist::MediaPlaylist(media)) => {
                    let timeline = ManifestTimeline::from_media_playlist(manifest_url, &media, &base);
                    debug!(
                        url = %upstream,
                        segments = timeline.len(),
                        duration = timeline.total_duration(),
                        encrypted = timeline.is_encrypted,
                        "Resolved media playlist"
                    );
                    Ok(timeline)
                }
                Err(e) => Err(ResolveError::parse(upstream, e.to_string())),
            }
        })
    }

    async fn fetch(&self, manifest_url: &str) -> Result<Vec<u8>, ResolveError> {
        let relayed = self.endpoint.wrap(manifest_url);
        let response = match self.client.get(&relayed).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Err(ResolveError::unavailable(manifest_url, e.to_string()));
            }
            Err(e) => return Err(ResolveError::fetch(manifest_url, None, e.to_string())),
        };

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(ResolveError::unavailable(manifest_url, "HTTP 503"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(manifest_url, status, &text));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ResolveError::fetch(manifest_url, Some(status), e.to_string()))
    }
}

fn classify_failure(url: &str, status: StatusCode, body: &str) -> ResolveError {
    if status == StatusCode::INTERNAL_SERVER_ERROR
        && let Ok(failure) = serde_json::from_str::<RelayFailure>(body)
    {
        let reason = failure
            .message
            .unwrap_or_else(|| "relay request failed".to_string());
        // The relay only reports an attempt count when its retries ran dry.
        if failure.attempts.is_some() || failure.last_status == Some(503) {
            return ResolveError::unavailable(url, reason);
        }
        return ResolveError::fetch(url, Some(status), reason);
    }
    ResolveError::fetch(url, Some(status), format!("HTTP {}", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::extract::{Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    const MEDIA: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nseg0.ts\n#EXTINF:5.5,\nseg1.ts\n#EXTINF:2.25,\nseg2.ts\n#EXT-X-ENDLIST\n";

    fn media(input: &str) -> MediaPlaylist {
        match parse_playlist_res(input.as_bytes()).unwrap() {
            Playlist::MediaPlaylist(pl) => pl,
            Playlist::MasterPlaylist(_) => panic!("expected media playlist"),
        }
    }

    #[test]
    fn start_times_are_cumulative() {
        let base = Url::parse("https://cdn.example.com/vod/index.m3u8").unwrap();
        let timeline = ManifestTimeline::from_media_playlist("src", &media(MEDIA), &base);

        assert_eq!(timeline.len(), 3);
        let mut expected = 0.0;
        for segment in &timeline.segments {
            assert_eq!(segment.start_time, expected);
            expected += segment.duration;
        }
        assert_eq!(timeline.total_duration(), 17.75);
        assert_eq!(timeline.segments[1].url, "https://cdn.example.com/vod/seg1.ts");
        assert!(!timeline.is_encrypted);
    }

    #[test]
    fn durations_match_the_playlist_text() {
        let input = "#EXTM3U\n#EXT-X-TARGETDURATION:11\n#EXTINF:10.01,\nseg0.ts\n#EXTINF:9.976,\nseg1.ts\n#EXT-X-ENDLIST\n";
        let base = Url::parse("https://cdn.example.com/vod/index.m3u8").unwrap();
        let timeline = ManifestTimeline::from_media_playlist(base.as_str(), &media(input), &base);

        assert_eq!(timeline.segments[0].duration, 10.01);
        assert_eq!(timeline.segments[1].duration, 9.976);
        assert_eq!(timeline.segments[1].start_time, 10.01);
        assert_eq!(
            serde_json::to_value(&timeline.segments[0]).unwrap()["duration"],
            serde_json::json!(10.01)
        );
    }

    #[test]
    fn segment_lookup_by_time() {
        let base = Url::parse("https://cdn.example.com/vod/index.m3u8").unwrap();
        let timeline = ManifestTimeline::from_media_playlist("src", &media(MEDIA), &base);

        assert_eq!(timeline.segment_index_at(0.0), Some(0));
        assert_eq!(timeline.segment_index_at(9.99), Some(0));
        assert_eq!(timeline.segment_index_at(10.0), Some(1));
        assert_eq!(timeline.segment_index_at(16.0), Some(2));
        assert_eq!(timeline.segment_index_at(500.0), Some(2));
        assert_eq!(timeline.segment_index_at(-3.0), Some(0));
        assert_eq!(ManifestTimeline::default().segment_index_at(1.0), None);
    }

    #[test]
    fn keyed_playlists_are_flagged() {
        let input = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        let base = Url::parse("https://cdn.example.com/enc/index.m3u8").unwrap();
        let timeline = ManifestTimeline::from_media_playlist("src", &media(input), &base);

        assert!(timeline.is_encrypted);
        assert_eq!(timeline.key_uri.as_deref(), Some("https://cdn.example.com/enc/key.bin"));
        assert_eq!(timeline.len(), 2);
    }

    #[derive(Clone, Default)]
    struct FakeRelay {
        documents: Arc<HashMap<String, (u16, String)>>,
    }

    async fn fake_proxy(
        State(relay): State<FakeRelay>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Response {
        let target = query.get("url").cloned().unwrap_or_default();
        match relay.documents.get(&target) {
            Some((status, body)) => (
                AxumStatus::from_u16(*status).unwrap(),
                body.clone(),
            )
                .into_response(),
            None => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn spawn_relay(documents: Vec<(&str, u16, &str)>) -> ManifestResolver {
        let documents = documents
            .into_iter()
            .map(|(url, status, body)| (url.to_string(), (status, body.to_string())))
            .collect();
        let app = Router::new()
            .route("/proxy", get(fake_proxy))
            .with_state(FakeRelay {
                documents: Arc::new(documents),
            });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        ManifestResolver::new(ResolverConfig {
            relay_endpoint: format!("http://{addr}/proxy"),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn master_resolves_first_variant_recursively() {
        let resolver = spawn_relay(vec![
            (
                "https://cdn.example.com/master.m3u8",
                200,
                "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nmid/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2000000\nhigh/index.m3u8\n",
            ),
            (
                "https://cdn.example.com/mid/index.m3u8",
                200,
                "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\n../low/index.m3u8\n",
            ),
            ("https://cdn.example.com/low/index.m3u8", 200, MEDIA),
        ])
        .await;

        let timeline = resolver
            .resolve_timeline("https://cdn.example.com/master.m3u8")
            .await
            .unwrap();
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline.segments[0].url, "https://cdn.example.com/low/seg0.ts");
        assert_eq!(timeline.source_url, "https://cdn.example.com/low/index.m3u8");
    }

    #[tokio::test]
    async fn master_without_variants_is_empty() {
        let resolver = spawn_relay(vec![(
            "https://cdn.example.com/empty.m3u8",
            200,
            "#EXTM3U\n#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"en\",URI=\"audio.m3u8\"\n",
        )])
        .await;
        let timeline = resolver
            .resolve_timeline("https://cdn.example.com/empty.m3u8")
            .await
            .unwrap();
        assert!(timeline.is_empty());
        assert_eq!(timeline.total_duration(), 0.0);
    }

    #[tokio::test]
    async fn variant_loops_stop_at_depth_limit() {
        let resolver = spawn_relay(vec![(
            "https://cdn.example.com/loop.m3u8",
            200,
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nloop.m3u8\n",
        )])
        .await;
        let err = resolver
            .resolve_timeline("https://cdn.example.com/loop.m3u8")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::TooDeep { depth: 5, .. }));
    }

    #[tokio::test]
    async fn exhausted_relay_is_unavailable() {
        let resolver = spawn_relay(vec![
            (
                "https://cdn.example.com/busy.m3u8",
                500,
                r#"{"error":"Proxy request failed","message":"failed after 5 attempts: HTTP 503","url":"https://cdn.example.com/busy.m3u8","attempts":5,"lastStatus":503}"#,
            ),
            ("https://cdn.example.com/down.m3u8", 503, "busy"),
            ("https://cdn.example.com/gone.m3u8", 404, "nope"),
        ])
        .await;

        let busy = resolver
            .resolve_timeline("https://cdn.example.com/busy.m3u8")
            .await
            .unwrap_err();
        assert!(busy.is_unavailable());

        let down = resolver
            .resolve_timeline("https://cdn.example.com/down.m3u8")
            .await
            .unwrap_err();
        assert!(down.is_unavailable());

        let gone = resolver
            .resolve_timeline("https://cdn.example.com/gone.m3u8")
            .await
            .unwrap_err();
        assert!(matches!(
            gone,
            ResolveError::Fetch {
                status: Some(StatusCode::NOT_FOUND),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_relay_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let resolver = ManifestResolver::new(ResolverConfig {
            relay_endpoint: format!("http://{addr}/proxy"),
            ..Default::default()
        })
        .unwrap();
        let err = resolver
            .resolve_timeline("https://cdn.example.com/a.m3u8")
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_playlist_res(b"<html>not a playlist</html>").is_err());
    }
}
