// Edge Intercept Cache: answers player requests for manifests and segments from
// the segment cache, falling back to the network.
//
// Two policies, picked by the target path:
// - manifests: stale-while-revalidate
// - segments: cache-first, storing only 200 responses
//
// The cache is shared by every client, so manifests are stored as the upstream
// sent them and rewritten for each caller's relay endpoint on the way out.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheKey, SegmentCache};
use crate::config::EdgeConfig;
use crate::error::EdgeError;
use crate::relay::{RelayEndpoint, RelayFetcher, RelayOptions, is_manifest, rewrite_manifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgePolicy {
    StaleWhileRevalidate,
    CacheFirst,
    Passthrough,
}

/// Where an edge response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSource {
    Network,
    Cache,
    /// Expired copy served because the network failed.
    Stale,
}

impl EdgeSource {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            Self::Network => "MISS",
            Self::Cache => "HIT",
            Self::Stale => "STALE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub source: EdgeSource,
}

impl EdgeResponse {
    pub fn network(status: StatusCode, content_type: Option<String>, body: Bytes) -> Self {
        Self {
            status,
            content_type,
            body,
            source: EdgeSource::Network,
        }
    }
}

/// A request as seen by the edge: the upstream target plus relay knobs.
#[derive(Debug, Clone)]
pub struct EdgeRequest {
    pub target: String,
    pub options: RelayOptions,
}

impl EdgeRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            options: RelayOptions::default(),
        }
    }

    /// Same request without manifest rewriting, as fetched for the shared store.
    fn upstream(&self) -> Self {
        let mut request = self.clone();
        request.options.rewrite_via = None;
        request
    }
}

/// Network side of the edge.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &EdgeRequest) -> Result<EdgeResponse, EdgeError>;
}

/// Storage side of the edge.
#[async_trait]
pub trait EdgeStore: Send + Sync {
    async fn lookup(&self, key: &CacheKey) -> Option<EdgeResponse>;

    /// Expired entries are acceptable here.
    async fn lookup_stale(&self, key: &CacheKey) -> Option<EdgeResponse> {
        let _ = key;
        None
    }

    async fn store(&self, key: &CacheKey, response: &EdgeResponse);

    /// Drop entries from other cache generations. Returns how many were dropped.
    async fn purge_other_generations(&self) -> usize;
}

#[async_trait]
impl EdgeStore for SegmentCache {
    async fn lookup(&self, key: &CacheKey) -> Option<EdgeResponse> {
        match self.get(key).await {
            Ok(hit) => hit.map(|hit| EdgeResponse {
                status: StatusCode::OK,
                content_type: hit.meta.content_type,
                body: hit.bytes,
                source: EdgeSource::Cache,
            }),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, falling back to network");
                None
            }
        }
    }

    async fn lookup_stale(&self, key: &CacheKey) -> Option<EdgeResponse> {
        self.get_stale(key).await.ok().flatten().map(|hit| EdgeResponse {
            status: StatusCode::OK,
            content_type: hit.meta.content_type,
            body: hit.bytes,
            source: EdgeSource::Stale,
        })
    }

    async fn store(&self, key: &CacheKey, response: &EdgeResponse) {
        if let Err(e) = self
            .put(key, response.body.clone(), response.content_type.clone())
            .await
        {
            warn!(key = %key, error = %e, "Failed to store edge response");
        }
    }

    async fn purge_other_generations(&self) -> usize {
        SegmentCache::purge_other_generations(self).await
    }
}

/// [`Transport`] that goes through the relay fetcher in-process.
#[derive(Debug, Clone)]
pub struct RelayTransport {
    fetcher: RelayFetcher,
}

impl RelayTransport {
    pub fn new(fetcher: RelayFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn fetch(&self, request: &EdgeRequest) -> Result<EdgeResponse, EdgeError> {
        let token = CancellationToken::new();
        let response = self
            .fetcher
            .relay(&request.target, &request.options, &token)
            .await?;
        let status = response.status;
        let content_type = response.content_type().map(str::to_string);
        let body = response.into_bytes().await?;
        Ok(EdgeResponse::network(status, content_type, body))
    }
}

pub struct EdgeCache {
    transport: Arc<dyn Transport>,
    store: Arc<dyn EdgeStore>,
    config: EdgeConfig,
    /// Keys with a background revalidation in flight.
    revalidating: Arc<DashMap<CacheKey, ()>>,
}

impl std::fmt::Debug for EdgeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeCache")
            .field("config", &self.config)
            .field("revalidating", &self.revalidating.len())
            .finish()
    }
}

impl EdgeCache {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn EdgeStore>, config: EdgeConfig) -> Self {
        Self {
            transport,
            store,
            config,
            revalidating: Arc::new(DashMap::new()),
        }
    }

    /// Purge entries written by other cache generations.
    pub async fn activate(&self) -> usize {
        let purged = self.store.purge_other_generations().await;
        info!(purged, "Edge cache activated");
        purged
    }

    /// Policy for a target URL (relayed URLs are judged by their upstream path).
    pub fn policy_for(&self, target: &str) -> EdgePolicy {
        let upstream = RelayEndpoint::upstream_of(target);
        let path = Url::parse(&upstream)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| upstream.to_ascii_lowercase());
        if self.config.manifest_suffixes.iter().any(|s| path.ends_with(s.as_str())) {
            EdgePolicy::StaleWhileRevalidate
        } else if self.config.segment_suffixes.iter().any(|s| path.ends_with(s.as_str())) {
            EdgePolicy::CacheFirst
        } else {
            EdgePolicy::Passthrough
        }
    }

    pub async fn handle(&self, request: &EdgeRequest) -> Result<EdgeResponse, EdgeError> {
        let upstream = request.upstream();
        let response = match self.policy_for(&request.target) {
            EdgePolicy::Passthrough => self.transport.fetch(&upstream).await?,
            EdgePolicy::CacheFirst => self.cache_first(&upstream).await?,
            EdgePolicy::StaleWhileRevalidate => self.stale_while_revalidate(&upstream).await?,
        };
        Ok(match &request.options.rewrite_via {
            Some(endpoint) => rewrite_for_caller(response, &request.target, endpoint),
            None => response,
        })
    }

    async fn cache_first(&self, request: &EdgeRequest) -> Result<EdgeResponse, EdgeError> {
        let key = CacheKey::normalize(&request.target);
        if let Some(hit) = self.store.lookup(&key).await {
            debug!(key = %key, "Edge hit");
            return Ok(hit);
        }

        let response = self.transport.fetch(request).await?;
        if response.status == StatusCode::OK {
            self.store.store(&key, &response).await;
        }
        Ok(response)
    }

    async fn stale_while_revalidate(&self, request: &EdgeRequest) -> Result<EdgeResponse, EdgeError> {
        let key = CacheKey::normalize(&request.target);
        if let Some(hit) = self.store.lookup(&key).await {
            self.spawn_revalidation(key, request.clone());
            return Ok(hit);
        }

        match self.transport.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK {
                    self.store.store(&key, &response).await;
                }
                Ok(response)
            }
            Err(e) => match self.store.lookup_stale(&key).await {
                Some(stale) => {
                    warn!(key = %key, error = %e, "Network failed, serving stale manifest");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    fn spawn_revalidation(&self, key: CacheKey, request: EdgeRequest) {
        if self.revalidating.insert(key.clone(), ()).is_some() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let store = Arc::clone(&self.store);
        let revalidating = Arc::clone(&self.revalidating);
        tokio::spawn(async move {
            match transport.fetch(&request).await {
                Ok(response) if response.status == StatusCode::OK => {
                    store.store(&key, &response).await;
                    debug!(key = %key, "Manifest revalidated");
                }
                Ok(response) => {
                    debug!(key = %key, status = response.status.as_u16(), "Revalidation kept cached manifest");
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "Revalidation failed, keeping cached manifest");
                }
            }
            revalidating.remove(&key);
        });
    }
}

/// Point the URI lines of a successful manifest response at `endpoint`.
fn rewrite_for_caller(mut response: EdgeResponse, target: &str, endpoint: &RelayEndpoint) -> EdgeResponse {
    if !response.status.is_success() {
        return response;
    }
    let Ok(base) = Url::parse(&RelayEndpoint::upstream_of(target)) else {
        return response;
    };
    if !is_manifest(response.content_type.as_deref(), &base) {
        return response;
    }
    match std::str::from_utf8(&response.body) {
        Ok(text) => {
            response.body = Bytes::from(rewrite_manifest(text, &base, endpoint));
        }
        Err(_) => warn!(url = %base, "Manifest is not UTF-8, serving it unmodified"),
    }
    response
}
