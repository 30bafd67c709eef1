use std::sync::Arc;

use streamrelay_engine::{
    AppState, CacheStats, EdgeCache, ManifestResolver, ManifestTimeline, PlaybackObservation, PrefetchDecision,
    PrefetchScheduler, QueueReport, RelayFetcher, RelayServer, RelayTransport, SegmentCache, SegmentQueue,
    ResolverConfig, ServerConfig, is_prefetch_eligible,
};
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use crate::cli::{CacheAction, Commands};
use crate::config::AppConfig;
use crate::error::{AppError, Result};

pub struct CommandExecutor {
    config: AppConfig,
    json: bool,
    shutdown: CancellationToken,
}

impl CommandExecutor {
    pub fn new(config: AppConfig, json: bool, shutdown: CancellationToken) -> Self {
        Self {
            config,
            json,
            shutdown,
        }
    }

    pub async fn execute(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Serve { .. } => self.serve().await,
            Commands::Resolve { url, relay } => {
                let explicit = relay.is_some() || self.has_configured_relay();
                self.resolve(&url, explicit).await
            }
            Commands::Prefetch { url, at, relay, .. } => {
                let explicit = relay.is_some() || self.has_configured_relay();
                self.prefetch(&url, at, explicit).await
            }
            Commands::Cache { action } => self.cache(action).await,
        }
    }

    /// A relay endpoint set in the config file (or the environment) counts as explicit.
    fn has_configured_relay(&self) -> bool {
        self.config.engine.resolver.relay_endpoint != ResolverConfig::default().relay_endpoint
    }

    async fn open_cache(&self) -> Result<Arc<SegmentCache>> {
        Ok(Arc::new(SegmentCache::open(self.config.engine.cache.clone()).await?))
    }

    fn app_state(&self, server: ServerConfig, fetcher: RelayFetcher, cache: Arc<SegmentCache>) -> AppState {
        let state = AppState::new(server, fetcher.clone(), cache.clone());
        if !self.config.engine.edge.enabled {
            return state;
        }
        let edge = EdgeCache::new(
            Arc::new(RelayTransport::new(fetcher)),
            cache,
            self.config.engine.edge.clone(),
        );
        state.with_edge(Arc::new(edge))
    }

    async fn serve(&self) -> Result<()> {
        let cache = self.open_cache().await?;
        let cleanup = Arc::clone(&cache).spawn_cleanup(self.shutdown.child_token());
        let fetcher = RelayFetcher::new(self.config.engine.relay.clone())?;

        let state = self.app_state(self.config.server.clone(), fetcher, Arc::clone(&cache));
        if let Some(edge) = &state.edge {
            edge.activate().await;
        }
        info!(
            bind = %self.config.server.bind_address,
            port = self.config.server.port,
            edge = state.edge.is_some(),
            cache_dir = %self.config.engine.cache.directory.display(),
            "Starting relay server"
        );

        let result = RelayServer::new(state)
            .with_cancel_token(self.shutdown.clone())
            .run()
            .await;

        self.shutdown.cancel();
        if let Err(e) = cleanup.await {
            warn!(error = %e, "Cache cleanup task ended abnormally");
        }
        result.map_err(AppError::from)
    }

    /// Relay endpoint for the resolver: the configured one, or a relay started on
    /// an ephemeral local port that lives as long as the returned guard.
    async fn relay_endpoint(
        &self,
        explicit: bool,
        cache: Arc<SegmentCache>,
    ) -> Result<(String, Option<DropGuard>)> {
        if explicit {
            return Ok((self.config.engine.resolver.relay_endpoint.clone(), None));
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let mut relay_config = self.config.engine.relay.clone();
        relay_config.public_origin = None;
        let fetcher = RelayFetcher::new(relay_config)?;
        let server_config = ServerConfig {
            bind_address: addr.ip().to_string(),
            port: addr.port(),
            enable_cors: false,
        };

        let token = self.shutdown.child_token();
        let server = RelayServer::new(self.app_state(server_config, fetcher, cache)).with_cancel_token(token.clone());
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                warn!(error = %e, "Embedded relay stopped");
            }
        });
        Ok((format!("http://{addr}/proxy"), Some(token.drop_guard())))
    }

    async fn resolver(&self, explicit_relay: bool, cache: Arc<SegmentCache>) -> Result<(ManifestResolver, Option<DropGuard>)> {
        let (endpoint, guard) = self.relay_endpoint(explicit_relay, cache).await?;
        let mut config = self.config.engine.resolver.clone();
        config.relay_endpoint = endpoint;
        Ok((ManifestResolver::new(config)?, guard))
    }

    async fn resolve(&self, url: &str, explicit_relay: bool) -> Result<()> {
        let cache = self.open_cache().await?;
        let (resolver, _relay) = self.resolver(explicit_relay, cache).await?;
        let timeline = resolver.resolve_timeline(url).await?;
        self.print_timeline(&timeline)
    }

    async fn prefetch(&self, url: &str, at: f64, explicit_relay: bool) -> Result<()> {
        if !is_prefetch_eligible(url) {
            return Err(AppError::InvalidInput(format!(
                "only HLS playlists (.m3u8) can be prefetched: {url}"
            )));
        }

        let cache = self.open_cache().await?;
        let (resolver, _relay) = self.resolver(explicit_relay, Arc::clone(&cache)).await?;
        let timeline = resolver.resolve_timeline(url).await?;

        let mut scheduler = PrefetchScheduler::new(self.config.engine.scheduler.clone());
        scheduler.manifest_loaded();
        let (start_index, token) = match scheduler.decide(&PlaybackObservation::at(at), &timeline) {
            PrefetchDecision::Start {
                start_index, token, ..
            } => (start_index, token),
            other => {
                info!(decision = ?other, "Nothing to prefetch");
                return self.print_report(&QueueReport::default());
            }
        };

        let fetcher = RelayFetcher::new(self.config.engine.relay.clone())?;
        let queue = SegmentQueue::new(fetcher, cache, self.config.engine.queue.clone());

        let link = {
            let shutdown = self.shutdown.clone();
            let token = token.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                token.cancel();
            })
        };
        let report = queue.run(&timeline, start_index, &token).await;
        link.abort();

        self.print_report(&report)
    }

    async fn cache(&self, action: CacheAction) -> Result<()> {
        let cache = self.open_cache().await?;
        match action {
            CacheAction::Stats => self.print_stats(&cache.stats()),
            CacheAction::Clear => {
                let removed = cache.clear_all().await?;
                self.print_json_or(&serde_json::json!({ "removed": removed }), || {
                    println!("Removed {removed} cache entries");
                })
            }
            CacheAction::Cleanup => {
                let report = cache.evict_expired().await;
                self.print_json_or(&report, || {
                    println!(
                        "Removed {} expired and {} evicted entries",
                        report.expired, report.evicted
                    );
                })
            }
        }
    }

    fn print_json_or<T: serde::Serialize>(&self, value: &T, text: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text();
        }
        Ok(())
    }

    fn print_timeline(&self, timeline: &ManifestTimeline) -> Result<()> {
        self.print_json_or(timeline, || {
            println!(
                "{} segments, {:.3}s total{}",
                timeline.len(),
                timeline.total_duration(),
                if timeline.is_encrypted { ", encrypted" } else { "" }
            );
            for (i, segment) in timeline.segments.iter().enumerate() {
                println!(
                    "{i:>5}  {:>10.3}s  {:>7.3}s  {}",
                    segment.start_time, segment.duration, segment.url
                );
            }
        })
    }

    fn print_report(&self, report: &QueueReport) -> Result<()> {
        self.print_json_or(report, || {
            println!(
                "Prefetch from segment {}: {} downloaded, {} already cached, {} failed{}",
                report.start_index,
                report.downloaded,
                report.cached_hits,
                report.failed,
                if report.cancelled { " (cancelled)" } else { "" }
            );
        })
    }

    fn print_stats(&self, stats: &CacheStats) -> Result<()> {
        self.print_json_or(stats, || {
            println!("Entries:  {}", stats.total_entries);
            println!(
                "Size:     {:.2} MB of {:.2} MB",
                stats.total_size_mb,
                stats.max_size_bytes as f64 / (1024.0 * 1024.0)
            );
            if let (Some(oldest), Some(newest)) = (stats.oldest_entry, stats.newest_entry) {
                println!("Oldest:   {oldest}");
                println!("Newest:   {newest}");
            }
            if stats.near_capacity {
                println!("Warning:  cache is close to its size limit");
            }
        })
    }
}
