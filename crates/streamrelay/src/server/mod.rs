//! HTTP surface: the relay endpoint, cache management and health.

mod cache_routes;
mod error;
mod proxy;

pub use error::{ApiError, ApiErrorResponse, ApiResult, ProxyFailure};
pub use proxy::ProxyQuery;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::routing::get;
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::cache::SegmentCache;
use crate::edge::EdgeCache;
use crate::error::ServerError;
use crate::relay::{RELAY_PATH, RelayFetcher};

const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// CORS layer for the management routes. `/proxy` always answers with its own CORS headers.
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 3000,
            enable_cors: true,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        let address = format!("{}:{}", self.bind_address, self.port);
        address.parse().map_err(|e: std::net::AddrParseError| ServerError::InvalidAddress {
            address,
            reason: e.to_string(),
        })
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub config: Arc<ServerConfig>,
    pub relay: RelayFetcher,
    pub cache: Arc<SegmentCache>,
    /// Edge interception in front of `/proxy`; `None` relays every request.
    pub edge: Option<Arc<EdgeCache>>,
}

impl AppState {
    pub fn new(config: ServerConfig, relay: RelayFetcher, cache: Arc<SegmentCache>) -> Self {
        Self {
            start_time: Instant::now(),
            config: Arc::new(config),
            relay,
            cache,
            edge: None,
        }
    }

    pub fn with_edge(mut self, edge: Arc<EdgeCache>) -> Self {
        self.edge = Some(edge);
        self
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// All routes, without the tracing layer.
pub fn router(state: AppState) -> Router {
    let relay_routes = Router::new()
        .route(RELAY_PATH, get(proxy::proxy_get).options(proxy::proxy_options))
        .route_layer(middleware::from_fn_with_state(state.clone(), proxy::edge_intercept));

    let mut management = Router::new()
        .route(HEALTH_PATH, get(health))
        .merge(cache_routes::router());
    if state.config.enable_cors {
        management = management.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    relay_routes.merge(management).with_state(state)
}

pub struct RelayServer {
    state: AppState,
    cancel_token: CancellationToken,
}

impl RelayServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stop serving once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    fn build_router(&self) -> Router {
        router(self.state.clone()).layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    if req.uri().path() == HEALTH_PATH {
                        Span::none()
                    } else {
                        use tower_http::trace::MakeSpan;
                        tower_http::trace::DefaultMakeSpan::new()
                            .level(tracing::Level::INFO)
                            .make_span(req)
                    }
                })
                .on_request(|req: &Request, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    use tower_http::trace::OnRequest;
                    tower_http::trace::DefaultOnRequest::new()
                        .level(tracing::Level::DEBUG)
                        .on_request(req, span);
                })
                .on_response(|res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    use tower_http::trace::OnResponse;
                    tower_http::trace::DefaultOnResponse::new()
                        .level(tracing::Level::INFO)
                        .on_response(res, latency, span);
                }),
        )
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.state.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let router = self.build_router();
        tracing::info!("Relay server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("Relay server shutting down...");
            })
            .await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
