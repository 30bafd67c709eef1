//! Relay route.
//!
//! `GET /proxy?url=<target>[&referer=<r>][&ip=<ip>]` fetches the target with retries,
//! rewrites playlists so every URI goes back through this route, and streams
//! anything else. Manifest and segment requests pass through the edge cache first
//! when one is configured.

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AppState;
use super::error::ProxyFailure;
use crate::edge::{EdgePolicy, EdgeRequest, EdgeResponse};
use crate::relay::{RelayBody, RelayEndpoint, RelayOptions, RelayResponse};

const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const EDGE_CACHE_HEADER: &str = "x-edge-cache";
const RELAY_ATTEMPTS_HEADER: &str = "x-relay-attempts";

#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
    pub referer: Option<String>,
    pub ip: Option<String>,
}

impl ProxyQuery {
    fn target(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    fn relay_options(&self, endpoint: RelayEndpoint) -> RelayOptions {
        let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(String::from);
        RelayOptions {
            referer: non_empty(&self.referer),
            forwarded_ip: non_empty(&self.ip),
            extra_headers: Vec::new(),
            rewrite_via: Some(endpoint),
        }
    }
}

fn insert_cors(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

/// Endpoint that rewritten playlists point back at.
fn public_endpoint(state: &AppState, headers: &HeaderMap) -> Result<RelayEndpoint, ProxyFailure> {
    let origin = match (
        state.relay.config().public_origin.as_deref(),
        headers.get(header::HOST).and_then(|h| h.to_str().ok()),
    ) {
        (Some(origin), _) => origin.to_string(),
        (None, Some(host)) => format!("http://{host}"),
        (None, None) => format!("http://{}:{}", state.config.bind_address, state.config.port),
    };
    RelayEndpoint::from_origin(&origin).map_err(|e| ProxyFailure::other(&origin, e.to_string()))
}

pub async fn proxy_options() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    insert_cors(&mut headers);
    (StatusCode::NO_CONTENT, headers)
}

pub async fn proxy_get(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(target) = query.target() else {
        return ProxyFailure::missing_url().into_response();
    };
    let endpoint = match public_endpoint(&state, &headers) {
        Ok(endpoint) => endpoint,
        Err(failure) => return failure.into_response(),
    };
    let options = query.relay_options(endpoint);

    // The handler future is dropped when the player disconnects, which aborts the fetch.
    let token = CancellationToken::new();
    match state.relay.relay(target, &options, &token).await {
        Ok(response) => relay_response(response),
        Err(e) => {
            warn!(url = %target, error = %e, "Relay request failed");
            ProxyFailure::from_relay(target, &e).into_response()
        }
    }
}

fn relay_response(response: RelayResponse) -> Response {
    let RelayResponse {
        status,
        mut headers,
        body,
        attempts,
        ..
    } = response;

    let body = match body {
        RelayBody::Manifest(text) => {
            if !headers.contains_key(header::CONTENT_TYPE) {
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(HLS_CONTENT_TYPE));
            }
            Body::from(text)
        }
        RelayBody::Stream(upstream) => {
            Body::from_stream(upstream.bytes_stream().map_err(std::io::Error::other))
        }
    };

    insert_cors(&mut headers);
    headers.insert(HeaderName::from_static(RELAY_ATTEMPTS_HEADER), HeaderValue::from(attempts));

    let mut out = (status, body).into_response();
    *out.headers_mut() = headers;
    out
}

fn edge_response(response: EdgeResponse) -> Response {
    let mut out = (response.status, Body::from(response.body)).into_response();
    let headers = out.headers_mut();
    if let Some(value) = response
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(
        HeaderName::from_static(EDGE_CACHE_HEADER),
        HeaderValue::from_static(response.source.as_header_value()),
    );
    insert_cors(headers);
    out
}

/// Middleware in front of `/proxy`: serve manifests and segments through the edge cache.
pub async fn edge_intercept(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(edge) = state.edge.clone() else {
        return next.run(request).await;
    };
    if request.method() != Method::GET {
        return next.run(request).await;
    }
    let query = match Query::<ProxyQuery>::try_from_uri(request.uri()) {
        Ok(Query(query)) => query,
        Err(_) => return next.run(request).await,
    };
    let Some(target) = query.target().map(str::to_string) else {
        return next.run(request).await;
    };
    if edge.policy_for(&target) == EdgePolicy::Passthrough {
        return next.run(request).await;
    }

    let endpoint = match public_endpoint(&state, request.headers()) {
        Ok(endpoint) => endpoint,
        Err(failure) => return failure.into_response(),
    };
    let edge_request = EdgeRequest {
        target: target.clone(),
        options: query.relay_options(endpoint),
    };

    match edge.handle(&edge_request).await {
        Ok(response) => {
            debug!(url = %target, source = response.source.as_header_value(), "Edge response");
            edge_response(response)
        }
        Err(e) => {
            warn!(url = %target, error = %e, "Edge fetch failed");
            match e.as_relay() {
                Some(relay_err) => ProxyFailure::from_relay(&target, relay_err),
                None => ProxyFailure::other(&target, e.to_string()),
            }
            .into_response()
        }
    }
}
