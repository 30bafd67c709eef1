// Relay Fetcher: outbound requests on behalf of the player, with retries,
// header spoofing and manifest rewriting.

mod endpoint;
mod rewrite;

pub use endpoint::{RELAY_PATH, RelayEndpoint};
pub use rewrite::{is_manifest, rewrite_manifest};

use bytes::Bytes;
use rand::RngExt;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::RelayConfig;
use crate::error::{AttemptFailure, RelayError};
use crate::retry::{RetryAction, RetryError, RetryPolicy, is_retryable_reqwest_error, retry_with_backoff};

/// Response headers that describe the upstream framing and must not be forwarded.
const FRAMING_HEADERS: [HeaderName; 3] = [
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

/// Per-request knobs for [`RelayFetcher::relay`].
#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Overrides the default `Referer` (the target's origin).
    pub referer: Option<String>,
    /// Overrides the configured forwarded client address.
    pub forwarded_ip: Option<String>,
    /// Merged after the spoofing headers, so they win on conflicts.
    pub extra_headers: Vec<(String, String)>,
    /// Rewrite manifests so their URI lines point at this endpoint.
    pub rewrite_via: Option<RelayEndpoint>,
}

impl RelayOptions {
    pub fn rewriting_via(endpoint: RelayEndpoint) -> Self {
        Self {
            rewrite_via: Some(endpoint),
            ..Default::default()
        }
    }
}

pub enum RelayBody {
    /// Rewritten playlist text.
    Manifest(String),
    /// Upstream body, not yet read.
    Stream(reqwest::Response),
}

impl std::fmt::Debug for RelayBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manifest(text) => f.debug_tuple("Manifest").field(&text.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct RelayResponse {
    pub status: StatusCode,
    /// Upstream headers minus framing headers.
    pub headers: HeaderMap,
    pub body: RelayBody,
    /// Attempts spent, the successful one included.
    pub attempts: u32,
    pub target: Url,
}

impl RelayResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn is_manifest(&self) -> bool {
        matches!(self.body, RelayBody::Manifest(_))
    }

    /// Read the whole body into memory.
    pub async fn into_bytes(self) -> Result<Bytes, RelayError> {
        match self.body {
            RelayBody::Manifest(text) => Ok(Bytes::from(text)),
            RelayBody::Stream(response) => response.bytes().await.map_err(|e| RelayError::Request {
                reason: format!("failed to read body: {e}"),
            }),
        }
    }
}

/// Shared outbound client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RelayFetcher {
    client: reqwest::Client,
    config: RelayConfig,
    policy: RetryPolicy,
}

impl RelayFetcher {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        // No overall request timeout: segment bodies may stream for longer than one attempt.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .tcp_nodelay(true)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| RelayError::Client {
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: RelayConfig) -> Self {
        let policy = config.retry_policy();
        Self {
            client,
            config,
            policy,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch `target` with retries.
    ///
    /// 503s, timeouts and transport errors are retried; any other status is returned
    /// as-is. Cancelling `token` aborts the in-flight attempt.
    #[instrument(skip(self, target, options, token), fields(url = %target))]
    pub async fn relay(
        &self,
        target: &str,
        options: &RelayOptions,
        token: &CancellationToken,
    ) -> Result<RelayResponse, RelayError> {
        let url = parse_target(target)?;
        let headers = self.spoofed_headers(&url, options);
        let attempt_timeout = self.config.attempt_timeout();

        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(RelayError::Cancelled),
            outcome = retry_with_backoff(&self.policy, token, |attempt| {
                let request = self.client.get(url.clone()).headers(headers.clone());
                self.attempt(request, attempt, attempt_timeout)
            }) => outcome,
        };

        let (attempts, response) = outcome.map_err(|err| match err {
            RetryError::Exhausted { attempts, last } => {
                warn!(attempts, last = %last, "Relay attempts exhausted");
                RelayError::exhausted(attempts, last)
            }
            RetryError::Failed { error, .. } => RelayError::Request {
                reason: error.to_string(),
            },
            RetryError::Cancelled => RelayError::Cancelled,
        })?;

        let status = response.status();
        if attempts > 1 {
            debug!(attempts, status = status.as_u16(), "Relay succeeded after retries");
        }

        let mut headers = response.headers().clone();
        for name in &FRAMING_HEADERS {
            headers.remove(name);
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let body = match &options.rewrite_via {
            Some(endpoint) if status.is_success() && is_manifest(content_type, &url) => {
                let text = response.text().await.map_err(|e| RelayError::Request {
                    reason: format!("failed to read manifest: {e}"),
                })?;
                RelayBody::Manifest(rewrite_manifest(&text, &url, endpoint))
            }
            _ => RelayBody::Stream(response),
        };

        Ok(RelayResponse {
            status,
            headers,
            body,
            attempts,
            target: url,
        })
    }

    async fn attempt(
        &self,
        request: reqwest::RequestBuilder,
        attempt: u32,
        attempt_timeout: Duration,
    ) -> RetryAction<(u32, reqwest::Response), AttemptFailure> {
        match tokio::time::timeout(attempt_timeout, request.send()).await {
            Err(_) => RetryAction::Retry(AttemptFailure::Timeout),
            Ok(Err(e)) if is_retryable_reqwest_error(&e) => {
                RetryAction::Retry(AttemptFailure::Transport(e.to_string()))
            }
            Ok(Err(e)) => RetryAction::Fail(AttemptFailure::Transport(e.to_string())),
            Ok(Ok(response)) if self.policy.is_retryable_status(response.status()) => {
                RetryAction::Retry(AttemptFailure::Status(response.status()))
            }
            Ok(Ok(response)) => RetryAction::Success((attempt, response)),
        }
    }

    fn spoofed_headers(&self, url: &Url, options: &RelayOptions) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(ua) = self.pick_user_agent()
            && let Ok(value) = HeaderValue::from_str(ua)
        {
            headers.insert(header::USER_AGENT, value);
        }

        let ip = options
            .forwarded_ip
            .as_deref()
            .unwrap_or(&self.config.forwarded_ip);
        if let Ok(value) = HeaderValue::from_str(ip) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), value.clone());
            headers.insert(HeaderName::from_static("client-ip"), value);
        }

        let referer = options
            .referer
            .clone()
            .unwrap_or_else(|| url.origin().ascii_serialization());
        if let Ok(value) = HeaderValue::from_str(&referer) {
            headers.insert(header::REFERER, value);
        }

        for (name, value) in &options.extra_headers {
            let lower = name.to_ascii_lowercase();
            if lower == "host" || lower == "connection" {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid extra header"),
            }
        }

        headers
    }

    fn pick_user_agent(&self) -> Option<&str> {
        let pool = &self.config.user_agents;
        if pool.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..pool.len());
        pool.get(index).map(String::as_str)
    }
}

/// Only absolute `http`/`https` targets can be relayed.
pub fn parse_target(target: &str) -> Result<Url, RelayError> {
    let url = Url::parse(target).map_err(|e| RelayError::invalid_url(target, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RelayError::UnsupportedScheme {
            scheme: other.to_string(),
        }),
    }
}
