use std::fmt;
use std::path::PathBuf;

use reqwest::StatusCode;

/// Why the last relay attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Upstream answered with a retryable status.
    Status(StatusCode),
    /// The per-attempt timeout elapsed.
    Timeout,
    /// Connection, TLS or body transport failure.
    Transport(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP {}", status.as_u16()),
            Self::Timeout => f.write_str("attempt timed out"),
            Self::Transport(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("unsupported scheme `{scheme}`, only http and https can be relayed")]
    UnsupportedScheme { scheme: String },

    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: AttemptFailure },

    #[error("request failed: {reason}")]
    Request { reason: String },

    #[error("relay request cancelled")]
    Cancelled,

    #[error("HTTP client configuration error: {reason}")]
    Client { reason: String },
}

impl RelayError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn exhausted(attempts: u32, last: AttemptFailure) -> Self {
        Self::Exhausted { attempts, last }
    }

    /// Number of attempts made before giving up, when the retry loop ran.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Status of the final attempt, if the upstream answered at all.
    pub fn last_status(&self) -> Option<StatusCode> {
        match self {
            Self::Exhausted {
                last: AttemptFailure::Status(status),
                ..
            } => Some(*status),
            _ => None,
        }
    }

    /// The target itself was rejected; retrying cannot help.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidUrl { .. } | Self::UnsupportedScheme { .. })
    }

    /// Transient upstream trouble: 503s, timeouts and transport resets.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Exhausted { last, .. } => match last {
                AttemptFailure::Status(status) => *status == StatusCode::SERVICE_UNAVAILABLE,
                AttemptFailure::Timeout | AttemptFailure::Transport(_) => true,
            },
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("upstream unavailable for {url}: {reason}")]
    Unavailable { url: String, reason: String },

    #[error("failed to fetch manifest {url}: {reason}")]
    Fetch {
        url: String,
        status: Option<StatusCode>,
        reason: String,
    },

    #[error("failed to parse manifest {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("invalid manifest URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("variant playlists nested deeper than {depth} levels at {url}")]
    TooDeep { url: String, depth: usize },
}

impl ResolveError {
    pub fn unavailable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn fetch(url: impl Into<String>, status: Option<StatusCode>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            status,
            reason: reason.into(),
        }
    }

    pub fn parse(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Callers use this to keep transient network states out of error logs.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("corrupt cache metadata at {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode cache metadata: {source}")]
    Encode {
        #[from]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("network fetch failed for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl EdgeError {
    pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn as_relay(&self) -> Option<&RelayError> {
        match self {
            Self::Relay(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid bind address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
