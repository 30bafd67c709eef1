use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::relay::RelayEndpoint;

/// Path extensions whose query string does not identify the bytes (signatures, tokens).
const MEDIA_EXTENSIONS: [&str; 5] = [".ts", ".m4s", ".aac", ".mp4", ".m3u8"];

/// Normalized identity of a cached resource.
///
/// Relayed URLs are unwrapped to their upstream URL, so the prefetcher and the edge
/// layer agree on keys regardless of which relay address they saw.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn normalize(url: &str) -> Self {
        let upstream = RelayEndpoint::upstream_of(url);
        let Ok(mut parsed) = Url::parse(&upstream) else {
            return Self(upstream);
        };
        parsed.set_fragment(None);
        let path = parsed.path().to_ascii_lowercase();
        if MEDIA_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            parsed.set_query(None);
        }
        Self(parsed.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 of the key; used as the on-disk file stem.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
