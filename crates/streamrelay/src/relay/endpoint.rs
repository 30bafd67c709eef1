use std::fmt;

use url::Url;

use crate::error::RelayError;

/// Path the relay is mounted at.
pub const RELAY_PATH: &str = "/proxy";

/// Absolute address of a relay endpoint, e.g. `http://127.0.0.1:3000/proxy`.
///
/// Knows how to wrap an upstream URL into a relayed one and how to recover the
/// upstream URL from a relayed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    base: Url,
}

impl RelayEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self, RelayError> {
        let base = Url::parse(endpoint).map_err(|e| RelayError::invalid_url(endpoint, e.to_string()))?;
        Ok(Self { base })
    }

    /// Endpoint mounted at [`RELAY_PATH`] under a public origin such as `https://relay.example.com`.
    pub fn from_origin(origin: &str) -> Result<Self, RelayError> {
        Self::parse(&format!("{}{RELAY_PATH}", origin.trim_end_matches('/')))
    }

    pub fn as_str(&self) -> &str {
        self.base.as_str()
    }

    /// Relayed form of `target`. URLs that already point at a relay are returned untouched.
    pub fn wrap(&self, target: &str) -> String {
        if Self::unwrap_target(target).is_some() {
            return target.to_string();
        }
        let mut relayed = self.base.clone();
        relayed.set_query(None);
        relayed.query_pairs_mut().append_pair("url", target);
        relayed.into()
    }

    /// Upstream URL carried by a relayed URL, or `None` when `url` is not relayed.
    pub fn unwrap_target(url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        if !parsed.path().ends_with(RELAY_PATH) {
            return None;
        }
        parsed
            .query_pairs()
            .find(|(key, _)| key == "url")
            .map(|(_, value)| value.into_owned())
    }

    /// Upstream URL for `url`, unwrapping it when relayed.
    pub fn upstream_of(url: &str) -> String {
        Self::unwrap_target(url).unwrap_or_else(|| url.to_string())
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_unwrap() {
        let endpoint = RelayEndpoint::from_origin("http://relay.local:3000/").unwrap();
        let target = "https://cdn.example.com/live/index.m3u8?token=a&b=c";
        let wrapped = endpoint.wrap(target);
        assert!(wrapped.starts_with("http://relay.local:3000/proxy?url="));
        assert_eq!(RelayEndpoint::unwrap_target(&wrapped).as_deref(), Some(target));
    }

    #[test]
    fn already_relayed_urls_are_kept() {
        let endpoint = RelayEndpoint::parse("http://relay.local/proxy").unwrap();
        let relayed = "http://other-relay.local/proxy?url=https%3A%2F%2Fcdn.example.com%2Fa.m3u8";
        assert_eq!(endpoint.wrap(relayed), relayed);
    }

    #[test]
    fn plain_urls_are_not_relayed() {
        assert_eq!(RelayEndpoint::unwrap_target("https://cdn.example.com/seg1.ts"), None);
        assert_eq!(
            RelayEndpoint::upstream_of("https://cdn.example.com/seg1.ts"),
            "https://cdn.example.com/seg1.ts"
        );
    }
}
