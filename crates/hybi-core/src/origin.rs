//! Origin allow-list for the upgrade handshake.
//!
//! Entries are `host:port` pairs where either side may be `*`:
//!
//! | Entry               | Matches                                   |
//! |---------------------|-------------------------------------------|
//! | `"*:*"`             | Every origin.                             |
//! | `"example.com:80"`  | That host on that port.                   |
//! | `"example.com:*"`   | That host on any port.                    |
//! | `"*:8080"`          | Any host on that port.                    |
//! | `"example.com"`     | Same as `"example.com:*"`.                |
//!
//! The list is built once at startup and only read afterwards, so it is shared
//! between conversations without locking.

use std::collections::HashSet;
use tracing::warn;
use url::Url;

const WILDCARD: &str = "*";

/// A parsed allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginPattern {
    pub host: String,
    pub port: String,
}

impl OriginPattern {
    /// Parse one `host:port` entry. Hosts are compared case-insensitively.
    pub fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !port.is_empty() => (host, port),
            _ => (entry, WILDCARD),
        };
        Self {
            host: host.to_ascii_lowercase(),
            port: port.to_string(),
        }
    }

    fn key(host: &str, port: &str) -> Self {
        Self {
            host: host.to_string(),
            port: port.to_string(),
        }
    }
}

/// The server-wide set of accepted origins.
#[derive(Debug, Clone)]
pub struct OriginAllowList {
    entries: HashSet<OriginPattern>,
    /// Fast path: `*:*` is present.
    allow_all: bool,
}

impl Default for OriginAllowList {
    /// Accept every origin.
    fn default() -> Self {
        Self::new(["*:*"])
    }
}

impl OriginAllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries: HashSet<OriginPattern> = entries
            .into_iter()
            .map(|e| OriginPattern::parse(e.as_ref()))
            .collect();
        let allow_all = entries.contains(&OriginPattern::key(WILDCARD, WILDCARD));
        Self { entries, allow_all }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify the origin a client presented.
    ///
    /// A literal `"null"` origin stands for the wildcard host, which only the
    /// `*:*` entry accepts. An empty origin is rejected unless `*:*` is
    /// present.
    pub fn verify(&self, origin: &str) -> bool {
        let origin = if origin == "null" { WILDCARD } else { origin };

        if self.allow_all {
            return true;
        }
        if origin.is_empty() {
            warn!("origin missing from websocket call, yet required by config");
            return false;
        }

        let Some((host, port)) = split_origin(origin) else {
            warn!(origin = %origin, "error parsing origin");
            return false;
        };
        let port = port.map(|p| p.to_string());

        let ok = match port.as_deref() {
            Some(port) => {
                self.entries.contains(&OriginPattern::key(&host, port))
                    || self.entries.contains(&OriginPattern::key(&host, WILDCARD))
                    || self.entries.contains(&OriginPattern::key(WILDCARD, port))
            }
            None => self.entries.contains(&OriginPattern::key(&host, WILDCARD)),
        };
        if !ok {
            warn!(origin = %origin, "illegal origin");
        }
        ok
    }
}

/// Split an origin URL into its lowercase hostname and effective port.
fn split_origin(origin: &str) -> Option<(String, Option<u16>)> {
    let url = Url::parse(origin).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some((host, url.port_or_known_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_accepts_everything() {
        let list = OriginAllowList::new(["example.com:80", "*:*"]);
        assert!(list.verify("http://evil.com:80"));
        assert!(list.verify("null"));
        assert!(list.verify("not a url"));
    }

    #[test]
    fn exact_host_and_port() {
        let list = OriginAllowList::new(["example.com:80"]);
        assert!(list.verify("http://example.com:80"));
        assert!(list.verify("http://example.com"));
        assert!(list.verify("http://EXAMPLE.com:80"));
        assert!(!list.verify("http://evil.com:80"));
        assert!(!list.verify("https://example.com"));
    }

    #[test]
    fn host_wildcard_port() {
        let list = OriginAllowList::new(["example.com:*"]);
        assert!(list.verify("https://example.com:8443"));
        assert!(!list.verify("https://other.com:8443"));
    }

    #[test]
    fn port_wildcard_host() {
        let list = OriginAllowList::new(["*:8080"]);
        assert!(list.verify("http://a.example:8080"));
        assert!(list.verify("http://b.example:8080"));
        assert!(!list.verify("http://a.example:8081"));
    }

    #[test]
    fn bare_host_means_any_port() {
        let list = OriginAllowList::new(["example.com"]);
        assert!(list.verify("http://example.com:3000"));
    }

    #[test]
    fn missing_or_null_origin_rejected_without_wildcard() {
        let list = OriginAllowList::new(["example.com:80"]);
        assert!(!list.verify(""));
        assert!(!list.verify("null"));
    }

    #[test]
    fn empty_list_rejects() {
        let list = OriginAllowList::new(Vec::<String>::new());
        assert!(list.is_empty());
        assert!(!list.verify("http://example.com:80"));
    }
}
