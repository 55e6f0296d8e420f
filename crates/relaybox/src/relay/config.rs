use std::hash::{Hash, Hasher};
use url::Url;

/// Canonical form of a relay url.
///
/// Scheme and host are lower-cased, default ports are dropped and the
/// root path loses its trailing slash, so `wss://Example.com:443/` and
/// `wss://example.com` map to the same key. Non-root paths are kept
/// exactly as written, trailing slash included. Anything that does not
/// parse as a url with a host comes back unchanged.
pub fn normalize_relay_url(url: &str) -> String {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(_) => return url.to_string(),
    };

    let host = match parsed.host_str() {
        Some(host) => host,
        None => return url.to_string(),
    };

    let mut out = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    if parsed.path() != "/" {
        out.push_str(parsed.path());
    }
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// One relay endpoint and how the client uses it: `read` relays receive
/// subscriptions, `write` relays receive published events.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    url: String,
    pub read: bool,
    pub write: bool,
}

impl RelayConfig {
    pub fn new(url: &str, read: bool, write: bool) -> Self {
        RelayConfig {
            url: normalize_relay_url(url),
            read,
            write,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

// Identity is the normalized url, not the read/write flags. A pool never
// holds two configs for the same relay.
impl PartialEq for RelayConfig {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for RelayConfig {}

impl Hash for RelayConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}
