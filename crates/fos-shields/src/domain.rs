//! Host Classification
//!
//! Base-domain extraction from the public suffix list, third-party
//! host determination, and internal-network classification shared by
//! the tracking-related stages and the firewall.

use parking_lot::RwLock;
use publicsuffix::{List, Psl};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{trace, warn};
use url::{Host, Url};

/// https://publicsuffix.org/list/ bundled with the crate
const BUNDLED_SUFFIX_LIST: &str = include_str!("../data/public_suffix_list.dat");

const MEMO_CAPACITY: usize = 8192;

/// Top-level labels that never leave the local network
const INTERNAL_SUFFIXES: &[&str] = &[
    "localhost",
    "local",
    "lan",
    "home",
    "internal",
    "intranet",
    "corp",
    "home.arpa",
];

/// Memoized registrable-domain lookup
pub struct BaseDomainResolver {
    list: Option<List>,
    memo: RwLock<HashMap<String, String>>,
}

impl BaseDomainResolver {
    /// Resolver backed by the bundled suffix list
    pub fn bundled() -> Self {
        match BUNDLED_SUFFIX_LIST.parse::<List>() {
            Ok(list) => Self::with_list(Some(list)),
            Err(e) => {
                warn!("Bundled public suffix list failed to parse: {}", e);
                Self::with_list(None)
            }
        }
    }

    /// Resolver backed by a caller-provided list in the publicsuffix.org format
    pub fn from_list_text(text: &str) -> Result<Self, publicsuffix::Error> {
        Ok(Self::with_list(Some(text.parse::<List>()?)))
    }

    fn with_list(list: Option<List>) -> Self {
        Self {
            list,
            memo: RwLock::new(HashMap::new()),
        }
    }

    /// Registrable base domain of `host`, e.g. `example.co.uk` for
    /// `www.example.co.uk`. IP literals and hosts without a registrable
    /// part (`localhost`, bare suffixes) are returned unchanged.
    pub fn base_domain(&self, host: &str) -> String {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(hit) = self.memo.read().get(&host) {
            return hit.clone();
        }

        let base = self.compute(&host);

        let mut memo = self.memo.write();
        if memo.len() >= MEMO_CAPACITY {
            memo.clear();
        }
        memo.insert(host, base.clone());
        base
    }

    fn compute(&self, host: &str) -> String {
        if host.is_empty() || is_ip_literal(host) {
            return host.to_string();
        }
        match &self.list {
            Some(list) => list
                .domain(host.as_bytes())
                .and_then(|d| std::str::from_utf8(d.as_bytes()).ok().map(str::to_string))
                .unwrap_or_else(|| host.to_string()),
            None => last_labels(host, 2).to_string(),
        }
    }

    /// Whether `test_host` is third-party relative to `context_host`.
    ///
    /// Identical hosts are always first-party, including two empty ones.
    /// An empty host against a named one is third-party. IP literals only
    /// match themselves; no DNS resolution happens here.
    pub fn is_third_party_host(&self, context_host: &str, test_host: &str) -> bool {
        if context_host.eq_ignore_ascii_case(test_host) {
            return false;
        }
        if context_host.is_empty() || test_host.is_empty() {
            return true;
        }
        if is_ip_literal(context_host) || is_ip_literal(test_host) {
            return true;
        }
        let third_party = self.base_domain(context_host) != self.base_domain(test_host);
        trace!(
            "third-party check {} vs {}: {}",
            context_host, test_host, third_party
        );
        third_party
    }
}

impl Default for BaseDomainResolver {
    fn default() -> Self {
        Self::bundled()
    }
}

/// The last `n` dot-separated labels of a host
pub fn last_labels(host: &str, n: usize) -> &str {
    let mut dots = host.rmatch_indices('.');
    match dots.nth(n.saturating_sub(1)) {
        Some((idx, _)) => &host[idx + 1..],
        None => host,
    }
}

fn is_ip_literal(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}

/// Loopback, private, link-local, CGNAT, and unique-local addresses
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || (a == 100 && (64..128).contains(&b))
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Hostnames that only make sense on the local network
pub fn is_internal_host(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return is_private_ip(ip);
    }
    if !host.contains('.') {
        return true;
    }
    INTERNAL_SUFFIXES
        .iter()
        .any(|suffix| host == *suffix || host.ends_with(&format!(".{}", suffix)))
}

/// Whether a URL points at the local network
pub fn is_internal_url(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_private_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_private_ip(IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => is_internal_host(domain),
        None => false,
    }
}
