//! Host Set
//!
//! Membership test for large host lists (blocked domains, tracker
//! hosts). A Bloom filter rejects most misses cheaply; an exact set of
//! xxh3 hashes confirms hits so a false positive never blocks anything.
//!
//! For 100,000 hosts at 0.1% FP rate the filter is ~180 KB.

use bloomfilter::Bloom;
use std::collections::HashSet;
use xxhash_rust::xxh3::xxh3_64;

/// Default false positive rate of the prefilter
const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.001;

/// Sizing used when the caller has no better estimate
const DEFAULT_EXPECTED_ITEMS: usize = 10_000;

/// Immutable-after-build set of lowercase hosts
pub struct HostSet {
    prefilter: Bloom<[u8]>,
    exact: HashSet<u64>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EXPECTED_ITEMS)
    }

    pub fn with_capacity(expected_items: usize) -> Self {
        Self {
            prefilter: Bloom::new_for_fp_rate(expected_items.max(1), DEFAULT_FALSE_POSITIVE_RATE),
            exact: HashSet::with_capacity(expected_items),
        }
    }

    pub fn insert(&mut self, host: &str) {
        let normalized = normalize_host(host);
        if normalized.is_empty() {
            return;
        }
        self.prefilter.set(normalized.as_bytes());
        self.exact.insert(xxh3_64(normalized.as_bytes()));
    }

    /// Exact membership of `host`
    #[inline]
    pub fn contains(&self, host: &str) -> bool {
        let normalized = normalize_host(host);
        self.contains_normalized(&normalized)
    }

    #[inline]
    fn contains_normalized(&self, host: &str) -> bool {
        self.prefilter.check(host.as_bytes()) && self.exact.contains(&xxh3_64(host.as_bytes()))
    }

    /// The longest suffix of `host` (itself or a parent domain) that is in
    /// the set
    pub fn matching_suffix<'a>(&self, host: &'a str) -> Option<&'a str> {
        let host = host.trim_end_matches('.');
        let mut rest = host;
        loop {
            if rest.bytes().any(|b| b.is_ascii_uppercase()) {
                if self.contains_normalized(&rest.to_ascii_lowercase()) {
                    return Some(rest);
                }
            } else if self.contains_normalized(rest) {
                return Some(rest);
            }

            match rest.find('.') {
                Some(dot) => rest = &rest[dot + 1..],
                None => break,
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Approximate heap footprint in bytes
    pub fn memory_usage(&self) -> usize {
        self.prefilter.bitmap().len() + self.exact.len() * 8
    }
}

impl Default for HostSet {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> FromIterator<&'a str> for HostSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let hosts: Vec<&str> = iter.into_iter().collect();
        let mut set = Self::with_capacity(hosts.len().max(DEFAULT_EXPECTED_ITEMS));
        for host in hosts {
            set.insert(host);
        }
        set
    }
}

#[inline]
fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_membership() {
        let set: HostSet = ["doubleclick.net", "Tracker.Example"].into_iter().collect();
        assert!(set.contains("doubleclick.net"));
        assert!(set.contains("tracker.example"));
        assert!(set.contains("DOUBLECLICK.NET."));
        assert!(!set.contains("google.com"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_matching_suffix() {
        let set: HostSet = ["doubleclick.net", "ads.example.com"].into_iter().collect();
        assert_eq!(set.matching_suffix("stats.g.doubleclick.net"), Some("doubleclick.net"));
        assert_eq!(set.matching_suffix("x.ads.example.com"), Some("ads.example.com"));
        assert_eq!(set.matching_suffix("example.com"), None);
        assert_eq!(set.matching_suffix("notdoubleclick.net"), None);
    }

    #[test]
    fn test_empty_set() {
        let set = HostSet::new();
        assert!(set.is_empty());
        assert!(!set.contains("anything.example"));
        assert!(set.memory_usage() > 0);
    }
}
