//! Cached URL Parser
//!
//! Every filter stage parses the request URL and the main-frame URL,
//! often for the same handful of pages. Parsing once and handing out
//! shared `Arc<Url>`s keeps that cost off the hot path.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use url::Url;

/// Default maximum number of cached entries
const DEFAULT_CAPACITY: usize = 4096;

/// Memoizing URL parser
pub struct UrlCache {
    entries: RwLock<HashMap<String, Arc<Url>>>,
    capacity: usize,
}

impl UrlCache {
    /// Create a cache with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Parse a URL, returning the cached result when this exact string
    /// was seen before. Unparseable input is not cached.
    pub fn parse(&self, input: &str) -> Option<Arc<Url>> {
        if let Some(hit) = self.entries.read().get(input) {
            return Some(Arc::clone(hit));
        }

        let parsed = Arc::new(Url::parse(input).ok()?);

        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            // Drop a quarter of the entries; the working set refills quickly.
            let evict: Vec<String> = entries.keys().take(entries.len() / 4 + 1).cloned().collect();
            for key in evict {
                entries.remove(&key);
            }
            trace!("URL cache evicted entries, {} remain", entries.len());
        }
        // Another caller may have raced us; keep the first Arc so results stay pointer-equal.
        let entry = entries.entry(input.to_string()).or_insert(parsed);
        Some(Arc::clone(entry))
    }

    /// Hostname of a URL, lowercased by the parser
    pub fn host(&self, input: &str) -> Option<String> {
        self.parse(input)?.host_str().map(str::to_string)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for UrlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_parse_is_same_arc() {
        let cache = UrlCache::new();
        let first = cache.parse("https://brave.com/path?q=1").unwrap();
        let second = cache.parse("https://brave.com/path?q=1").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, Url::parse("https://brave.com/path?q=1").unwrap());
    }

    #[test]
    fn test_invalid_url_not_cached() {
        let cache = UrlCache::new();
        assert!(cache.parse("not a url").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_keeps_bound() {
        let cache = UrlCache::with_capacity(8);
        for i in 0..50 {
            cache.parse(&format!("https://site{}.example/", i));
        }
        assert!(cache.len() <= 8);
    }

    #[test]
    fn test_host() {
        let cache = UrlCache::new();
        assert_eq!(cache.host("https://WWW.Example.com:8080/x"), Some("www.example.com".to_string()));
        assert_eq!(cache.host("about:blank"), None);
    }
}
