//! HTTPS Upgrade Stage
//!
//! Rewrites `http:` requests with the loaded [`HttpsRules`], and watches
//! redirect events so a server that keeps bouncing https back to http
//! cannot trap a request in a loop.

use super::{RuleSlot, StageContext};
use crate::config::HTTPS_EVERYWHERE;
use crate::request::{Phase, RedirectDetails, RequestDetails};
use crate::rules::https_rules::{HttpsRules, Rewrite};
use crate::stage::{FilterStage, StageResult};
use crate::verdict::FilterVerdict;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use url::Url;

/// Counters are dropped in bulk past this many tracked requests
const MAX_TRACKED_REQUESTS: usize = 10_000;

#[derive(Default)]
struct GuardState {
    redirects: HashMap<u64, u32>,
    blacklist: HashSet<String>,
}

/// Per-request redirect counters and the resulting blacklist of
/// `host + path` locations that are never upgraded again.
///
/// Blacklist entries live for the lifetime of the guard.
pub struct RedirectLoopGuard {
    threshold: u32,
    state: Mutex<GuardState>,
}

impl RedirectLoopGuard {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            state: Mutex::new(GuardState::default()),
        }
    }

    /// Record one redirect of `request_id` away from `url`. Returns
    /// `true` when this redirect put the location on the blacklist.
    pub fn record(&self, request_id: u64, url: &Url) -> bool {
        let mut state = self.state.lock();
        if state.redirects.len() >= MAX_TRACKED_REQUESTS && !state.redirects.contains_key(&request_id) {
            state.redirects.clear();
        }

        let count = {
            let count = state.redirects.entry(request_id).or_insert(0);
            *count += 1;
            *count
        };
        if count <= self.threshold {
            return false;
        }

        let key = canonical(url);
        let added = state.blacklist.insert(key.clone());
        if added {
            info!(
                "Redirect loop on {} after {} redirects, no longer upgrading it",
                key, count
            );
        }
        added
    }

    pub fn is_blacklisted(&self, url: &Url) -> bool {
        self.state.lock().blacklist.contains(&canonical(url))
    }

    pub fn redirect_count(&self, request_id: u64) -> u32 {
        self.state.lock().redirects.get(&request_id).copied().unwrap_or(0)
    }

    pub fn blacklist_len(&self) -> usize {
        self.state.lock().blacklist.len()
    }
}

/// `host + path`, ignoring scheme, port and query
fn canonical(url: &Url) -> String {
    format!("{}{}", url.host_str().unwrap_or_default(), url.path())
}

pub struct HttpsUpgradeStage {
    ctx: StageContext,
    rules: RuleSlot<HttpsRules>,
    guard: RedirectLoopGuard,
}

impl HttpsUpgradeStage {
    pub fn new(ctx: StageContext, redirect_loop_threshold: u32) -> Self {
        Self {
            ctx,
            rules: RuleSlot::new(),
            guard: RedirectLoopGuard::new(redirect_loop_threshold),
        }
    }

    pub fn rules(&self) -> &RuleSlot<HttpsRules> {
        &self.rules
    }

    pub fn guard(&self) -> &RedirectLoopGuard {
        &self.guard
    }
}

impl FilterStage for HttpsUpgradeStage {
    fn name(&self) -> &str {
        HTTPS_EVERYWHERE
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::BeforeRequest]
    }

    fn is_initialized(&self) -> bool {
        self.rules.is_loaded()
    }

    fn before_request(&self, details: &RequestDetails) -> StageResult {
        let Some(rules) = self.rules.current() else {
            return Ok(None);
        };
        let Some(url) = self.ctx.parse(&details.url) else {
            return Ok(None);
        };
        if url.scheme() != "http" {
            return Ok(None);
        }
        if !self
            .ctx
            .is_enabled(HTTPS_EVERYWHERE, details.main_frame_url(), details.is_private())
        {
            return Ok(None);
        }
        if self.guard.is_blacklisted(&url) {
            debug!("{} is blacklisted after a redirect loop", url);
            return Ok(None);
        }

        match rules.rewrite(&url) {
            Rewrite::Redirect { url: target, ruleset } => {
                debug!("Upgrading {} to {} ({})", url, target, ruleset);
                Ok(Some(FilterVerdict::redirect(HTTPS_EVERYWHERE, target)))
            }
            Rewrite::Excluded(_) | Rewrite::NoMatch => Ok(None),
        }
    }

    fn before_redirect(&self, details: &RedirectDetails) {
        let Some(url) = self.ctx.parse(&details.url) else {
            return;
        };
        self.guard.record(details.id, &url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{PartitionId, ResourceType};
    use crate::stages::test_support::context;

    const RULES: &str = r#"{
        "targets": { "example.com": [1], "loop.example": [2] },
        "rulesets": {
            "1": { "name": "Example",
                   "exclusion": [{ "pattern": "^http://example\\.com/plain" }],
                   "rule": [{ "from": "^http://example\\.com/", "to": "https://example.com/" }] },
            "2": { "name": "Loop",
                   "rule": [{ "from": "^http:", "to": "https:" }] } }
    }"#;

    fn stage() -> HttpsUpgradeStage {
        let (ctx, _) = context();
        let stage = HttpsUpgradeStage::new(ctx, 5);
        stage.rules().install(HttpsRules::from_json(RULES.as_bytes()).unwrap());
        stage
    }

    fn redirect_of(stage: &HttpsUpgradeStage, url: &str) -> Option<String> {
        let details = RequestDetails::new(1, url, ResourceType::MainFrame);
        stage.before_request(&details).unwrap().and_then(|v| v.redirect_url)
    }

    #[test]
    fn test_upgrades_http() {
        let stage = stage();
        assert_eq!(
            redirect_of(&stage, "http://example.com/page").as_deref(),
            Some("https://example.com/page")
        );
        assert_eq!(redirect_of(&stage, "https://example.com/page"), None);
        assert_eq!(redirect_of(&stage, "http://unlisted.example/"), None);
    }

    #[test]
    fn test_exclusion_leaves_url_alone() {
        let stage = stage();
        assert_eq!(redirect_of(&stage, "http://example.com/plain/page"), None);
    }

    #[test]
    fn test_inert_until_loaded() {
        let (ctx, _) = context();
        let stage = HttpsUpgradeStage::new(ctx, 5);
        assert!(!stage.is_initialized());
        assert_eq!(redirect_of(&stage, "http://example.com/page"), None);
    }

    #[test]
    fn test_disabled_for_site() {
        let (ctx, settings) = context();
        let stage = HttpsUpgradeStage::new(ctx, 5);
        stage.rules().install(HttpsRules::from_json(RULES.as_bytes()).unwrap());
        settings.set_site_enabled("example.com", HTTPS_EVERYWHERE, false, false);
        assert_eq!(redirect_of(&stage, "http://example.com/page"), None);
    }

    #[test]
    fn test_redirect_loop_blacklists_after_threshold() {
        let stage = stage();
        let redirect = RedirectDetails {
            id: 42,
            url: "https://loop.example/index".to_string(),
            redirect_url: "http://loop.example/index".to_string(),
            partition: PartitionId::default(),
        };

        for _ in 0..5 {
            stage.before_redirect(&redirect);
        }
        assert_eq!(stage.guard().blacklist_len(), 0);
        assert!(redirect_of(&stage, "http://loop.example/index").is_some());

        stage.before_redirect(&redirect);
        assert_eq!(stage.guard().redirect_count(42), 6);
        assert_eq!(stage.guard().blacklist_len(), 1);
        assert_eq!(redirect_of(&stage, "http://loop.example/index"), None);
        assert_eq!(redirect_of(&stage, "http://loop.example/index?q=1"), None);
        assert!(redirect_of(&stage, "http://loop.example/other").is_some());
    }

    #[test]
    fn test_mixed_scheme_bounce_trips_the_guard() {
        let stage = stage();
        let hop = |url: &str, to: &str| RedirectDetails {
            id: 7,
            url: url.to_string(),
            redirect_url: to.to_string(),
            partition: PartitionId::default(),
        };
        let up = hop("http://loop.example/", "https://loop.example/");
        let down = hop("https://loop.example/", "http://loop.example/");

        for _ in 0..3 {
            stage.before_redirect(&up);
            stage.before_redirect(&down);
        }
        assert_eq!(stage.guard().redirect_count(7), 6);
        assert_eq!(stage.guard().blacklist_len(), 1);
        assert_eq!(redirect_of(&stage, "http://loop.example/"), None);
    }
}
