//! Filter Stages
//!
//! The concrete [`FilterStage`](crate::stage::FilterStage)
//! implementations. Stages share a [`StageContext`] with the settings
//! collaborator and the parsing caches; stages backed by a data file hold
//! their rule set in a [`RuleSlot`] that the data file manager fills.

pub mod ad_block;
pub mod cookies;
pub mod firewall;
pub mod https_upgrade;
pub mod script_block;
pub mod site_hacks;
pub mod tracking_protection;

pub use ad_block::{AdBlockStage, CustomRulesEditor, CustomRulesError, should_do_ad_block_check};
pub use cookies::CookieStage;
pub use firewall::FirewallStage;
pub use https_upgrade::{HttpsUpgradeStage, RedirectLoopGuard};
pub use script_block::{ScriptBlockStage, TemporaryScriptAllowance};
pub use site_hacks::SiteHacksStage;
pub use tracking_protection::TrackingProtectionStage;

use crate::domain::BaseDomainResolver;
use crate::settings::ShieldsSettings;
use crate::url_cache::UrlCache;
use parking_lot::RwLock;
use std::sync::Arc;
use url::Url;

/// Collaborators every stage reads from
#[derive(Clone)]
pub struct StageContext {
    pub settings: Arc<dyn ShieldsSettings>,
    pub urls: Arc<UrlCache>,
    pub domains: Arc<BaseDomainResolver>,
}

impl StageContext {
    pub fn new(settings: Arc<dyn ShieldsSettings>) -> Self {
        Self {
            settings,
            urls: Arc::new(UrlCache::new()),
            domains: Arc::new(BaseDomainResolver::bundled()),
        }
    }

    pub fn parse(&self, url: &str) -> Option<Arc<Url>> {
        self.urls.parse(url)
    }

    pub fn is_enabled(&self, resource: &str, main_frame_url: Option<&str>, is_private: bool) -> bool {
        self.settings.is_resource_enabled(resource, main_frame_url, is_private)
    }
}

/// Rule set of one stage, replaced wholesale.
///
/// Readers clone the `Arc` and keep evaluating against the set they got
/// even if a new one is installed meanwhile.
pub struct RuleSlot<T> {
    current: RwLock<Option<Arc<T>>>,
}

impl<T> RuleSlot<T> {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    pub fn install(&self, rules: T) {
        *self.current.write() = Some(Arc::new(rules));
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }

    pub fn current(&self) -> Option<Arc<T>> {
        self.current.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }
}

impl<T> Default for RuleSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_slot_swap_keeps_old_readers() {
        let slot = RuleSlot::new();
        assert!(!slot.is_loaded());
        slot.install(vec![1, 2]);
        let held = slot.current().unwrap();
        slot.install(vec![3]);
        assert_eq!(*held, vec![1, 2]);
        assert_eq!(*slot.current().unwrap(), vec![3]);
        slot.clear();
        assert!(slot.current().is_none());
    }
}
