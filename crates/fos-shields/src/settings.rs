//! Shields Settings
//!
//! Read access to the user's protection settings. The filter stages do
//! not own settings storage; they query a [`ShieldsSettings`] on every
//! request and the engine is told when something changed.

use crate::config::{ADBLOCK, COOKIE_BLOCK, HTTPS_EVERYWHERE, NOSCRIPT, SITE_HACKS, TRACKING_PROTECTION};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use url::Url;

/// Cookie policy applied to outgoing requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CookieSetting {
    AllowAllCookies,
    #[default]
    #[serde(alias = "block3rdPartyCookie")]
    BlockThirdPartyCookies,
    BlockAllCookies,
}

/// Partner headers sent to the listed domains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralHeaders {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookie_names: Vec<String>,
    #[serde(default)]
    pub expiration: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<ReferralHeaders>),
    One(ReferralHeaders),
}

impl ReferralHeaders {
    /// Parse referral header configuration, given either as one entry or
    /// as a list
    pub fn parse_json(json: &str) -> Result<Vec<Self>, serde_json::Error> {
        Ok(match serde_json::from_str(json)? {
            OneOrMany::Many(entries) => entries,
            OneOrMany::One(entry) => vec![entry],
        })
    }
}

/// Settings collaborator consulted by the filter stages
pub trait ShieldsSettings: Send + Sync {
    /// Whether a protection is on for a page. `main_frame_url` is `None`
    /// when only the global setting matters.
    fn is_resource_enabled(&self, resource: &str, main_frame_url: Option<&str>, is_private: bool) -> bool;

    /// Explicit script setting for an origin: `Some(true)` blocks,
    /// `Some(false)` allows. Temporary settings take precedence.
    fn noscript_setting(&self, origin: &str) -> Option<bool>;

    fn cookie_setting(&self, main_frame_url: &str) -> CookieSetting;

    fn referral_headers(&self) -> Option<Vec<ReferralHeaders>>;
}

#[derive(Debug, Default)]
struct SettingsState {
    global: HashMap<String, bool>,
    /// (host, resource) overrides
    site: HashMap<(String, String), bool>,
    private_site: HashMap<(String, String), bool>,
    /// Hosts with every protection turned off
    shields_down: Vec<String>,
    noscript: HashMap<String, bool>,
    temporary_noscript: HashMap<String, bool>,
    cookie_global: CookieSetting,
    cookie_site: HashMap<String, CookieSetting>,
    referral_headers: Option<Vec<ReferralHeaders>>,
}

/// In-memory settings store
#[derive(Debug, Default)]
pub struct MemorySettings {
    state: RwLock<SettingsState>,
}

impl MemorySettings {
    /// Settings with the stock defaults: every protection on except
    /// script blocking
    pub fn new() -> Self {
        let settings = Self::default();
        {
            let mut state = settings.state.write();
            for resource in [ADBLOCK, TRACKING_PROTECTION, HTTPS_EVERYWHERE, COOKIE_BLOCK, SITE_HACKS] {
                state.global.insert(resource.to_string(), true);
            }
            state.global.insert(NOSCRIPT.to_string(), false);
        }
        settings
    }

    pub fn set_enabled(&self, resource: &str, enabled: bool) {
        self.state.write().global.insert(resource.to_string(), enabled);
    }

    pub fn set_site_enabled(&self, host: &str, resource: &str, enabled: bool, is_private: bool) {
        let key = (host.to_ascii_lowercase(), resource.to_string());
        let mut state = self.state.write();
        if is_private {
            state.private_site.insert(key, enabled);
        } else {
            state.site.insert(key, enabled);
        }
    }

    /// Turn every protection off (`false`) or back on for a host
    pub fn set_shields_up(&self, host: &str, up: bool) {
        let host = host.to_ascii_lowercase();
        let mut state = self.state.write();
        state.shields_down.retain(|h| *h != host);
        if !up {
            state.shields_down.push(host);
        }
    }

    pub fn set_noscript(&self, origin: &str, block: bool, temporary: bool) {
        let mut state = self.state.write();
        let map = if temporary {
            &mut state.temporary_noscript
        } else {
            &mut state.noscript
        };
        map.insert(origin.to_string(), block);
    }

    pub fn clear_temporary_noscript(&self) {
        self.state.write().temporary_noscript.clear();
    }

    pub fn set_cookie_setting(&self, setting: CookieSetting) {
        self.state.write().cookie_global = setting;
    }

    pub fn set_site_cookie_setting(&self, host: &str, setting: CookieSetting) {
        self.state.write().cookie_site.insert(host.to_ascii_lowercase(), setting);
    }

    pub fn set_referral_headers(&self, headers: Option<Vec<ReferralHeaders>>) {
        self.state.write().referral_headers = headers;
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|h| h.to_ascii_lowercase())
}

impl ShieldsSettings for MemorySettings {
    fn is_resource_enabled(&self, resource: &str, main_frame_url: Option<&str>, is_private: bool) -> bool {
        let state = self.state.read();
        if let Some(host) = main_frame_url.and_then(host_of) {
            if state.shields_down.contains(&host) {
                return false;
            }
            let key = (host, resource.to_string());
            if is_private {
                if let Some(enabled) = state.private_site.get(&key) {
                    return *enabled;
                }
            }
            if let Some(enabled) = state.site.get(&key) {
                return *enabled;
            }
        }
        state.global.get(resource).copied().unwrap_or(false)
    }

    fn noscript_setting(&self, origin: &str) -> Option<bool> {
        let state = self.state.read();
        state
            .temporary_noscript
            .get(origin)
            .or_else(|| state.noscript.get(origin))
            .copied()
    }

    fn cookie_setting(&self, main_frame_url: &str) -> CookieSetting {
        let state = self.state.read();
        host_of(main_frame_url)
            .and_then(|host| state.cookie_site.get(&host).copied())
            .unwrap_or(state.cookie_global)
    }

    fn referral_headers(&self) -> Option<Vec<ReferralHeaders>> {
        self.state.read().referral_headers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = MemorySettings::new();
        assert!(settings.is_resource_enabled(ADBLOCK, None, false));
        assert!(!settings.is_resource_enabled(NOSCRIPT, Some("https://a.example/"), false));
        assert!(!settings.is_resource_enabled("unknown", None, false));
        assert_eq!(settings.cookie_setting("https://a.example/"), CookieSetting::BlockThirdPartyCookies);
    }

    #[test]
    fn test_site_overrides() {
        let settings = MemorySettings::new();
        settings.set_site_enabled("news.example", ADBLOCK, false, false);
        settings.set_site_enabled("blog.example", ADBLOCK, false, true);

        assert!(!settings.is_resource_enabled(ADBLOCK, Some("https://news.example/a"), false));
        assert!(settings.is_resource_enabled(ADBLOCK, Some("https://blog.example/"), false));
        assert!(!settings.is_resource_enabled(ADBLOCK, Some("https://blog.example/"), true));
    }

    #[test]
    fn test_shields_down() {
        let settings = MemorySettings::new();
        settings.set_shields_up("news.example", false);
        assert!(!settings.is_resource_enabled(HTTPS_EVERYWHERE, Some("http://news.example/"), false));
        settings.set_shields_up("news.example", true);
        assert!(settings.is_resource_enabled(HTTPS_EVERYWHERE, Some("http://news.example/"), false));
    }

    #[test]
    fn test_temporary_noscript_wins() {
        let settings = MemorySettings::new();
        settings.set_noscript("https://a.example", true, false);
        settings.set_noscript("https://a.example", false, true);
        assert_eq!(settings.noscript_setting("https://a.example"), Some(false));
        settings.clear_temporary_noscript();
        assert_eq!(settings.noscript_setting("https://a.example"), Some(true));
        assert_eq!(settings.noscript_setting("https://b.example"), None);
    }

    #[test]
    fn test_referral_headers_one_or_many() {
        let one = ReferralHeaders::parse_json(
            r#"{"domains": ["test.com"], "headers": {"X-Partner": "partner"}, "cookieNames": [], "expiration": 0}"#,
        )
        .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].headers["X-Partner"], "partner");

        let many = ReferralHeaders::parse_json(r#"[{"domains": ["a.com"]}, {"headers": {"X": "1"}}]"#).unwrap();
        assert_eq!(many.len(), 2);
        assert!(many[1].domains.is_empty());
    }

    #[test]
    fn test_cookie_setting_names() {
        let setting: CookieSetting = serde_json::from_str("\"block3rdPartyCookie\"").unwrap();
        assert_eq!(setting, CookieSetting::BlockThirdPartyCookies);
        let setting: CookieSetting = serde_json::from_str("\"blockAllCookies\"").unwrap();
        assert_eq!(setting, CookieSetting::BlockAllCookies);
    }
}
