//! Ad Blocking Stage
//!
//! One instance per filter list: the default list, each enabled
//! regional list, and the user's custom rules. Every instance is a
//! separately registered stage with its own [`FilterList`].
//!
//! A request is checked when:
//! - the main frame is an http(s) page
//! - the request is third-party to the main frame, or the instance
//!   checks main frames, or the main-frame host is configured for
//!   first-party checks
//! - the request host is not on the allowlist
//! - the resource type has a filter-list equivalent

use super::{RuleSlot, StageContext};
use crate::config::{ADBLOCK, AdBlockConfig};
use crate::debounce::{DebouncedResult, Debouncer};
use crate::domain::BaseDomainResolver;
use crate::request::{Phase, RequestDetails, ResourceType};
use crate::rules::filter_list::{FilterList, FilterListError, FilterMatch, FilterResourceType, MatchRequest};
use crate::stage::{FilterStage, StageResult};
use crate::verdict::FilterVerdict;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Which requests the ad-block instances look at
pub struct AdBlockPolicy {
    /// Main-frame hosts whose first-party requests are checked too
    first_party_check_hosts: HashSet<String>,
    /// Request hosts (and their subdomains) never blocked
    allowed_hosts: Vec<String>,
    domains: Arc<BaseDomainResolver>,
}

impl AdBlockPolicy {
    pub fn new(config: &AdBlockConfig, domains: Arc<BaseDomainResolver>) -> Self {
        Self {
            first_party_check_hosts: config
                .first_party_check_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            allowed_hosts: config
                .allowed_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            domains,
        }
    }

    fn is_allowed_host(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|allowed| {
            host == allowed
                || (host.len() > allowed.len()
                    && host.ends_with(allowed.as_str())
                    && host.as_bytes()[host.len() - allowed.len() - 1] == b'.')
        })
    }
}

/// Filter-list resource type of a request type; `None` for types the
/// lists cannot express
pub fn filter_resource_type(resource_type: ResourceType) -> Option<FilterResourceType> {
    Some(match resource_type {
        ResourceType::MainFrame => FilterResourceType::Document,
        ResourceType::SubFrame => FilterResourceType::Subdocument,
        ResourceType::Stylesheet => FilterResourceType::Stylesheet,
        ResourceType::Script => FilterResourceType::Script,
        ResourceType::Image => FilterResourceType::Image,
        ResourceType::Object => FilterResourceType::Object,
        ResourceType::Xhr => FilterResourceType::XmlHttpRequest,
        ResourceType::Other => FilterResourceType::Other,
        ResourceType::Font | ResourceType::Media | ResourceType::WebSocket => return None,
    })
}

/// Whether a request should be matched against the filter lists at all
pub fn should_do_ad_block_check(
    policy: &AdBlockPolicy,
    resource_type: ResourceType,
    first_party: &Url,
    url: &Url,
    check_main_frame: bool,
) -> bool {
    if !matches!(first_party.scheme(), "http" | "https") {
        return false;
    }
    let first_party_host = first_party.host_str().unwrap_or_default();
    let host = url.host_str().unwrap_or_default();

    let in_scope = check_main_frame
        || (resource_type != ResourceType::MainFrame
            && policy.domains.is_third_party_host(first_party_host, host))
        || policy.first_party_check_hosts.contains(first_party_host);

    in_scope && !policy.is_allowed_host(host) && filter_resource_type(resource_type).is_some()
}

/// One ad-block instance bound to one filter list
pub struct AdBlockStage {
    name: String,
    ctx: StageContext,
    policy: Arc<AdBlockPolicy>,
    rules: RuleSlot<FilterList>,
    check_main_frame: bool,
}

impl AdBlockStage {
    /// `name` is the resource the list is loaded from, e.g. `adblock`
    /// or `adblock-<uuid>`
    pub fn new(name: &str, ctx: StageContext, policy: Arc<AdBlockPolicy>) -> Self {
        Self {
            name: name.to_string(),
            ctx,
            policy,
            rules: RuleSlot::new(),
            check_main_frame: false,
        }
    }

    /// Also check top-level navigations
    pub fn checking_main_frame(mut self) -> Self {
        self.check_main_frame = true;
        self
    }

    pub fn rules(&self) -> &RuleSlot<FilterList> {
        &self.rules
    }

    /// Match one request; `None` when the request is out of scope
    pub fn check(&self, details: &RequestDetails) -> Option<FilterMatch> {
        let rules = self.rules.current()?;
        let first_party = self.ctx.parse(details.main_frame_url()?)?;
        let url = self.ctx.parse(&details.url)?;

        if !should_do_ad_block_check(
            &self.policy,
            details.resource_type,
            &first_party,
            &url,
            self.check_main_frame,
        ) {
            return None;
        }

        let host = url.host_str().unwrap_or_default();
        let first_party_host = first_party.host_str().unwrap_or_default();
        let request = MatchRequest {
            url: url.as_str(),
            host,
            resource_type: filter_resource_type(details.resource_type)?,
            first_party_host,
            third_party: self.ctx.domains.is_third_party_host(first_party_host, host),
        };
        Some(rules.check(&request))
    }
}

impl FilterStage for AdBlockStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::BeforeRequest]
    }

    fn is_initialized(&self) -> bool {
        self.rules.is_loaded()
    }

    fn before_request(&self, details: &RequestDetails) -> StageResult {
        if !self
            .ctx
            .is_enabled(ADBLOCK, details.main_frame_url(), details.is_private())
        {
            return Ok(None);
        }
        match self.check(details) {
            Some(FilterMatch::Blocked(rule)) => {
                debug!("{} blocked {} by {}", self.name, details.url, rule);
                Ok(Some(FilterVerdict::cancel(&self.name)))
            }
            _ => Ok(None),
        }
    }
}

/// Why an edit to the custom rules did not take effect
#[derive(Debug, Error)]
pub enum CustomRulesError {
    #[error("Invalid custom rules: {0}")]
    Invalid(#[from] FilterListError),

    #[error("Superseded by a newer edit")]
    Superseded,
}

/// Live editor of the custom-rules instance.
///
/// Edits are debounced; only the last edit of a burst is parsed. A
/// parse failure keeps the rules already in effect.
pub struct CustomRulesEditor {
    debouncer: Debouncer<String, Result<usize, FilterListError>>,
}

impl CustomRulesEditor {
    pub fn new(stage: Arc<AdBlockStage>, delay: Duration) -> Self {
        let debouncer = Debouncer::new(delay, move |text: String| apply_custom_rules(&stage, &text));
        Self { debouncer }
    }

    /// Queue an edit. Must be called inside a tokio runtime.
    pub fn submit(&self, text: impl Into<String>) -> PendingEdit {
        PendingEdit(self.debouncer.submit(text.into()))
    }

    /// Parse and install immediately, dropping any queued edit
    pub fn apply_now(&self, text: impl Into<String>) -> Result<usize, CustomRulesError> {
        Ok(self.debouncer.apply_now(text.into())?)
    }
}

fn apply_custom_rules(stage: &AdBlockStage, text: &str) -> Result<usize, FilterListError> {
    match FilterList::parse_custom(stage.name(), text) {
        Ok(list) => {
            let count = list.rule_count();
            stage.rules().install(list);
            info!("Applied {} custom rules", count);
            Ok(count)
        }
        Err(e) => {
            warn!("Rejected custom rules edit, keeping previous rules: {}", e);
            Err(e)
        }
    }
}

/// Outcome of one submitted edit
pub struct PendingEdit(DebouncedResult<Result<usize, FilterListError>>);

impl PendingEdit {
    /// Number of rules now in effect
    pub async fn wait(self) -> Result<usize, CustomRulesError> {
        match self.0.wait().await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CustomRulesError::Superseded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CUSTOM_ADBLOCK;
    use crate::stages::test_support::context;

    fn policy() -> Arc<AdBlockPolicy> {
        Arc::new(AdBlockPolicy::new(
            &AdBlockConfig {
                allowed_hosts: vec!["allowed.example".to_string()],
                ..Default::default()
            },
            Arc::new(BaseDomainResolver::bundled()),
        ))
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn stage_with(rules: &str) -> (AdBlockStage, Arc<crate::settings::MemorySettings>) {
        let (ctx, settings) = context();
        let stage = AdBlockStage::new(ADBLOCK, ctx, policy());
        stage
            .rules()
            .install(FilterList::parse_bytes(ADBLOCK, rules.as_bytes()).unwrap());
        (stage, settings)
    }

    fn cancelled(stage: &AdBlockStage, details: &RequestDetails) -> bool {
        stage
            .before_request(details)
            .unwrap()
            .is_some_and(|v| v.is_cancel())
    }

    #[test]
    fn test_cross_site_script_is_checked() {
        assert!(should_do_ad_block_check(
            &policy(),
            ResourceType::Script,
            &url("https://brave.com/"),
            &url("https://coffee.com/"),
            false
        ));
    }

    #[test]
    fn test_main_frame_only_when_asked() {
        let page = url("https://brave.com/");
        assert!(!should_do_ad_block_check(&policy(), ResourceType::MainFrame, &page, &page, false));
        assert!(should_do_ad_block_check(&policy(), ResourceType::MainFrame, &page, &page, true));
    }

    #[test]
    fn test_non_http_first_party_is_never_checked() {
        let first_party = url("ftp://brave.com/");
        for resource_type in [ResourceType::Script, ResourceType::Image, ResourceType::MainFrame] {
            assert!(!should_do_ad_block_check(
                &policy(),
                resource_type,
                &first_party,
                &url("https://coffee.com/"),
                false
            ));
        }
    }

    #[test]
    fn test_first_party_check_hosts() {
        let page = url("https://www.googletagmanager.com/");
        let script = url("https://www.googletagmanager.com/gtm.js");
        assert!(should_do_ad_block_check(&policy(), ResourceType::Script, &page, &script, false));
        let page = url("https://news.example/");
        let script = url("https://news.example/app.js");
        assert!(!should_do_ad_block_check(&policy(), ResourceType::Script, &page, &script, false));
    }

    #[test]
    fn test_allowlist_and_unmapped_types() {
        let page = url("https://news.example/");
        assert!(!should_do_ad_block_check(
            &policy(),
            ResourceType::Script,
            &page,
            &url("https://cdn.allowed.example/x.js"),
            false
        ));
        assert!(!should_do_ad_block_check(
            &policy(),
            ResourceType::Font,
            &page,
            &url("https://fonts.example/a.woff"),
            false
        ));
    }

    #[test]
    fn test_stage_blocks_listed_third_party() {
        let (stage, _) = stage_with("||adserver.com^\n");
        let details = RequestDetails::new(1, "https://adserver.com/banner.js", ResourceType::Script)
            .with_first_party("https://news.example/");
        assert!(cancelled(&stage, &details));

        let same_site = RequestDetails::new(2, "https://adserver.com/banner.js", ResourceType::Script)
            .with_first_party("https://www.adserver.com/");
        assert!(!cancelled(&stage, &same_site));
    }

    #[test]
    fn test_stage_respects_settings() {
        let (stage, settings) = stage_with("||adserver.com^\n");
        settings.set_site_enabled("news.example", ADBLOCK, false, false);
        let details = RequestDetails::new(1, "https://adserver.com/banner.js", ResourceType::Script)
            .with_first_party("https://news.example/");
        assert!(!cancelled(&stage, &details));
    }

    #[test]
    fn test_stage_is_inert_until_loaded() {
        let (ctx, _) = context();
        let stage = AdBlockStage::new(ADBLOCK, ctx, policy());
        assert!(!stage.is_initialized());
        let details = RequestDetails::new(1, "https://adserver.com/banner.js", ResourceType::Script)
            .with_first_party("https://news.example/");
        assert!(!cancelled(&stage, &details));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_rules_debounced() {
        let (ctx, _) = context();
        let stage = Arc::new(AdBlockStage::new(CUSTOM_ADBLOCK, ctx, policy()));
        let editor = CustomRulesEditor::new(Arc::clone(&stage), Duration::from_millis(1500));

        let first = editor.submit("||first.example^");
        let second = editor.submit("||second.example^\n||third.example^");
        assert!(matches!(first.wait().await, Err(CustomRulesError::Superseded)));
        assert_eq!(second.wait().await.unwrap(), 2);

        let details = RequestDetails::new(1, "https://second.example/x.js", ResourceType::Script)
            .with_first_party("https://news.example/");
        assert!(cancelled(&stage, &details));
        let details = RequestDetails::new(2, "https://first.example/x.js", ResourceType::Script)
            .with_first_party("https://news.example/");
        assert!(!cancelled(&stage, &details));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_custom_rules_keep_previous() {
        let (ctx, _) = context();
        let stage = Arc::new(AdBlockStage::new(CUSTOM_ADBLOCK, ctx, policy()));
        let editor = CustomRulesEditor::new(Arc::clone(&stage), Duration::from_millis(1500));

        assert_eq!(editor.apply_now("||adserver.com^").unwrap(), 1);
        let result = editor.submit("||adserver.com^$nonsense").wait().await;
        assert!(matches!(result, Err(CustomRulesError::Invalid(_))));
        assert_eq!(stage.rules().current().unwrap().rule_count(), 1);
    }
}
