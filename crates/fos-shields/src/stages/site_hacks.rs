//! Site Hacks Stage
//!
//! Per-site workarounds for pages that break under the other stages, and
//! partner referral headers. Hacks are keyed by the main frame's last two
//! host labels for outgoing headers and by the request hostname for
//! script-polyfill redirects.

use super::StageContext;
use crate::config::{ADBLOCK, NOSCRIPT, SITE_HACKS, TRACKING_PROTECTION};
use crate::domain::last_labels;
use crate::request::{Phase, RequestDetails};
use crate::stage::{FilterStage, StageError, StageResult};
use crate::verdict::FilterVerdict;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hyper::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT};
use std::collections::HashMap;
use tracing::{debug, trace};
use url::Url;

/// Partner site whose script setting decides whether its hack may cancel
const CANCEL_HACK_PARTNER: &str = "https://twitter.com";

const GOOGLEBOT_UA: &str = "Mozilla/5.0 (Windows NT 6.1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/41.0.2228.0 Safari/537.36 Googlebot";

const GTM_POLYFILL: &str = "(function() { var noopfn = function() { ; }; window.ga = window.ga || noopfn; })();";

const GPT_POLYFILL: &str = "(function() { var noopfn = function() { }; var noopthisfn = function() { return this; }; \
var noopnullfn = function() { return null; }; var Slot = function() { }; var p = Slot.prototype; \
p.addService = noopthisfn; p.setTargeting = noopthisfn; p.get = noopnullfn; \
var pubAdsService = { addEventListener: noopthisfn, collapseEmptyDivs: noopfn, disableInitialLoad: noopfn, \
display: noopfn, enableSingleRequest: noopfn, refresh: noopfn, setTargeting: noopthisfn }; \
var gpt = window.googletag || {}; var cmd = gpt.cmd || []; gpt.apiReady = true; gpt.cmd = []; \
gpt.cmd.push = function(a) { try { a(); } catch (ex) { } return 1; }; \
gpt.defineSlot = function() { return new Slot(); }; gpt.defineOutOfPageSlot = function() { return new Slot(); }; \
gpt.display = noopfn; gpt.enableServices = noopfn; gpt.pubads = function() { return pubAdsService; }; \
gpt.pubadsReady = true; window.googletag = gpt; while (cmd.length !== 0) { gpt.cmd.push(cmd.shift()); } })();";

/// What a header hack wants done to one request
#[derive(Debug, Default, PartialEq, Eq)]
struct HeaderHack {
    cookie: Option<String>,
    cancel: bool,
}

/// What a request hack wants done to one request
#[derive(Debug, PartialEq, Eq)]
enum RequestHack {
    Redirect(String),
}

#[derive(Default)]
struct SiteHack {
    user_agent: Option<&'static str>,
    on_send_headers: Option<fn(&Url, &HeaderMap) -> HeaderHack>,
    on_request: Option<fn(&Url) -> Option<RequestHack>>,
    enable_for_adblock: bool,
    enable_for_tracking_protection: bool,
}

fn forbes_cookie(_url: &Url, headers: &HeaderMap) -> HeaderHack {
    let existing = headers.get(COOKIE).and_then(|v| v.to_str().ok()).unwrap_or_default();
    HeaderHack {
        cookie: Some(format!(
            "{}; forbes_ab=true; welcomeAd=true; adblock_session=Off; dailyWelcomeCookie=true",
            existing
        )),
        cancel: false,
    }
}

fn twitter_mobile_redirect(url: &Url, headers: &HeaderMap) -> HeaderHack {
    let from_desktop = headers
        .get(REFERER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|referer| referer.starts_with("https://twitter.com/"));
    HeaderHack {
        cookie: None,
        cancel: from_desktop && url.as_str().starts_with("https://mobile.twitter.com/"),
    }
}

fn gtm_polyfill(url: &Url) -> Option<RequestHack> {
    (url.path() == "/gtm.js").then(|| RequestHack::Redirect(script_data_url(GTM_POLYFILL)))
}

fn gpt_polyfill(url: &Url) -> Option<RequestHack> {
    (url.path() == "/tag/js/gpt.js").then(|| RequestHack::Redirect(script_data_url(GPT_POLYFILL)))
}

fn script_data_url(script: &str) -> String {
    format!("data:application/javascript;base64,{}", STANDARD.encode(script))
}

fn builtin_hacks() -> HashMap<&'static str, SiteHack> {
    HashMap::from([
        (
            "forbes.com",
            SiteHack {
                on_send_headers: Some(forbes_cookie),
                ..Default::default()
            },
        ),
        (
            "twitter.com",
            SiteHack {
                on_send_headers: Some(twitter_mobile_redirect),
                ..Default::default()
            },
        ),
        (
            "cityam.com",
            SiteHack {
                user_agent: Some(GOOGLEBOT_UA),
                ..Default::default()
            },
        ),
        (
            "www.googletagmanager.com",
            SiteHack {
                on_request: Some(gtm_polyfill),
                enable_for_adblock: true,
                enable_for_tracking_protection: true,
                ..Default::default()
            },
        ),
        (
            "www.googletagservices.com",
            SiteHack {
                on_request: Some(gpt_polyfill),
                enable_for_adblock: true,
                enable_for_tracking_protection: true,
                ..Default::default()
            },
        ),
    ])
}

pub struct SiteHacksStage {
    ctx: StageContext,
    hacks: HashMap<&'static str, SiteHack>,
}

impl SiteHacksStage {
    pub fn new(ctx: StageContext) -> Self {
        Self {
            ctx,
            hacks: builtin_hacks(),
        }
    }

    fn apply_referral_headers(&self, url: &Url, headers: &mut HeaderMap) -> Result<bool, StageError> {
        let Some(entries) = self.ctx.settings.referral_headers() else {
            return Ok(false);
        };
        let base = self.ctx.domains.base_domain(url.host_str().unwrap_or_default());

        let mut changed = false;
        for entry in entries.iter().filter(|e| e.domains.iter().any(|d| *d == base)) {
            for (name, value) in &entry.headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| StageError::InvalidHeader(name.clone()))?;
                let value = HeaderValue::from_str(value).map_err(|_| StageError::InvalidHeader(name.to_string()))?;
                headers.insert(name, value);
                changed = true;
            }
        }
        if changed {
            trace!("Added referral headers for {}", base);
        }
        Ok(changed)
    }
}

impl FilterStage for SiteHacksStage {
    fn name(&self) -> &str {
        SITE_HACKS
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::BeforeRequest, Phase::BeforeSendHeaders]
    }

    fn before_request(&self, details: &RequestDetails) -> StageResult {
        let Some(url) = self.ctx.parse(&details.url) else {
            return Ok(None);
        };
        let Some(hack) = url.host_str().and_then(|host| self.hacks.get(host)) else {
            return Ok(None);
        };
        let Some(on_request) = hack.on_request else {
            return Ok(None);
        };

        let main_frame = details.main_frame_url();
        let private = details.is_private();
        let enabled = (hack.enable_for_adblock && self.ctx.is_enabled(ADBLOCK, main_frame, private))
            || (hack.enable_for_tracking_protection
                && self.ctx.is_enabled(TRACKING_PROTECTION, main_frame, private));
        if !enabled {
            return Ok(None);
        }

        Ok(match on_request(&url) {
            Some(RequestHack::Redirect(target)) => {
                debug!("Replacing {} with a polyfill", url);
                Some(FilterVerdict::redirect(SITE_HACKS, target))
            }
            None => None,
        })
    }

    fn before_send_headers(&self, details: &RequestDetails, headers: &HeaderMap) -> StageResult {
        let Some(url) = self.ctx.parse(&details.url) else {
            return Ok(None);
        };
        let Some(main_frame) = details.main_frame_url().and_then(|u| self.ctx.parse(u)) else {
            return Ok(None);
        };

        let mut outgoing = headers.clone();
        let mut changed = false;
        let mut cancel = false;

        let site = last_labels(main_frame.host_str().unwrap_or_default(), 2);
        let own_site = last_labels(url.host_str().unwrap_or_default(), 2);
        let hack = self.hacks.get(site).filter(|_| {
            site == own_site
                && self
                    .ctx
                    .is_enabled(SITE_HACKS, details.main_frame_url(), details.is_private())
        });
        if let Some(hack) = hack {
            if let Some(agent) = hack.user_agent {
                outgoing.insert(USER_AGENT, HeaderValue::from_static(agent));
                changed = true;
            }
            if let Some(on_send_headers) = hack.on_send_headers {
                let result = on_send_headers(&url, headers);
                if let Some(cookie) = result.cookie {
                    let value = HeaderValue::from_str(&cookie)
                        .map_err(|_| StageError::InvalidHeader(COOKIE.to_string()))?;
                    outgoing.insert(COOKIE, value);
                    changed = true;
                }
                cancel = result.cancel
                    && self
                        .ctx
                        .is_enabled(NOSCRIPT, Some(CANCEL_HACK_PARTNER), details.is_private());
            }
            debug!("Applied {} hack to {}", site, url);
        }

        changed |= self.apply_referral_headers(&url, &mut outgoing)?;

        if !changed && !cancel {
            return Ok(None);
        }
        let mut verdict = FilterVerdict::pass(SITE_HACKS);
        if changed {
            verdict = verdict.with_request_headers(outgoing);
        }
        if cancel {
            verdict.cancel = Some(true);
        }
        Ok(Some(verdict))
    }
}
