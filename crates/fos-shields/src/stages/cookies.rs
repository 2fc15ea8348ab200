//! Cookie Stage
//!
//! Applies the page's cookie setting to outgoing request headers: drops
//! `Cookie` where the setting forbids it and trims third-party `Referer`
//! values down to the request's own origin.

use super::StageContext;
use crate::config::COOKIE_BLOCK;
use crate::request::{Phase, RequestDetails};
use crate::settings::CookieSetting;
use crate::stage::{FilterStage, StageError, StageResult};
use crate::verdict::FilterVerdict;
use hyper::header::{COOKIE, HeaderMap, HeaderValue, REFERER};
use tracing::trace;
use url::Url;

/// First-party origin → request origins that keep their cookies.
/// `*` matches any run of characters.
const COOKIE_EXCEPTIONS: &[(&str, &[&str])] = &[
    ("https://drive.google.com", &["https://*.googleusercontent.com"]),
    ("https://inbox.google.com", &["https://hangouts.google.com"]),
];

/// Request hosts that always receive the full referer
const REFERER_EXCEPTIONS: &[&str] = &["use.typekit.net", "cloud.typography.com"];

pub struct CookieStage {
    ctx: StageContext,
}

impl CookieStage {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    /// Headers after applying `setting` to a request for `url` made by
    /// the page at `first_party`. `None` when nothing changes.
    pub fn apply_cookie_setting(
        &self,
        setting: CookieSetting,
        headers: &HeaderMap,
        url: &Url,
        first_party: &Url,
    ) -> Result<Option<HeaderMap>, StageError> {
        if setting == CookieSetting::AllowAllCookies {
            return Ok(None);
        }

        let host = url.host_str().unwrap_or_default();
        let first_party_host = first_party.host_str().unwrap_or_default();
        let origin = url.origin().ascii_serialization();

        let mut outgoing = headers.clone();
        let mut changed = false;

        let strip_cookie = match setting {
            CookieSetting::BlockAllCookies => true,
            _ => self.ctx.domains.is_third_party_host(first_party_host, host),
        };
        if strip_cookie
            && headers.contains_key(COOKIE)
            && !has_cookie_exception(&first_party.origin().ascii_serialization(), &origin)
        {
            outgoing.remove(COOKIE);
            changed = true;
        }

        let referer_host = headers
            .get(REFERER)
            .and_then(|v| v.to_str().ok())
            .and_then(|referer| self.ctx.parse(referer))
            .and_then(|referer| referer.host_str().map(str::to_string));
        let foreign_referer = referer_host
            .is_some_and(|referer_host| self.ctx.domains.is_third_party_host(&referer_host, host));
        if foreign_referer && !REFERER_EXCEPTIONS.contains(&host) {
            let value = HeaderValue::from_str(&origin).map_err(|_| StageError::InvalidHeader(REFERER.to_string()))?;
            outgoing.insert(REFERER, value);
            changed = true;
        }

        Ok(changed.then_some(outgoing))
    }
}

fn has_cookie_exception(first_party_origin: &str, request_origin: &str) -> bool {
    COOKIE_EXCEPTIONS
        .iter()
        .filter(|(first_party, _)| *first_party == first_party_origin)
        .flat_map(|(_, allowed)| allowed.iter())
        .any(|pattern| wildcard_match(pattern, request_origin))
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((prefix, rest)) => {
            let Some(text) = text.strip_prefix(prefix) else {
                return false;
            };
            (0..=text.len())
                .filter(|i| text.is_char_boundary(*i))
                .any(|i| wildcard_match(rest, &text[i..]))
        }
    }
}

impl FilterStage for CookieStage {
    fn name(&self) -> &str {
        COOKIE_BLOCK
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::BeforeSendHeaders]
    }

    fn before_send_headers(&self, details: &RequestDetails, headers: &HeaderMap) -> StageResult {
        let Some(main_frame_url) = details.main_frame_url() else {
            return Ok(None);
        };
        let (Some(url), Some(first_party)) = (self.ctx.parse(&details.url), self.ctx.parse(main_frame_url)) else {
            return Ok(None);
        };
        if !self
            .ctx
            .is_enabled(COOKIE_BLOCK, Some(main_frame_url), details.is_private())
        {
            return Ok(None);
        }

        let setting = self.ctx.settings.cookie_setting(main_frame_url);
        let Some(headers) = self.apply_cookie_setting(setting, headers, &url, &first_party)? else {
            return Ok(None);
        };
        trace!("Cookie setting {:?} rewrote headers of {}", setting, details.url);
        Ok(Some(FilterVerdict::pass(COOKIE_BLOCK).with_request_headers(headers)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ResourceType;
    use crate::stages::test_support::context;

    const COOKIE_VALUE: &str = "optimizelyEndUserId=oeu1491721215718r0.02; __ssid=97b17d31";

    fn stage() -> CookieStage {
        let (ctx, _) = context();
        CookieStage::new(ctx)
    }

    fn apply(setting: CookieSetting, headers: &HeaderMap, url: &str, first_party: &str) -> HeaderMap {
        stage()
            .apply_cookie_setting(setting, headers, &Url::parse(url).unwrap(), &Url::parse(first_party).unwrap())
            .unwrap()
            .unwrap_or_else(|| headers.clone())
    }

    fn with(name: hyper::header::HeaderName, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_block_all_clears_cookie() {
        let result = apply(
            CookieSetting::BlockAllCookies,
            &with(COOKIE, COOKIE_VALUE),
            "https://cdnp3.stackassets.com/store/image.jpg",
            "https://slashdot.org/",
        );
        assert!(result.get(COOKIE).is_none());
    }

    #[test]
    fn test_cookie_exceptions() {
        let headers = with(COOKIE, COOKIE_VALUE);
        let result = apply(
            CookieSetting::BlockAllCookies,
            &headers,
            "https://hangouts.google.com/",
            "https://inbox.google.com/",
        );
        assert_eq!(result[COOKIE], COOKIE_VALUE);

        let result = apply(
            CookieSetting::BlockAllCookies,
            &headers,
            "https://doc-0g-3g-docs.googleusercontent.com",
            "https://drive.google.com",
        );
        assert_eq!(result[COOKIE], COOKIE_VALUE);
    }

    #[test]
    fn test_third_party_cookie_blocked() {
        let headers = with(COOKIE, COOKIE_VALUE);
        let result = apply(
            CookieSetting::BlockThirdPartyCookies,
            &headers,
            "https://tracker.com/p",
            "https://brave.com/",
        );
        assert!(result.get(COOKIE).is_none());

        let result = apply(
            CookieSetting::BlockThirdPartyCookies,
            &headers,
            "https://cdn.brave.com/p",
            "https://brave.com/",
        );
        assert_eq!(result[COOKIE], COOKIE_VALUE);
    }

    #[test]
    fn test_third_party_referer_is_trimmed() {
        let result = apply(
            CookieSetting::BlockThirdPartyCookies,
            &with(REFERER, "https://brave.com"),
            "https://cdnp3.stackassets.com/store/image.jpg",
            "https://brave.com",
        );
        assert_eq!(result[REFERER], "https://cdnp3.stackassets.com");

        let result = apply(
            CookieSetting::BlockThirdPartyCookies,
            &with(REFERER, "https://github.io"),
            "https://diracdeltas.github.io/foo?abc#test",
            "https://brave.com",
        );
        assert_eq!(result[REFERER], "https://diracdeltas.github.io");
    }

    #[test]
    fn test_first_party_referer_is_kept() {
        let result = apply(
            CookieSetting::BlockThirdPartyCookies,
            &with(REFERER, "https://test.github.io/foo"),
            "https://test.github.io/test",
            "https://brave.com",
        );
        assert_eq!(result[REFERER], "https://test.github.io/foo");

        let result = apply(
            CookieSetting::BlockThirdPartyCookies,
            &with(REFERER, "https://2.drive.google.com/mydocument#abc"),
            "https://docs.google.com",
            "https://brave.com",
        );
        assert_eq!(result[REFERER], "https://2.drive.google.com/mydocument#abc");
    }

    #[test]
    fn test_referer_exception() {
        let result = apply(
            CookieSetting::BlockThirdPartyCookies,
            &with(REFERER, "https://brave.com"),
            "https://use.typekit.net/font.css",
            "https://slashdot.org/",
        );
        assert_eq!(result[REFERER], "https://brave.com");
    }

    #[test]
    fn test_allow_all_changes_nothing() {
        let (ctx, settings) = context();
        settings.set_cookie_setting(CookieSetting::AllowAllCookies);
        let stage = CookieStage::new(ctx);
        let mut details = RequestDetails::new(1, "https://tracker.com/p", ResourceType::Image)
            .with_first_party("https://brave.com/");
        details.request_headers = with(COOKIE, COOKIE_VALUE);
        assert!(
            stage
                .before_send_headers(&details, &details.request_headers)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("https://*.example.com", "https://a.b.example.com"));
        assert!(!wildcard_match("https://*.example.com", "https://example.com"));
        assert!(wildcard_match("https://a.com", "https://a.com"));
    }
}
