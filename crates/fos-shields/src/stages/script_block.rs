//! Script Blocking Stage
//!
//! Blocks scripts by appending `script-src 'none'` to the
//! Content-Security-Policy of received documents. Users can allow
//! scripts on an origin once, for the next top-level load only.

use super::StageContext;
use crate::config::{NOSCRIPT, ScriptBlockConfig};
use crate::request::{Phase, RequestDetails, ResourceType};
use crate::stage::{FilterStage, StageError, StageResult};
use crate::verdict::FilterVerdict;
use hyper::header::{CONTENT_SECURITY_POLICY, HeaderMap, HeaderValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace};

const BLOCK_DIRECTIVE: &str = "script-src 'none'";

const UNBLOCKABLE_SCHEMES: &[&str] = &["about", "chrome", "chrome-extension"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allowance {
    AllowNextLoad,
    /// The allowed load happened; its sub-resources still pass
    DisallowNextLoad,
}

/// One-shot script permissions per origin
#[derive(Default)]
pub struct TemporaryScriptAllowance {
    entries: Mutex<HashMap<String, Allowance>>,
}

impl TemporaryScriptAllowance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the next top-level load of `origin` run scripts
    pub fn allow_once(&self, origin: &str) {
        self.entries
            .lock()
            .insert(origin.to_string(), Allowance::AllowNextLoad);
    }

    /// Whether this load of `origin` skips script blocking, advancing
    /// the origin's state
    pub fn consume(&self, origin: &str, top_level: bool) -> bool {
        let mut entries = self.entries.lock();
        match (entries.get(origin).copied(), top_level) {
            (Some(Allowance::AllowNextLoad), true) => {
                entries.insert(origin.to_string(), Allowance::DisallowNextLoad);
                true
            }
            (Some(Allowance::DisallowNextLoad), true) => {
                entries.remove(origin);
                false
            }
            (Some(Allowance::DisallowNextLoad), false) => true,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct ScriptBlockStage {
    ctx: StageContext,
    config: ScriptBlockConfig,
    allowance: TemporaryScriptAllowance,
}

impl ScriptBlockStage {
    pub fn new(ctx: StageContext, config: ScriptBlockConfig) -> Self {
        Self {
            ctx,
            config,
            allowance: TemporaryScriptAllowance::new(),
        }
    }

    pub fn allowance(&self) -> &TemporaryScriptAllowance {
        &self.allowance
    }

    fn is_exempt(&self, details: &RequestDetails, url: &url::Url) -> bool {
        if UNBLOCKABLE_SCHEMES.contains(&url.scheme()) {
            return true;
        }
        if matches!(
            details.resource_type,
            ResourceType::Stylesheet | ResourceType::Script | ResourceType::Image
        ) {
            return true;
        }
        if self.config.skip_localhost
            && matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"))
        {
            return true;
        }
        self.config
            .start_page_prefixes
            .iter()
            .any(|prefix| details.url.starts_with(prefix.as_str()))
    }

    fn should_block(&self, details: &RequestDetails, origin: &str) -> bool {
        match self.ctx.settings.noscript_setting(origin) {
            Some(block) => block,
            None => self
                .ctx
                .is_enabled(NOSCRIPT, details.main_frame_url(), details.is_private()),
        }
    }
}

impl FilterStage for ScriptBlockStage {
    fn name(&self) -> &str {
        NOSCRIPT
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::HeadersReceived]
    }

    fn headers_received(&self, details: &RequestDetails, headers: &HeaderMap) -> StageResult {
        let Some(url) = self.ctx.parse(&details.url) else {
            return Ok(None);
        };
        if self.is_exempt(details, &url) {
            trace!("Script blocking skipped for {}", details.url);
            return Ok(None);
        }

        let origin = url.origin().ascii_serialization();
        if self.allowance.consume(&origin, details.is_main_frame()) {
            debug!("Scripts allowed once on {}", origin);
            return Ok(None);
        }
        if !self.should_block(details, &origin) {
            return Ok(None);
        }

        let headers = append_csp_directive(headers, BLOCK_DIRECTIVE)?;
        Ok(Some(FilterVerdict::pass(NOSCRIPT).with_response_headers(headers)))
    }
}

/// Copy of `headers` with `directive` added to the first
/// Content-Security-Policy value, or a new header holding only it
pub fn append_csp_directive(headers: &HeaderMap, directive: &str) -> Result<HeaderMap, StageError> {
    let mut headers = headers.clone();
    let mut values: Vec<HeaderValue> = headers.get_all(CONTENT_SECURITY_POLICY).iter().cloned().collect();

    let combined = match values.first() {
        Some(existing) => {
            let existing = existing
                .to_str()
                .map_err(|_| StageError::InvalidHeader(CONTENT_SECURITY_POLICY.to_string()))?
                .trim()
                .trim_end_matches(';');
            if existing.is_empty() {
                directive.to_string()
            } else {
                format!("{}; {}", existing, directive)
            }
        }
        None => directive.to_string(),
    };
    let combined = HeaderValue::from_str(&combined)
        .map_err(|_| StageError::InvalidHeader(CONTENT_SECURITY_POLICY.to_string()))?;

    if values.is_empty() {
        values.push(combined);
    } else {
        values[0] = combined;
    }
    headers.remove(CONTENT_SECURITY_POLICY);
    for value in values {
        headers.append(CONTENT_SECURITY_POLICY, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;
    use crate::stages::test_support::context;
    use std::sync::Arc;

    fn stage() -> (ScriptBlockStage, Arc<MemorySettings>) {
        let (ctx, settings) = context();
        settings.set_enabled(NOSCRIPT, true);
        let config = ScriptBlockConfig {
            skip_localhost: false,
            ..Default::default()
        };
        (ScriptBlockStage::new(ctx, config), settings)
    }

    fn run(stage: &ScriptBlockStage, url: &str, resource_type: ResourceType, headers: &HeaderMap) -> Option<HeaderMap> {
        let details = RequestDetails::new(1, url, resource_type).with_first_party("https://news.com/");
        stage
            .headers_received(&details, headers)
            .unwrap()
            .and_then(|v| v.response_headers)
    }

    #[test]
    fn test_creates_csp_header() {
        let (stage, _) = stage();
        let headers = run(&stage, "https://news.com/", ResourceType::MainFrame, &HeaderMap::new()).unwrap();
        assert_eq!(headers[CONTENT_SECURITY_POLICY], "script-src 'none'");
    }

    #[test]
    fn test_appends_to_existing_header() {
        let (stage, _) = stage();
        let mut headers = HeaderMap::new();
        headers.insert("content-security-policy", HeaderValue::from_static("default-src 'self'"));
        let headers = run(&stage, "https://news.com/", ResourceType::MainFrame, &headers).unwrap();

        let values: Vec<_> = headers.get_all(CONTENT_SECURITY_POLICY).iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "default-src 'self'; script-src 'none'");
    }

    #[test]
    fn test_exempt_requests() {
        let (stage, _) = stage();
        let none = HeaderMap::new();
        assert!(run(&stage, "about:blank", ResourceType::MainFrame, &none).is_none());
        assert!(run(&stage, "chrome-extension://abc/page.html", ResourceType::SubFrame, &none).is_none());
        assert!(run(&stage, "https://news.com/app.js", ResourceType::Script, &none).is_none());
        assert!(run(&stage, "https://news.com/logo.png", ResourceType::Image, &none).is_none());
        assert!(run(&stage, "fos://newtab", ResourceType::MainFrame, &none).is_none());
        assert!(run(&stage, "https://news.com/frame", ResourceType::SubFrame, &none).is_some());
    }

    #[test]
    fn test_localhost_skipped_by_default() {
        let (ctx, settings) = context();
        settings.set_enabled(NOSCRIPT, true);
        let stage = ScriptBlockStage::new(ctx, ScriptBlockConfig::default());
        assert!(run(&stage, "http://localhost:3000/", ResourceType::MainFrame, &HeaderMap::new()).is_none());
    }

    #[test]
    fn test_site_settings() {
        let (stage, settings) = stage();
        settings.set_noscript("https://news.com", false, false);
        assert!(run(&stage, "https://news.com/", ResourceType::MainFrame, &HeaderMap::new()).is_none());

        settings.set_enabled(NOSCRIPT, false);
        settings.set_noscript("https://strict.com", true, true);
        assert!(run(&stage, "https://strict.com/", ResourceType::MainFrame, &HeaderMap::new()).is_some());
        assert!(run(&stage, "https://other.com/", ResourceType::MainFrame, &HeaderMap::new()).is_none());
    }

    #[test]
    fn test_allow_once_sequence() {
        let (stage, _) = stage();
        let none = HeaderMap::new();
        stage.allowance().allow_once("https://news.com");

        // The allowed navigation and its frames run scripts
        assert!(run(&stage, "https://news.com/", ResourceType::MainFrame, &none).is_none());
        assert!(run(&stage, "https://news.com/frame", ResourceType::SubFrame, &none).is_none());
        // The next navigation is blocked again
        assert!(run(&stage, "https://news.com/", ResourceType::MainFrame, &none).is_some());
        assert!(stage.allowance().is_empty());
        assert!(run(&stage, "https://news.com/frame", ResourceType::SubFrame, &none).is_some());
    }

    #[test]
    fn test_allowance_states() {
        let allowance = TemporaryScriptAllowance::new();
        assert!(!allowance.consume("https://a.com", true));
        allowance.allow_once("https://a.com");
        assert!(!allowance.consume("https://a.com", false));
        assert!(allowance.consume("https://a.com", true));
        assert!(allowance.consume("https://a.com", false));
        assert!(!allowance.consume("https://a.com", true));
        assert!(allowance.is_empty());
    }
}
