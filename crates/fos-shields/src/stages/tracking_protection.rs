//! Tracking Protection Stage
//!
//! Cancels third-party requests to listed tracker hosts, except where a
//! tracker is allowed on the page's own base domain.

use super::{RuleSlot, StageContext};
use crate::config::TRACKING_PROTECTION;
use crate::request::{Phase, RequestDetails};
use crate::rules::tracker_index::TrackerIndex;
use crate::stage::{FilterStage, StageResult};
use crate::verdict::FilterVerdict;
use tracing::debug;

pub struct TrackingProtectionStage {
    ctx: StageContext,
    rules: RuleSlot<TrackerIndex>,
}

impl TrackingProtectionStage {
    pub fn new(ctx: StageContext) -> Self {
        Self {
            ctx,
            rules: RuleSlot::new(),
        }
    }

    pub fn rules(&self) -> &RuleSlot<TrackerIndex> {
        &self.rules
    }
}

impl FilterStage for TrackingProtectionStage {
    fn name(&self) -> &str {
        TRACKING_PROTECTION
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::BeforeRequest]
    }

    fn is_initialized(&self) -> bool {
        self.rules.is_loaded()
    }

    fn before_request(&self, details: &RequestDetails) -> StageResult {
        let Some(index) = self.rules.current() else {
            return Ok(None);
        };
        if details.is_main_frame() {
            return Ok(None);
        }
        let Some(main_frame_url) = details.main_frame_url() else {
            return Ok(None);
        };
        let (Some(first_party), Some(url)) = (self.ctx.parse(main_frame_url), self.ctx.parse(&details.url)) else {
            return Ok(None);
        };
        if !matches!(first_party.scheme(), "http" | "https") {
            return Ok(None);
        }

        let first_party_host = first_party.host_str().unwrap_or_default();
        let host = url.host_str().unwrap_or_default();
        if !self.ctx.domains.is_third_party_host(first_party_host, host) {
            return Ok(None);
        }
        if !self
            .ctx
            .is_enabled(TRACKING_PROTECTION, Some(main_frame_url), details.is_private())
        {
            return Ok(None);
        }

        let first_party_base = self.ctx.domains.base_domain(first_party_host);
        match index.blocking_tracker(host, &first_party_base) {
            Some(tracker) => {
                debug!("Tracker {} blocked on {}", tracker, first_party_host);
                Ok(Some(FilterVerdict::cancel(TRACKING_PROTECTION)))
            }
            None => Ok(None),
        }
    }
}
