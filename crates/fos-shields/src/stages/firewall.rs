//! Internal Network Firewall
//!
//! Keeps public pages from reaching services on the local network, and
//! stops DNS rebinding: a public-looking hostname whose response comes
//! from a private address.

use super::StageContext;
use crate::config::FIREWALL;
use crate::domain::{is_internal_host, is_internal_url, is_private_ip};
use crate::request::{Phase, RequestDetails};
use crate::stage::{FilterStage, StageError, StageResult};
use crate::verdict::FilterVerdict;
use hyper::header::HeaderMap;
use tracing::info;

pub struct FirewallStage {
    ctx: StageContext,
}

impl FirewallStage {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }
}

impl FilterStage for FirewallStage {
    fn name(&self) -> &str {
        FIREWALL
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::HeadersReceived]
    }

    fn headers_received(&self, details: &RequestDetails, _headers: &HeaderMap) -> StageResult {
        let url = self
            .ctx
            .parse(&details.url)
            .ok_or_else(|| StageError::InvalidUrl(details.url.clone()))?;
        let Some(main_frame) = details.main_frame_url().and_then(|u| self.ctx.parse(u)) else {
            return Ok(None);
        };

        let private_ip = details.ip.is_some_and(is_private_ip);
        let internal_url = is_internal_url(&url);
        let internal_context = is_internal_url(&main_frame);
        let internal_host = url.host_str().is_some_and(is_internal_host);

        if (private_ip || internal_url) && !internal_context {
            info!("Blocked {} from {}: internal resource on external page", url, main_frame);
            return Ok(Some(FilterVerdict::cancel(FIREWALL)));
        }
        if private_ip && !internal_host {
            info!("Blocked {}: public hostname answered from {:?}", url, details.ip);
            return Ok(Some(FilterVerdict::cancel(FIREWALL)));
        }
        Ok(None)
    }
}
