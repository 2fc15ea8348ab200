//! Filter Verdicts
//!
//! What one stage decides for one request, and the reducer that folds
//! the verdicts of every stage registered for a phase into the single
//! answer the network stack receives.
//!
//! Aggregation rules:
//! - `cancel` is a veto: any stage cancelling cancels the request.
//! - The first redirect wins; later redirects are ignored.
//! - Header maps are cumulative: each stage sees the headers produced by
//!   the stages before it, so the last map returned is the final one.

use hyper::header::HeaderMap;
use tracing::debug;

/// Decision of one stage for one request
#[derive(Debug, Clone, Default)]
pub struct FilterVerdict {
    /// Name of the stage that produced this verdict
    pub resource_name: String,
    pub cancel: Option<bool>,
    pub redirect_url: Option<String>,
    /// Replacement request headers (`beforeSendHeaders`)
    pub request_headers: Option<HeaderMap>,
    /// Replacement response headers (`headersReceived`)
    pub response_headers: Option<HeaderMap>,
}

impl FilterVerdict {
    /// A verdict that changes nothing
    pub fn pass(resource_name: &str) -> Self {
        Self {
            resource_name: resource_name.to_string(),
            ..Default::default()
        }
    }

    pub fn cancel(resource_name: &str) -> Self {
        Self {
            cancel: Some(true),
            ..Self::pass(resource_name)
        }
    }

    pub fn redirect(resource_name: &str, url: impl Into<String>) -> Self {
        Self {
            redirect_url: Some(url.into()),
            ..Self::pass(resource_name)
        }
    }

    pub fn with_request_headers(mut self, headers: HeaderMap) -> Self {
        self.request_headers = Some(headers);
        self
    }

    pub fn with_response_headers(mut self, headers: HeaderMap) -> Self {
        self.response_headers = Some(headers);
        self
    }

    pub fn is_cancel(&self) -> bool {
        self.cancel == Some(true)
    }

    pub fn is_empty(&self) -> bool {
        self.cancel.is_none()
            && self.redirect_url.is_none()
            && self.request_headers.is_none()
            && self.response_headers.is_none()
    }
}

/// Combined decision returned to the network stack
#[derive(Debug, Clone, Default)]
pub struct AggregatedVerdict {
    pub cancel: bool,
    pub redirect_url: Option<String>,
    pub request_headers: Option<HeaderMap>,
    pub response_headers: Option<HeaderMap>,
    /// Stage whose veto cancelled the request
    pub cancelled_by: Option<String>,
    /// Stage whose redirect was kept
    pub redirected_by: Option<String>,
}

impl AggregatedVerdict {
    /// Fold one more verdict in, in registration order
    pub fn merge(&mut self, verdict: FilterVerdict) {
        if verdict.is_cancel() && !self.cancel {
            self.cancel = true;
            self.cancelled_by = Some(verdict.resource_name.clone());
        }

        if let Some(url) = verdict.redirect_url.filter(|u| !u.is_empty()) {
            match &self.redirected_by {
                None => {
                    self.redirect_url = Some(url);
                    self.redirected_by = Some(verdict.resource_name.clone());
                }
                Some(first) => debug!(
                    "Ignoring redirect from {} to {}, {} already redirected",
                    verdict.resource_name, url, first
                ),
            }
        }

        if let Some(headers) = verdict.request_headers {
            self.request_headers = Some(headers);
        }
        if let Some(headers) = verdict.response_headers {
            self.response_headers = Some(headers);
        }
    }

    /// Whether the request proceeds untouched
    pub fn is_pass_through(&self) -> bool {
        !self.cancel
            && self.redirect_url.is_none()
            && self.request_headers.is_none()
            && self.response_headers.is_none()
    }
}

/// Reduce an ordered list of verdicts into one
pub fn aggregate<I>(verdicts: I) -> AggregatedVerdict
where
    I: IntoIterator<Item = FilterVerdict>,
{
    verdicts.into_iter().fold(AggregatedVerdict::default(), |mut acc, v| {
        acc.merge(v);
        acc
    })
}
