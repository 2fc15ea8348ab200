//! Filter Stage Interface
//!
//! Every filter is one implementation of [`FilterStage`]. A stage only
//! overrides the lifecycle hooks it cares about; the defaults pass the
//! request through untouched.

use crate::request::{Phase, RedirectDetails, RequestDetails};
use crate::verdict::FilterVerdict;
use hyper::header::HeaderMap;
use thiserror::Error;

/// A stage failing to evaluate one request
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header value for {0}")]
    InvalidHeader(String),

    #[error("{0}")]
    Other(String),
}

/// Result type of stage hooks. `Ok(None)` means "no opinion".
pub type StageResult = Result<Option<FilterVerdict>, StageError>;

/// One independently registered filter
pub trait FilterStage: Send + Sync {
    /// Resource name used in verdicts and diagnostics
    fn name(&self) -> &str;

    /// Phases this stage wants to be registered for
    fn phases(&self) -> &'static [Phase];

    /// Whether the stage has loaded its data and produces real verdicts
    fn is_initialized(&self) -> bool {
        true
    }

    fn before_request(&self, _details: &RequestDetails) -> StageResult {
        Ok(None)
    }

    /// `headers` are the outgoing request headers as left by earlier stages
    fn before_send_headers(&self, _details: &RequestDetails, _headers: &HeaderMap) -> StageResult {
        Ok(None)
    }

    /// `headers` are the response headers as left by earlier stages
    fn headers_received(&self, _details: &RequestDetails, _headers: &HeaderMap) -> StageResult {
        Ok(None)
    }

    /// Notification only
    fn before_redirect(&self, _details: &RedirectDetails) {}
}
