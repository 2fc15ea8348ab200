//! Tracker Index
//!
//! Tracking-protection rule set: a list of tracker hosts plus, per
//! tracker, the first parties it is allowed to load on (a site's own
//! CDN or login provider).
//!
//! ```json
//! { "trackers": ["tracker.example"],
//!   "first_party_hosts": { "tracker.example": ["partner.example"] } }
//! ```

use super::host_set::HostSet;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TrackerIndexError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tracker list is empty")]
    Empty,
}

#[derive(Deserialize)]
struct TrackerData {
    trackers: Vec<String>,
    #[serde(default)]
    first_party_hosts: HashMap<String, Vec<String>>,
}

/// Queryable tracker list
pub struct TrackerIndex {
    trackers: HostSet,
    first_party_hosts: HashMap<String, Vec<String>>,
}

impl TrackerIndex {
    pub fn from_json(data: &[u8]) -> Result<Self, TrackerIndexError> {
        let data: TrackerData = serde_json::from_slice(data)?;
        if data.trackers.is_empty() {
            return Err(TrackerIndexError::Empty);
        }

        let trackers: HostSet = data.trackers.iter().map(String::as_str).collect();
        let first_party_hosts = data
            .first_party_hosts
            .into_iter()
            .map(|(tracker, hosts)| {
                (
                    tracker.to_ascii_lowercase(),
                    hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect(),
                )
            })
            .collect();

        info!("Loaded tracker index with {} trackers", trackers.len());
        Ok(Self {
            trackers,
            first_party_hosts,
        })
    }

    /// Listed tracker `host` belongs to, if any
    pub fn matching_tracker<'a>(&self, host: &'a str) -> Option<&'a str> {
        self.trackers.matching_suffix(host)
    }

    /// Whether `tracker` may load on a page whose base domain is
    /// `first_party`
    pub fn is_allowed_on(&self, tracker: &str, first_party: &str) -> bool {
        self.first_party_hosts
            .get(&tracker.to_ascii_lowercase())
            .is_some_and(|hosts| hosts.iter().any(|h| h == first_party))
    }

    /// The tracker that should be blocked for this host and first party
    pub fn blocking_tracker<'a>(&self, host: &'a str, first_party: &str) -> Option<&'a str> {
        self.matching_tracker(host)
            .filter(|tracker| !self.is_allowed_on(tracker, first_party))
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}
