//! Rule Sets
//!
//! Deserialized, queryable forms of the downloaded data files. Each is
//! built once from raw bytes and never mutated afterwards.

pub mod filter_list;
pub mod host_set;
pub mod https_rules;
pub mod tracker_index;

pub use filter_list::{FilterList, FilterListError, FilterMatch, FilterResourceType, MatchRequest};
pub use host_set::HostSet;
pub use https_rules::{HttpsRules, HttpsRulesError, Rewrite};
pub use tracker_index::{TrackerIndex, TrackerIndexError};
