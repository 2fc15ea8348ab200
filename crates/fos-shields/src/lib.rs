//! fOS Shields
//!
//! Request interception and content filtering for the browser's network
//! stack.
//!
//! Architecture:
//! 1. The network stack reports each request lifecycle event
//! 2. The dispatcher runs the stages registered for that partition/phase
//! 3. Stages answer from rule sets the data file manager keeps current
//! 4. Verdicts fold into one answer: cancel, redirect, or new headers

pub mod config;
pub mod data_file;
pub mod debounce;
pub mod dispatcher;
pub mod domain;
pub mod engine;
pub mod fetch;
pub mod request;
pub mod rules;
pub mod settings;
pub mod stage;
pub mod stages;
pub mod state_store;
pub mod url_cache;
pub mod verdict;

pub use config::{ConfigError, ResourceConfig, ShieldsConfig};
pub use data_file::{DataFileError, DataFileManager, ResourceStatus};
pub use dispatcher::{DispatchCounts, FilteringDispatcher, NetworkHooks};
pub use domain::BaseDomainResolver;
pub use engine::{LoadHandle, ShieldsEngine, ShieldsStatus, StageStatus};
pub use fetch::{FetchError, FetchOutcome, Fetcher, HttpFetcher};
pub use request::{PartitionId, Phase, RedirectDetails, RequestDetails, ResourceType};
pub use settings::{CookieSetting, MemorySettings, ReferralHeaders, ShieldsSettings};
pub use stage::{FilterStage, StageError, StageResult};
pub use state_store::{JsonStateStore, MemoryStateStore, ResourceState, ResourceStateStore};
pub use url_cache::UrlCache;
pub use verdict::{AggregatedVerdict, FilterVerdict, aggregate};
