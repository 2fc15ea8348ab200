//! Filtering Dispatcher
//!
//! The coordination point between the network stack and the filter
//! stages. Stages are registered per session partition and lifecycle
//! phase; every network event runs the stages registered for it in
//! registration order and folds their verdicts with
//! [`AggregatedVerdict::merge`].
//!
//! Flow:
//! 1. Network stack reports an event for a partition
//! 2. No resolvable main frame (tab already closed) → pass through
//! 3. Each stage runs in isolation; errors and panics become empty verdicts
//! 4. Aggregated verdict goes back to the network stack

use crate::request::{PartitionId, Phase, RedirectDetails, RequestDetails};
use crate::stage::{FilterStage, StageResult};
use crate::verdict::{AggregatedVerdict, FilterVerdict};
use hyper::header::HeaderMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

/// Installs the dispatcher's hook into the network stack of a session.
///
/// Called at most once per (partition, phase), however many stages are
/// registered behind that hook.
pub trait NetworkHooks: Send + Sync {
    fn install(&self, partition: &PartitionId, phase: Phase);
}

#[derive(Default)]
struct PartitionStages {
    by_phase: HashMap<Phase, Vec<Arc<dyn FilterStage>>>,
    redirect_observers: Vec<Arc<dyn FilterStage>>,
}

/// Per-phase dispatch counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub dispatched: AtomicU64,
    pub cancelled: AtomicU64,
    pub redirected: AtomicU64,
    pub stage_failures: AtomicU64,
    pub orphaned: AtomicU64,
}

/// Snapshot of [`DispatchStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DispatchCounts {
    pub dispatched: u64,
    pub cancelled: u64,
    pub redirected: u64,
    pub stage_failures: u64,
    pub orphaned: u64,
}

/// Registry of filter stages and dispatcher of network events
pub struct FilteringDispatcher {
    partitions: RwLock<HashMap<PartitionId, PartitionStages>>,
    /// Registrations applied to every partition, including future ones
    global: RwLock<Vec<(Phase, Arc<dyn FilterStage>)>>,
    installed: RwLock<HashSet<(PartitionId, Phase)>>,
    hooks: Option<Arc<dyn NetworkHooks>>,
    stats: HashMap<Phase, DispatchStats>,
}

impl FilteringDispatcher {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            global: RwLock::new(Vec::new()),
            installed: RwLock::new(HashSet::new()),
            hooks: None,
            stats: Phase::all()
                .iter()
                .map(|phase| (*phase, DispatchStats::default()))
                .collect(),
        }
    }

    /// Dispatcher that installs its hooks into a network stack
    pub fn with_hooks(hooks: Arc<dyn NetworkHooks>) -> Self {
        Self {
            hooks: Some(hooks),
            ..Self::new()
        }
    }

    /// Register a stage for one phase of one partition.
    ///
    /// Returns `true` when this registration installed the network-stack
    /// hook; later registrations only append to the stage list.
    pub fn register_stage(
        &self,
        partition: &PartitionId,
        phase: Phase,
        stage: Arc<dyn FilterStage>,
    ) -> bool {
        {
            let mut partitions = self.partitions.write();
            let entry = partitions.entry(partition.clone()).or_default();
            if phase == Phase::BeforeRequest
                && !entry.redirect_observers.iter().any(|s| same_stage(s, &stage))
            {
                entry.redirect_observers.push(Arc::clone(&stage));
            }
            debug!("Registered {} for {} on {}", stage.name(), phase, partition);
            entry.by_phase.entry(phase).or_default().push(stage);
        }

        let newly_installed = self.installed.write().insert((partition.clone(), phase));
        if newly_installed {
            if let Some(hooks) = &self.hooks {
                hooks.install(partition, phase);
            }
            info!("Installed {} hook for partition {}", phase, partition);
        }
        newly_installed
    }

    /// Register a stage for all of its phases on every known partition
    /// and on every partition added later.
    pub fn register_for_all_partitions(&self, stage: Arc<dyn FilterStage>) {
        let partitions: Vec<PartitionId> = self.partitions.read().keys().cloned().collect();
        let mut global = self.global.write();
        for phase in stage.phases() {
            global.push((*phase, Arc::clone(&stage)));
            for partition in &partitions {
                self.register_stage(partition, *phase, Arc::clone(&stage));
            }
        }
    }

    /// Make a partition known, registering every global stage for it.
    /// Adding a partition twice is a no-op.
    pub fn add_partition(&self, partition: &PartitionId) {
        if self.partitions.read().contains_key(partition) {
            return;
        }
        self.partitions.write().entry(partition.clone()).or_default();

        let global = self.global.read().clone();
        for (phase, stage) in global {
            self.register_stage(partition, phase, stage);
        }
        info!("Partition {} ready", partition);
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.partitions.read().keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Names of the stages registered for a phase, in order
    pub fn stage_names(&self, partition: &PartitionId, phase: Phase) -> Vec<String> {
        self.stages_for(partition, phase)
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    fn stages_for(&self, partition: &PartitionId, phase: Phase) -> Vec<Arc<dyn FilterStage>> {
        self.partitions
            .read()
            .get(partition)
            .and_then(|p| p.by_phase.get(&phase))
            .cloned()
            .unwrap_or_default()
    }

    pub fn on_before_request(&self, details: &RequestDetails) -> AggregatedVerdict {
        self.dispatch(Phase::BeforeRequest, details, &HeaderMap::new())
    }

    pub fn on_before_send_headers(&self, details: &RequestDetails) -> AggregatedVerdict {
        self.dispatch(Phase::BeforeSendHeaders, details, &details.request_headers)
    }

    pub fn on_headers_received(
        &self,
        details: &RequestDetails,
        response_headers: &HeaderMap,
    ) -> AggregatedVerdict {
        self.dispatch(Phase::HeadersReceived, details, response_headers)
    }

    /// Forward a redirect notification to the observing stages
    pub fn on_before_redirect(&self, details: &RedirectDetails) {
        let observers = self
            .partitions
            .read()
            .get(&details.partition)
            .map(|p| p.redirect_observers.clone())
            .unwrap_or_default();

        for stage in observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.before_redirect(details)));
            if outcome.is_err() {
                error!("Stage {} panicked handling redirect of {}", stage.name(), details.url);
            }
        }
    }

    /// Run every stage registered for `phase` and fold their verdicts.
    ///
    /// `headers` is the header map the first stage sees; each later
    /// stage sees the map as left by the stages before it.
    pub fn dispatch(
        &self,
        phase: Phase,
        details: &RequestDetails,
        headers: &HeaderMap,
    ) -> AggregatedVerdict {
        let stats = &self.stats[&phase];
        stats.dispatched.fetch_add(1, Ordering::Relaxed);

        if details.main_frame_url().is_none() {
            stats.orphaned.fetch_add(1, Ordering::Relaxed);
            debug!("No main frame for request {} ({}), passing through", details.id, details.url);
            return AggregatedVerdict::default();
        }

        let mut aggregated = AggregatedVerdict::default();
        let mut current: Option<HeaderMap> = None;

        for stage in self.stages_for(&details.partition, phase) {
            let seen = current.as_ref().unwrap_or(headers);
            let verdict = match invoke(stage.as_ref(), phase, details, seen) {
                Ok(Some(verdict)) => verdict,
                Ok(None) => continue,
                Err(reason) => {
                    stats.stage_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Stage {} failed on {} for {}: {}",
                        stage.name(),
                        phase,
                        details.url,
                        reason
                    );
                    continue;
                }
            };

            trace!("{} verdict for {}: {:?}", stage.name(), details.url, verdict);
            if let Some(h) = verdict_headers(phase, &verdict) {
                current = Some(h.clone());
            }
            aggregated.merge(verdict);
        }

        if aggregated.cancel {
            stats.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(
                "{} cancelled {} ({})",
                aggregated.cancelled_by.as_deref().unwrap_or("?"),
                details.url,
                details.resource_type
            );
        }
        if aggregated.redirect_url.is_some() {
            stats.redirected.fetch_add(1, Ordering::Relaxed);
        }
        aggregated
    }

    pub fn stats(&self, phase: Phase) -> DispatchCounts {
        let s = &self.stats[&phase];
        DispatchCounts {
            dispatched: s.dispatched.load(Ordering::Relaxed),
            cancelled: s.cancelled.load(Ordering::Relaxed),
            redirected: s.redirected.load(Ordering::Relaxed),
            stage_failures: s.stage_failures.load(Ordering::Relaxed),
            orphaned: s.orphaned.load(Ordering::Relaxed),
        }
    }
}

impl Default for FilteringDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn same_stage(a: &Arc<dyn FilterStage>, b: &Arc<dyn FilterStage>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn verdict_headers(phase: Phase, verdict: &FilterVerdict) -> Option<&HeaderMap> {
    match phase {
        Phase::BeforeRequest => None,
        Phase::BeforeSendHeaders => verdict.request_headers.as_ref(),
        Phase::HeadersReceived => verdict.response_headers.as_ref(),
    }
}

/// Call one stage hook, turning a panic into an error string
fn invoke(
    stage: &dyn FilterStage,
    phase: Phase,
    details: &RequestDetails,
    headers: &HeaderMap,
) -> Result<Option<FilterVerdict>, String> {
    let outcome: std::thread::Result<StageResult> = catch_unwind(AssertUnwindSafe(|| match phase {
        Phase::BeforeRequest => stage.before_request(details),
        Phase::BeforeSendHeaders => stage.before_send_headers(details, headers),
        Phase::HeadersReceived => stage.headers_received(details, headers),
    }));

    match outcome {
        Ok(Ok(verdict)) => Ok(verdict),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string())),
    }
}
