//! Shields Engine
//!
//! Builds every stage from one [`ShieldsConfig`], registers them with the
//! dispatcher in a fixed order, and feeds the data-backed stages from the
//! [`DataFileManager`]. The network stack talks to the engine; the engine
//! talks to the dispatcher.
//!
//! Registration order:
//! 1. HTTPS upgrade
//! 2. Tracking protection
//! 3. Ad block (default list, custom rules, then regional lists)
//! 4. Site hacks
//! 5. Cookies
//! 6. Script blocking
//! 7. Firewall

use crate::config::{
    ADBLOCK, COOKIE_BLOCK, CUSTOM_ADBLOCK, ConfigError, HTTPS_EVERYWHERE, NOSCRIPT, REGIONAL_ADBLOCK,
    SITE_HACKS, ShieldsConfig, TRACKING_PROTECTION,
};
use crate::data_file::{DataFileError, DataFileManager, ResourceStatus};
use crate::dispatcher::{DispatchCounts, FilteringDispatcher, NetworkHooks};
use crate::fetch::Fetcher;
use crate::request::{PartitionId, Phase, RedirectDetails, RequestDetails};
use crate::rules::{FilterList, HttpsRules, TrackerIndex};
use crate::settings::ShieldsSettings;
use crate::stage::FilterStage;
use crate::stages::ad_block::{AdBlockPolicy, PendingEdit};
use crate::stages::{
    AdBlockStage, CookieStage, CustomRulesEditor, FirewallStage, HttpsUpgradeStage, ScriptBlockStage,
    SiteHacksStage, StageContext, TrackingProtectionStage,
};
use crate::state_store::ResourceStateStore;
use crate::verdict::AggregatedVerdict;
use hyper::header::HeaderMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle of one background data-file load
pub type LoadHandle = JoinHandle<Result<(), DataFileError>>;

/// Diagnostic state of one registered stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    /// Globally switched on in settings
    pub enabled: bool,
    /// Producing real verdicts
    pub initialized: bool,
}

/// Everything collaborators may query for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ShieldsStatus {
    pub stages: BTreeMap<String, StageStatus>,
    pub resources: BTreeMap<String, ResourceStatus>,
    pub dispatch: BTreeMap<String, DispatchCounts>,
}

struct Registered {
    stage: Arc<dyn FilterStage>,
    /// Settings switch gating the stage; `None` for always-on stages
    setting: Option<&'static str>,
}

/// The request filtering subsystem of one browser process
pub struct ShieldsEngine<F: Fetcher + 'static> {
    config: ShieldsConfig,
    ctx: StageContext,
    dispatcher: Arc<FilteringDispatcher>,
    data_files: Arc<DataFileManager<F>>,
    policy: Arc<AdBlockPolicy>,
    https: Arc<HttpsUpgradeStage>,
    tracking: Arc<TrackingProtectionStage>,
    ad_block: Arc<AdBlockStage>,
    regional: RwLock<BTreeMap<String, Arc<AdBlockStage>>>,
    custom_editor: CustomRulesEditor,
    script_block: Arc<ScriptBlockStage>,
    registered: RwLock<Vec<Registered>>,
}

impl<F: Fetcher + 'static> ShieldsEngine<F> {
    pub fn new(
        config: ShieldsConfig,
        settings: Arc<dyn ShieldsSettings>,
        fetcher: F,
        store: Arc<dyn ResourceStateStore>,
    ) -> Result<Self, ConfigError> {
        Self::build(config, settings, fetcher, store, FilteringDispatcher::new())
    }

    /// Engine whose dispatcher installs its hooks into a network stack
    pub fn with_hooks(
        config: ShieldsConfig,
        settings: Arc<dyn ShieldsSettings>,
        fetcher: F,
        store: Arc<dyn ResourceStateStore>,
        hooks: Arc<dyn NetworkHooks>,
    ) -> Result<Self, ConfigError> {
        Self::build(config, settings, fetcher, store, FilteringDispatcher::with_hooks(hooks))
    }

    fn build(
        config: ShieldsConfig,
        settings: Arc<dyn ShieldsSettings>,
        fetcher: F,
        store: Arc<dyn ResourceStateStore>,
        dispatcher: FilteringDispatcher,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let ctx = StageContext::new(settings);
        let resources = config
            .resources
            .iter()
            .filter(|(name, _)| name.as_str() != REGIONAL_ADBLOCK)
            .map(|(name, resource)| (name.clone(), resource.clone()))
            .collect();
        let data_files = Arc::new(DataFileManager::new(
            config.user_data_dir.clone(),
            resources,
            fetcher,
            store,
        ));

        let policy = Arc::new(AdBlockPolicy::new(&config.ad_block, Arc::clone(&ctx.domains)));
        let https = Arc::new(HttpsUpgradeStage::new(
            ctx.clone(),
            config.https_upgrade.redirect_loop_threshold,
        ));
        let tracking = Arc::new(TrackingProtectionStage::new(ctx.clone()));
        let ad_block = Arc::new(AdBlockStage::new(ADBLOCK, ctx.clone(), Arc::clone(&policy)));
        let custom = Arc::new(AdBlockStage::new(CUSTOM_ADBLOCK, ctx.clone(), Arc::clone(&policy)));
        let custom_editor = CustomRulesEditor::new(
            Arc::clone(&custom),
            Duration::from_millis(config.ad_block.custom_rules_debounce_ms),
        );
        let script_block = Arc::new(ScriptBlockStage::new(ctx.clone(), config.script_block.clone()));

        let engine = Self {
            ctx: ctx.clone(),
            dispatcher: Arc::new(dispatcher),
            data_files,
            policy,
            https: Arc::clone(&https),
            tracking: Arc::clone(&tracking),
            ad_block: Arc::clone(&ad_block),
            regional: RwLock::new(BTreeMap::new()),
            custom_editor,
            script_block: Arc::clone(&script_block),
            registered: RwLock::new(Vec::new()),
            config,
        };

        engine.dispatcher.add_partition(&PartitionId::default());
        engine.register(https, Some(HTTPS_EVERYWHERE));
        engine.register(tracking, Some(TRACKING_PROTECTION));
        engine.register(ad_block, Some(ADBLOCK));
        engine.register(custom, Some(ADBLOCK));
        engine.register(Arc::new(SiteHacksStage::new(ctx.clone())), Some(SITE_HACKS));
        engine.register(Arc::new(CookieStage::new(ctx.clone())), Some(COOKIE_BLOCK));
        engine.register(script_block, Some(NOSCRIPT));
        engine.register(Arc::new(FirewallStage::new(ctx)), None);

        if let Err(e) = engine.custom_editor.apply_now(engine.config.ad_block.custom_rules.as_str()) {
            warn!("Configured custom rules ignored: {}", e);
        }
        for uuid in engine.config.ad_block.regional_lists.clone() {
            engine.enable_regional(&uuid);
        }

        info!(
            "Shields engine ready with {} stages",
            engine.registered.read().len()
        );
        Ok(engine)
    }

    fn register(&self, stage: Arc<dyn FilterStage>, setting: Option<&'static str>) {
        self.dispatcher.register_for_all_partitions(Arc::clone(&stage));
        self.registered.write().push(Registered { stage, setting });
    }

    /// Start loading every data file whose protection is switched on.
    /// Must be called inside a tokio runtime.
    pub fn start(&self) -> Vec<LoadHandle> {
        self.on_settings_changed()
    }

    /// Re-evaluate settings: load data files of protections that are now
    /// on but not yet initialized
    pub fn on_settings_changed(&self) -> Vec<LoadHandle> {
        let mut handles = Vec::new();
        if self.wants_load(ADBLOCK, ADBLOCK, self.ad_block.is_initialized()) {
            handles.push(self.load_filter_list(ADBLOCK, Arc::clone(&self.ad_block), false));
        }
        for (name, stage) in self.regional.read().iter() {
            if self.wants_load(name, ADBLOCK, stage.is_initialized()) {
                handles.push(self.load_filter_list(name, Arc::clone(stage), false));
            }
        }
        if self.wants_load(TRACKING_PROTECTION, TRACKING_PROTECTION, self.tracking.is_initialized()) {
            handles.push(self.load_tracker_index(false));
        }
        if self.wants_load(HTTPS_EVERYWHERE, HTTPS_EVERYWHERE, self.https.is_initialized()) {
            handles.push(self.load_https_rules(false));
        }
        handles
    }

    /// Recheck every enabled data file, downloading when due (or always
    /// with `force`) and swapping in the new rule sets
    pub fn refresh(&self, force: bool) -> Vec<LoadHandle> {
        let mut handles = Vec::new();
        if self.wants_load(ADBLOCK, ADBLOCK, false) {
            handles.push(self.load_filter_list(ADBLOCK, Arc::clone(&self.ad_block), force));
        }
        for (name, stage) in self.regional.read().iter() {
            if self.wants_load(name, ADBLOCK, false) {
                handles.push(self.load_filter_list(name, Arc::clone(stage), force));
            }
        }
        if self.wants_load(TRACKING_PROTECTION, TRACKING_PROTECTION, false) {
            handles.push(self.load_tracker_index(force));
        }
        if self.wants_load(HTTPS_EVERYWHERE, HTTPS_EVERYWHERE, false) {
            handles.push(self.load_https_rules(force));
        }
        handles
    }

    fn wants_load(&self, resource: &str, setting: &str, initialized: bool) -> bool {
        !initialized
            && self.ctx.settings.is_resource_enabled(setting, None, false)
            && self.data_files.resource(resource).is_some_and(|r| r.enabled)
    }

    fn spawn_load<T, E, D, R>(&self, name: &str, force: bool, deserialize: D, on_ready: R) -> LoadHandle
    where
        T: Send + 'static,
        E: Display + Send + 'static,
        D: Fn(&[u8]) -> Result<T, E> + Send + Sync + 'static,
        R: FnOnce(T) + Send + 'static,
    {
        let data_files = Arc::clone(&self.data_files);
        let name = name.to_string();
        tokio::spawn(async move { data_files.load(&name, force, deserialize, on_ready).await })
    }

    fn load_filter_list(&self, name: &str, stage: Arc<AdBlockStage>, force: bool) -> LoadHandle {
        let list_name = name.to_string();
        self.spawn_load(
            name,
            force,
            move |bytes: &[u8]| FilterList::parse_bytes(&list_name, bytes),
            move |list| stage.rules().install(list),
        )
    }

    fn load_tracker_index(&self, force: bool) -> LoadHandle {
        let stage = Arc::clone(&self.tracking);
        self.spawn_load(TRACKING_PROTECTION, force, TrackerIndex::from_json, move |index| {
            stage.rules().install(index)
        })
    }

    fn load_https_rules(&self, force: bool) -> LoadHandle {
        let stage = Arc::clone(&self.https);
        self.spawn_load(HTTPS_EVERYWHERE, force, HttpsRules::from_json, move |rules| {
            stage.rules().install(rules)
        })
    }

    /// Register (or re-enable) the ad-block instance of one regional list
    fn enable_regional(&self, uuid: &str) -> Option<(String, Arc<AdBlockStage>)> {
        let Some((name, resource)) = self.config.regional_resource(uuid) else {
            warn!("No {} template configured, ignoring list {}", REGIONAL_ADBLOCK, uuid);
            return None;
        };
        self.data_files.register_resource(&name, resource);

        if let Some(stage) = self.regional.read().get(&name) {
            return Some((name, Arc::clone(stage)));
        }
        let stage = Arc::new(AdBlockStage::new(&name, self.ctx.clone(), Arc::clone(&self.policy)));
        self.regional.write().insert(name.clone(), Arc::clone(&stage));
        self.register(Arc::clone(&stage) as Arc<dyn FilterStage>, Some(ADBLOCK));
        info!("Regional list {} registered", name);
        Some((name, stage))
    }

    /// Switch the set of enabled regional lists. Lists no longer wanted
    /// stop blocking; new ones start loading.
    pub fn set_regional_lists(&self, uuids: &[String]) -> Vec<LoadHandle> {
        let wanted: HashSet<String> = uuids.iter().map(|uuid| format!("{}-{}", ADBLOCK, uuid)).collect();
        for (name, stage) in self.regional.read().iter() {
            if !wanted.contains(name) {
                stage.rules().clear();
                self.data_files.set_enabled(name, false);
                info!("Regional list {} disabled", name);
            }
        }

        uuids
            .iter()
            .filter_map(|uuid| self.enable_regional(uuid))
            .filter(|(name, stage)| self.wants_load(name, ADBLOCK, stage.is_initialized()))
            .map(|(name, stage)| self.load_filter_list(&name, stage, false))
            .collect()
    }

    /// Queue an edit of the custom rules. Must be called inside a tokio
    /// runtime.
    pub fn submit_custom_rules(&self, text: impl Into<String>) -> PendingEdit {
        self.custom_editor.submit(text)
    }

    /// Let the next top-level load of `origin` run scripts
    pub fn allow_scripts_once(&self, origin: &str) {
        self.script_block.allowance().allow_once(origin);
    }

    pub fn add_partition(&self, partition: &PartitionId) {
        self.dispatcher.add_partition(partition);
    }

    pub fn dispatcher(&self) -> &FilteringDispatcher {
        &self.dispatcher
    }

    pub fn https_upgrade(&self) -> &HttpsUpgradeStage {
        &self.https
    }

    pub fn on_before_request(&self, details: &RequestDetails) -> AggregatedVerdict {
        self.dispatcher.on_before_request(details)
    }

    pub fn on_before_send_headers(&self, details: &RequestDetails) -> AggregatedVerdict {
        self.dispatcher.on_before_send_headers(details)
    }

    pub fn on_headers_received(&self, details: &RequestDetails, response_headers: &HeaderMap) -> AggregatedVerdict {
        self.dispatcher.on_headers_received(details, response_headers)
    }

    pub fn on_before_redirect(&self, details: &RedirectDetails) {
        self.dispatcher.on_before_redirect(details);
    }

    pub fn status(&self) -> ShieldsStatus {
        let stages = self
            .registered
            .read()
            .iter()
            .map(|r| {
                let enabled = r
                    .setting
                    .is_none_or(|setting| self.ctx.settings.is_resource_enabled(setting, None, false));
                (
                    r.stage.name().to_string(),
                    StageStatus {
                        enabled,
                        initialized: r.stage.is_initialized(),
                    },
                )
            })
            .collect();
        let dispatch = Phase::all()
            .iter()
            .map(|phase| (phase.to_string(), self.dispatcher.stats(*phase)))
            .collect();

        ShieldsStatus {
            stages,
            resources: self.data_files.all_status(),
            dispatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::fetch::{FetchError, FetchOutcome};
    use crate::request::ResourceType;
    use crate::settings::MemorySettings;
    use crate::state_store::MemoryStateStore;
    use hyper::body::Bytes;
    use std::collections::HashMap;
    use std::future::Future;
    use tempfile::TempDir;

    /// Serves fixed bodies keyed by URL; unknown URLs fail
    struct MapFetcher(HashMap<String, &'static str>);

    impl Fetcher for MapFetcher {
        fn fetch(
            &self,
            url: &str,
            _etag: Option<&str>,
        ) -> impl Future<Output = Result<FetchOutcome, FetchError>> + Send {
            let outcome = match self.0.get(url) {
                Some(body) => Ok(FetchOutcome::Fresh {
                    body: Bytes::from_static(body.as_bytes()),
                    etag: None,
                }),
                None => Err(FetchError::Status(404)),
            };
            async move { outcome }
        }
    }

    fn config(dir: &TempDir) -> ShieldsConfig {
        let mut config = ShieldsConfig {
            user_data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.resources.insert(
            ADBLOCK.to_string(),
            ResourceConfig::new("https://lists.test/easylist.txt", "1"),
        );
        config.resources.insert(
            REGIONAL_ADBLOCK.to_string(),
            ResourceConfig::new("https://lists.test/{uuid}.txt", "1"),
        );
        config.resources.insert(
            TRACKING_PROTECTION.to_string(),
            ResourceConfig::new("https://lists.test/trackers.json", "1"),
        );
        config.resources.insert(
            HTTPS_EVERYWHERE.to_string(),
            ResourceConfig::new("https://lists.test/httpse.json", "1"),
        );
        config
    }

    fn fetcher() -> MapFetcher {
        MapFetcher(HashMap::from([
            ("https://lists.test/easylist.txt".to_string(), "||ads.com^\n"),
            ("https://lists.test/regional-1.txt".to_string(), "||regional-ads.com^\n"),
            ("https://lists.test/trackers.json".to_string(), r#"{"trackers": ["tracker.com"]}"#),
        ]))
    }

    async fn join(handles: Vec<LoadHandle>) -> Vec<Result<(), DataFileError>> {
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    fn engine(dir: &TempDir) -> (ShieldsEngine<MapFetcher>, Arc<MemorySettings>) {
        let settings = Arc::new(MemorySettings::new());
        let engine = ShieldsEngine::new(config(dir), settings.clone(), fetcher(), Arc::new(MemoryStateStore::new())).unwrap();
        (engine, settings)
    }

    fn script(url: &str) -> RequestDetails {
        RequestDetails::new(1, url, ResourceType::Script).with_first_party("https://news.com/")
    }

    #[tokio::test]
    async fn test_start_loads_and_failed_resource_stays_inert() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);

        let results = join(engine.start()).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);

        let status = engine.status();
        assert!(status.stages[ADBLOCK].initialized);
        assert!(status.stages[TRACKING_PROTECTION].initialized);
        assert!(!status.stages[HTTPS_EVERYWHERE].initialized);
        assert!(status.stages[HTTPS_EVERYWHERE].enabled);
        assert!(status.resources[HTTPS_EVERYWHERE].last_error.is_some());
        assert!(!status.resources.contains_key(REGIONAL_ADBLOCK));

        assert!(engine.on_before_request(&script("https://ads.com/a.js")).cancel);
        assert!(engine.on_before_request(&script("https://tracker.com/t.js")).cancel);
        assert!(!engine.on_before_request(&script("https://cdn.news.com/app.js")).cancel);
    }

    #[tokio::test]
    async fn test_disabled_protection_is_not_loaded() {
        let dir = TempDir::new().unwrap();
        let (engine, settings) = engine(&dir);
        settings.set_enabled(TRACKING_PROTECTION, false);

        join(engine.start()).await;
        assert!(!engine.status().stages[TRACKING_PROTECTION].initialized);

        settings.set_enabled(TRACKING_PROTECTION, true);
        let results = join(engine.on_settings_changed()).await;
        assert!(results.iter().any(|r| r.is_ok()));
        assert!(engine.status().stages[TRACKING_PROTECTION].initialized);
    }

    #[tokio::test]
    async fn test_regional_lists() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        join(engine.start()).await;

        let results = join(engine.set_regional_lists(&["regional-1".to_string()])).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(engine.on_before_request(&script("https://regional-ads.com/a.js")).cancel);
        assert!(engine.status().stages.contains_key("adblock-regional-1"));

        join(engine.set_regional_lists(&[])).await;
        assert!(!engine.on_before_request(&script("https://regional-ads.com/a.js")).cancel);
    }

    #[tokio::test]
    async fn test_new_partitions_get_every_stage() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        let private = PartitionId::new("private-1");
        engine.add_partition(&private);

        let default = PartitionId::default();
        for phase in Phase::all() {
            assert_eq!(
                engine.dispatcher().stage_names(&default, *phase),
                engine.dispatcher().stage_names(&private, *phase)
            );
        }
        assert_eq!(
            engine.dispatcher().stage_names(&private, Phase::BeforeRequest),
            vec![HTTPS_EVERYWHERE, TRACKING_PROTECTION, ADBLOCK, CUSTOM_ADBLOCK, SITE_HACKS]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_rules_through_engine() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        assert_eq!(engine.submit_custom_rules("||mine.com^").wait().await.unwrap(), 1);
        assert!(engine.on_before_request(&script("https://mine.com/a.js")).cancel);
        assert!(engine.status().stages[CUSTOM_ADBLOCK].initialized);
    }

    #[tokio::test]
    async fn test_https_upgrade_and_redirect_loop() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = fetcher();
        fetcher.0.insert(
            "https://lists.test/httpse.json".to_string(),
            r#"{"targets": {"bank.com": [1]}, "rulesets": {"1": {"name": "Bank",
                "rule": [{"from": "^http:", "to": "https:"}]}}}"#,
        );
        let engine =
            ShieldsEngine::new(config(&dir), Arc::new(MemorySettings::new()), fetcher, Arc::new(MemoryStateStore::new()))
                .unwrap();
        assert!(join(engine.start()).await.iter().all(|r| r.is_ok()));

        let page = RequestDetails::new(7, "http://bank.com/login", ResourceType::MainFrame);
        assert_eq!(
            engine.on_before_request(&page).redirect_url.as_deref(),
            Some("https://bank.com/login")
        );

        let bounce = RedirectDetails {
            id: 7,
            url: "https://bank.com/login".to_string(),
            redirect_url: "http://bank.com/login".to_string(),
            partition: PartitionId::default(),
        };
        for _ in 0..6 {
            engine.on_before_redirect(&bounce);
        }
        assert!(engine.on_before_request(&page).redirect_url.is_none());
        assert_eq!(engine.https_upgrade().guard().blacklist_len(), 1);
    }

    #[tokio::test]
    async fn test_private_partition_headers_and_firewall() {
        let dir = TempDir::new().unwrap();
        let (engine, settings) = engine(&dir);
        let private = PartitionId::new("private-1");
        engine.add_partition(&private);
        settings.set_cookie_setting(crate::settings::CookieSetting::BlockAllCookies);

        let mut details = RequestDetails::new(3, "https://cdn.other.com/pic.png", ResourceType::Image)
            .with_first_party("https://news.com/")
            .with_partition(private.clone());
        details
            .request_headers
            .insert(hyper::header::COOKIE, hyper::header::HeaderValue::from_static("id=1"));
        let verdict = engine.on_before_send_headers(&details);
        let headers = verdict.request_headers.expect("cookie stage rewrites headers");
        assert!(headers.get(hyper::header::COOKIE).is_none());

        let intranet = RequestDetails::new(4, "http://192.168.1.1/admin", ResourceType::SubFrame)
            .with_first_party("https://news.com/")
            .with_partition(private)
            .with_ip("192.168.1.1".parse().unwrap());
        assert!(engine.on_headers_received(&intranet, &HeaderMap::new()).cancel);

        let counts = engine.status().dispatch["headersReceived"];
        assert_eq!(counts.cancelled, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.https_upgrade.redirect_loop_threshold = 0;
        let result = ShieldsEngine::new(
            config,
            Arc::new(MemorySettings::new()),
            fetcher(),
            Arc::new(MemoryStateStore::new()),
        );
        assert!(result.is_err());
    }
}
