//! Shields Configuration
//!
//! Static configuration for the data-file resources and the filter
//! stages, loadable from TOML.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Resource names of the built-in data files
pub const ADBLOCK: &str = "adblock";
pub const TRACKING_PROTECTION: &str = "trackingProtection";
pub const HTTPS_EVERYWHERE: &str = "httpsEverywhere";
pub const NOSCRIPT: &str = "noScript";
pub const SITE_HACKS: &str = "siteHacks";
pub const FIREWALL: &str = "firewall";
pub const COOKIE_BLOCK: &str = "cookieblock";
pub const CUSTOM_ADBLOCK: &str = "customAdblock";
/// Template resource for regional ad-block lists
pub const REGIONAL_ADBLOCK: &str = "regionalAdblock";

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One downloadable data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// URL template; `{version}` and `{uuid}` are substituted
    pub url: String,
    pub version: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_recheck_ms")]
    pub ms_between_rechecks: u64,
}

impl ResourceConfig {
    pub fn new(url: &str, version: &str) -> Self {
        Self {
            url: url.to_string(),
            version: version.to_string(),
            uuid: None,
            enabled: true,
            ms_between_rechecks: default_recheck_ms(),
        }
    }

    /// The download URL with placeholders filled in
    pub fn resolved_url(&self) -> String {
        let url = self.url.replace("{version}", &self.version);
        match &self.uuid {
            Some(uuid) => url.replace("{uuid}", uuid),
            None => url,
        }
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.ms_between_rechecks)
    }
}

fn default_true() -> bool {
    true
}

fn default_recheck_ms() -> u64 {
    DAY_MS
}

/// Ad-block stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdBlockConfig {
    /// Main-frame hosts whose first-party requests are checked too
    pub first_party_check_hosts: Vec<String>,
    /// Hosts never blocked
    pub allowed_hosts: Vec<String>,
    /// UUIDs of regional lists to enable
    pub regional_lists: Vec<String>,
    /// Initial custom rule text
    pub custom_rules: String,
    pub custom_rules_debounce_ms: u64,
}

impl Default for AdBlockConfig {
    fn default() -> Self {
        Self {
            first_party_check_hosts: vec![
                "www.googletagmanager.com".to_string(),
                "www.googletagservices.com".to_string(),
            ],
            allowed_hosts: Vec::new(),
            regional_lists: Vec::new(),
            custom_rules: String::new(),
            custom_rules_debounce_ms: 1500,
        }
    }
}

/// Script-blocking stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptBlockConfig {
    /// Leave localhost alone; turned off by tests
    pub skip_localhost: bool,
    /// Built-in start pages that are never blocked
    pub start_page_prefixes: Vec<String>,
}

impl Default for ScriptBlockConfig {
    fn default() -> Self {
        Self {
            skip_localhost: true,
            start_page_prefixes: vec!["about:newtab".to_string(), "fos://newtab".to_string()],
        }
    }
}

/// HTTPS upgrade stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsUpgradeConfig {
    /// Redirects one request may take before its target is blacklisted
    pub redirect_loop_threshold: u32,
}

impl Default for HttpsUpgradeConfig {
    fn default() -> Self {
        Self { redirect_loop_threshold: 5 }
    }
}

/// Data file download configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub user_agent: String,
    /// Largest data file accepted
    pub max_body_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: "fOS-Shields/0.1".to_string(),
            max_body_size: 64 * 1024 * 1024,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Complete shields configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldsConfig {
    /// Where cached data files and resource state live
    pub user_data_dir: PathBuf,
    pub resources: BTreeMap<String, ResourceConfig>,
    pub ad_block: AdBlockConfig,
    pub script_block: ScriptBlockConfig,
    pub https_upgrade: HttpsUpgradeConfig,
    pub fetch: FetchConfig,
}

impl Default for ShieldsConfig {
    fn default() -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(
            ADBLOCK.to_string(),
            ResourceConfig::new("https://easylist.to/easylist/easylist.txt?v={version}", "1"),
        );
        resources.insert(
            REGIONAL_ADBLOCK.to_string(),
            ResourceConfig::new("https://filters.fos.example/{version}/{uuid}.txt", "1"),
        );
        resources.insert(
            TRACKING_PROTECTION.to_string(),
            ResourceConfig::new("https://filters.fos.example/{version}/tracking-protection.json", "1"),
        );
        resources.insert(
            HTTPS_EVERYWHERE.to_string(),
            ResourceConfig::new("https://filters.fos.example/{version}/httpse-rulesets.json", "1"),
        );

        Self {
            user_data_dir: PathBuf::from("fos-shields-data"),
            resources,
            ad_block: AdBlockConfig::default(),
            script_block: ScriptBlockConfig::default(),
            https_upgrade: HttpsUpgradeConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl ShieldsConfig {
    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ShieldsConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, resource) in &self.resources {
            if resource.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("resource {} has no url", name)));
            }
            if resource.ms_between_rechecks == 0 {
                return Err(ConfigError::Invalid(format!(
                    "resource {} has a zero recheck interval",
                    name
                )));
            }
        }
        if self.https_upgrade.redirect_loop_threshold == 0 {
            return Err(ConfigError::Invalid("redirect_loop_threshold must be at least 1".into()));
        }
        Ok(())
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.get(name)
    }

    /// Resource entry for one regional ad-block list, derived from the
    /// regional template
    pub fn regional_resource(&self, uuid: &str) -> Option<(String, ResourceConfig)> {
        let template = self.resources.get(REGIONAL_ADBLOCK)?;
        let mut resource = template.clone();
        resource.uuid = Some(uuid.to_string());
        Some((format!("{}-{}", ADBLOCK, uuid), resource))
    }

    pub fn resource_state_path(&self) -> PathBuf {
        self.user_data_dir.join("resource-state.json")
    }
}
