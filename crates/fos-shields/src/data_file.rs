//! Data File Manager
//!
//! Lifecycle of the downloaded rule files each stage depends on:
//! decide whether a re-download is due, fetch conditionally with the
//! cached ETag, replace the cached copy atomically, then deserialize it
//! and hand the resulting rule set to its stage.
//!
//! Flow of one `load`:
//! 1. Re-download if forced, the declared version changed, or the
//!    recheck interval elapsed
//! 2. Download failure falls back to whatever is cached on disk
//! 3. Read + deserialize; a missing, empty or corrupt cache counts as a
//!    cache miss, which deletes the file and forces one unconditional
//!    download unless this load already received a fresh body
//! 4. `on_ready` runs exactly once on success; otherwise the resource
//!    stays uninitialized for the rest of the run

use crate::config::ResourceConfig;
use crate::fetch::{FetchError, FetchOutcome, Fetcher};
use crate::state_store::ResourceStateStore;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Data file errors
#[derive(Debug, Error)]
pub enum DataFileError {
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Resource {0} is disabled")]
    Disabled(String),

    #[error("Cannot derive a file name from {0}")]
    InvalidUrl(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cached file {0} is empty")]
    Empty(PathBuf),

    #[error("Deserialization failed: {0}")]
    Deserialize(String),
}

/// Queryable state of one resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub enabled: bool,
    /// Set once `on_ready` has run
    pub initialized: bool,
    pub last_error: Option<String>,
    pub etag: Option<String>,
    pub last_check_date: Option<u64>,
}

/// Fetches, caches and versions the data files of named resources
pub struct DataFileManager<F: Fetcher> {
    user_data_dir: PathBuf,
    resources: RwLock<BTreeMap<String, ResourceConfig>>,
    status: RwLock<BTreeMap<String, ResourceStatus>>,
    fetcher: F,
    store: Arc<dyn ResourceStateStore>,
}

impl<F: Fetcher> DataFileManager<F> {
    pub fn new(
        user_data_dir: impl Into<PathBuf>,
        resources: BTreeMap<String, ResourceConfig>,
        fetcher: F,
        store: Arc<dyn ResourceStateStore>,
    ) -> Self {
        let status = resources
            .iter()
            .map(|(name, resource)| {
                (
                    name.clone(),
                    ResourceStatus {
                        enabled: resource.enabled,
                        ..Default::default()
                    },
                )
            })
            .collect();

        Self {
            user_data_dir: user_data_dir.into(),
            resources: RwLock::new(resources),
            status: RwLock::new(status),
            fetcher,
            store,
        }
    }

    /// Add or replace a resource definition
    pub fn register_resource(&self, name: &str, resource: ResourceConfig) {
        self.status.write().entry(name.to_string()).or_default().enabled = resource.enabled;
        self.resources.write().insert(name.to_string(), resource);
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) {
        if let Some(resource) = self.resources.write().get_mut(name) {
            resource.enabled = enabled;
        }
        self.status.write().entry(name.to_string()).or_default().enabled = enabled;
    }

    pub fn resource(&self, name: &str) -> Option<ResourceConfig> {
        self.resources.read().get(name).cloned()
    }

    fn require(&self, name: &str) -> Result<ResourceConfig, DataFileError> {
        self.resource(name)
            .ok_or_else(|| DataFileError::UnknownResource(name.to_string()))
    }

    pub fn status(&self, name: &str) -> Option<ResourceStatus> {
        let mut status = self.status.read().get(name).cloned()?;
        let state = self.store.get(name);
        status.etag = state.etag;
        status.last_check_date = state.last_check_date;
        Some(status)
    }

    pub fn all_status(&self) -> BTreeMap<String, ResourceStatus> {
        let names: Vec<String> = self.status.read().keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| self.status(&name).map(|s| (name, s)))
            .collect()
    }

    /// Cached file location: the URL's basename inside the data directory
    pub fn storage_path(&self, name: &str) -> Result<PathBuf, DataFileError> {
        let url = self.require(name)?.resolved_url();
        let parsed = url::Url::parse(&url).map_err(|_| DataFileError::InvalidUrl(url.clone()))?;
        let basename = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DataFileError::InvalidUrl(url.clone()))?;
        Ok(self.user_data_dir.join(basename))
    }

    /// Whether `load` would hit the network
    pub fn should_redownload(&self, name: &str, force: bool) -> Result<bool, DataFileError> {
        let resource = self.require(name)?;
        if force {
            return Ok(true);
        }

        let state = self.store.get(name);
        if state.last_check_version.as_deref() != Some(resource.version.as_str()) {
            return Ok(true);
        }
        Ok(match state.last_check_date {
            Some(last) => now_ms().saturating_sub(last) > resource.ms_between_rechecks,
            None => true,
        })
    }

    /// Download one resource and replace its cached copy. A
    /// `conditional` request sends the stored ETag as `If-None-Match`.
    ///
    /// Returns whether a new body replaced the cached file.
    pub async fn download(&self, name: &str, conditional: bool) -> Result<bool, DataFileError> {
        let resource = self.require(name)?;
        let url = resource.resolved_url();
        let path = self.storage_path(name)?;
        let state = self.store.get(name);

        // A version bump invalidates the cached entity
        let etag = match state.last_check_version.as_deref() {
            Some(version) if conditional && version == resource.version => state.etag.clone(),
            _ => None,
        };

        debug!("Downloading {} from {} (etag: {:?})", name, url, etag);
        let replaced = match self.fetcher.fetch(&url, etag.as_deref()).await? {
            FetchOutcome::Fresh { body, etag } => {
                tokio::fs::create_dir_all(&self.user_data_dir).await?;
                let dir = self.user_data_dir.clone();
                let len = body.len();
                tokio::task::spawn_blocking(move || replace_file(&dir, &path, &body))
                    .await
                    .map_err(std::io::Error::other)??;
                self.store.set_etag(name, etag);
                info!("Downloaded {} ({} bytes)", name, len);
                true
            }
            FetchOutcome::NotModified => {
                debug!("{} not modified", name);
                false
            }
        };
        self.store.set_last_check(name, &resource.version, now_ms());
        self.store.persist().await;
        Ok(replaced)
    }

    /// Bring one resource up: download if due, then deserialize the
    /// cached file and pass the result to `on_ready`.
    ///
    /// Failures are logged and recorded in the resource status; the
    /// returned error is informational.
    pub async fn load<T, E, D, R>(
        &self,
        name: &str,
        force: bool,
        deserialize: D,
        on_ready: R,
    ) -> Result<(), DataFileError>
    where
        D: Fn(&[u8]) -> Result<T, E> + Send + Sync,
        E: Display,
        R: FnOnce(T) + Send,
        T: Send,
    {
        let result = self.load_inner(name, force, deserialize).await;
        match result {
            Ok(rules) => {
                on_ready(rules);
                let mut status = self.status.write();
                let entry = status.entry(name.to_string()).or_default();
                entry.initialized = true;
                entry.last_error = None;
                info!("Resource {} ready", name);
                Ok(())
            }
            Err(e) => {
                warn!("Resource {} failed to load, staying inert: {}", name, e);
                self.status.write().entry(name.to_string()).or_default().last_error =
                    Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn load_inner<T, E, D>(&self, name: &str, force: bool, deserialize: D) -> Result<T, DataFileError>
    where
        D: Fn(&[u8]) -> Result<T, E> + Send + Sync,
        E: Display,
    {
        let resource = self.require(name)?;
        if !resource.enabled {
            return Err(DataFileError::Disabled(name.to_string()));
        }
        let path = self.storage_path(name)?;

        // Cleared once this load has a freshly downloaded body, or knows
        // the network is unreachable
        let mut may_refetch = true;
        if self.should_redownload(name, force)? {
            match self.download(name, true).await {
                Ok(replaced) => may_refetch = !replaced,
                Err(e) => {
                    warn!("Download of {} failed, falling back to cache: {}", name, e);
                    may_refetch = false;
                }
            }
        }

        let e = match read_and_deserialize(&path, &deserialize).await {
            Ok(rules) => return Ok(rules),
            Err(e) => e,
        };
        if !may_refetch {
            discard_unusable(&path, &e).await;
            return Err(e);
        }

        warn!("Cached {} unusable ({}), forcing a fresh download", name, e);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Could not remove {}: {}", path.display(), e);
        }
        self.download(name, false).await?;
        match read_and_deserialize(&path, &deserialize).await {
            Ok(rules) => Ok(rules),
            Err(e) => {
                discard_unusable(&path, &e).await;
                Err(e)
            }
        }
    }
}

/// Delete a cached file that was read but could not be used
async fn discard_unusable(path: &Path, error: &DataFileError) {
    if !matches!(error, DataFileError::Empty(_) | DataFileError::Deserialize(_)) {
        return;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed unusable {}", path.display()),
        Err(e) => warn!("Could not remove unusable {}: {}", path.display(), e),
    }
}

/// Write `body` to a private `<basename>.<random>.temp` file in `dir`,
/// then rename it over `path`
fn replace_file(dir: &Path, path: &Path, body: &[u8]) -> std::io::Result<()> {
    let prefix = path
        .file_name()
        .map(|name| format!("{}.", name.to_string_lossy()))
        .unwrap_or_default();
    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".temp")
        .tempfile_in(dir)?;
    temp.write_all(body)?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn read_and_deserialize<T, E, D>(path: &Path, deserialize: &D) -> Result<T, DataFileError>
where
    D: Fn(&[u8]) -> Result<T, E>,
    E: Display,
{
    let data = tokio::fs::read(path).await?;
    if data.is_empty() {
        return Err(DataFileError::Empty(path.to_path_buf()));
    }
    deserialize(&data).map_err(|e| DataFileError::Deserialize(e.to_string()))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
