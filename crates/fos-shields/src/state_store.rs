//! Resource State Store
//!
//! Per-resource download bookkeeping (ETag, last check) that must
//! survive restarts so the recheck interval is honored across runs.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::{debug, warn};

pub type PersistFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Download bookkeeping for one named resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub etag: Option<String>,
    /// Version declared when the resource was last checked
    pub last_check_version: Option<String>,
    /// Milliseconds since the Unix epoch
    pub last_check_date: Option<u64>,
}

/// Write access to resource bookkeeping
///
/// Setters only touch memory; `persist` makes them durable.
pub trait ResourceStateStore: Send + Sync {
    fn get(&self, resource: &str) -> ResourceState;
    fn set_etag(&self, resource: &str, etag: Option<String>);
    fn set_last_check(&self, resource: &str, version: &str, date_ms: u64);

    fn persist(&self) -> PersistFuture<'_> {
        Box::pin(async {})
    }
}

/// Store keeping everything in memory
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<BTreeMap<String, ResourceState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceStateStore for MemoryStateStore {
    fn get(&self, resource: &str) -> ResourceState {
        self.states.lock().get(resource).cloned().unwrap_or_default()
    }

    fn set_etag(&self, resource: &str, etag: Option<String>) {
        self.states.lock().entry(resource.to_string()).or_default().etag = etag;
    }

    fn set_last_check(&self, resource: &str, version: &str, date_ms: u64) {
        let mut states = self.states.lock();
        let state = states.entry(resource.to_string()).or_default();
        state.last_check_version = Some(version.to_string());
        state.last_check_date = Some(date_ms);
    }
}

/// Store persisted as one JSON document, rewritten on each `persist`
#[derive(Debug)]
pub struct JsonStateStore {
    path: PathBuf,
    states: Mutex<BTreeMap<String, ResourceState>>,
    /// Serializes writers so the newest snapshot lands last
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonStateStore {
    /// Open the store at `path`. A missing or corrupt file starts empty.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let states = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable resource state {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        debug!("Loaded {} resource states from {}", states.len(), path.display());

        Self {
            path,
            states: Mutex::new(states),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn write(&self) -> std::io::Result<()> {
        let _writer = self.write_lock.lock().await;
        let json = serde_json::to_vec_pretty(&*self.states.lock()).map_err(std::io::Error::other)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension("json.temp");
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await
    }
}

impl ResourceStateStore for JsonStateStore {
    fn get(&self, resource: &str) -> ResourceState {
        self.states.lock().get(resource).cloned().unwrap_or_default()
    }

    fn set_etag(&self, resource: &str, etag: Option<String>) {
        self.states.lock().entry(resource.to_string()).or_default().etag = etag;
    }

    fn set_last_check(&self, resource: &str, version: &str, date_ms: u64) {
        let mut states = self.states.lock();
        let state = states.entry(resource.to_string()).or_default();
        state.last_check_version = Some(version.to_string());
        state.last_check_date = Some(date_ms);
    }

    fn persist(&self) -> PersistFuture<'_> {
        Box::pin(async move {
            if let Err(e) = self.write().await {
                warn!("Failed to persist resource state to {}: {}", self.path.display(), e);
            }
        })
    }
}
