//! Last-known-endpoint persistence
//!
//! A single-slot durable memory of the most recently connected network
//! bridge, used as a fast reconnect path while discovery catches up. The
//! storage medium hides behind a key-value capability trait so tests run
//! against an in-memory map.

use anyhow::{anyhow, Result};
use bridgelink_shared::Endpoint;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Store key for the remembered network bridge
pub const LAST_BRIDGE_HOST_KEY: &str = "last_bridge_host";

/// Durable key-value capability
pub trait KvStore: Send + Sync + 'static {
    /// Absence is not an error
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryKvStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().ok().and_then(|map| map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        map.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Flat JSON file store under the platform config directory.
///
/// An unreadable or unparsable file loads as empty; losing remembered state
/// must never prevent startup.
pub struct FileKvStore {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl FileKvStore {
    pub fn open(path: PathBuf) -> Self {
        let map = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    /// Default location: `<config dir>/bridgelink/state.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bridgelink")
            .join("state.json")
    }

    fn persist(&self, map: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(map)?;
        // Write-then-rename keeps a crash from truncating the store
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().ok().and_then(|map| map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        map.insert(key.to_owned(), value.to_owned());
        self.persist(&map)
    }
}

/// Single-slot memory of the last successfully connected network endpoint
#[derive(Clone)]
pub struct LastEndpointStore {
    kv: Arc<dyn KvStore>,
}

impl LastEndpointStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Returns the remembered endpoint, if any. Never fails: a missing or
    /// corrupt entry reads as absent.
    pub fn read(&self) -> Option<Endpoint> {
        let raw = self.kv.get(LAST_BRIDGE_HOST_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                debug!(error = %e, "ignoring unparsable remembered endpoint");
                None
            }
        }
    }

    /// Overwrite the remembered endpoint. Called after a successful network
    /// connection; a write failure only costs the fast path, so it is logged
    /// and swallowed.
    pub fn write(&self, endpoint: &Endpoint) {
        let raw = match serde_json::to_string(endpoint) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to serialize endpoint");
                return;
            }
        };
        if let Err(e) = self.kv.set(LAST_BRIDGE_HOST_KEY, &raw) {
            warn!(error = %e, %endpoint, "failed to persist last bridge endpoint");
        }
    }
}
