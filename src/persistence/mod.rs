//! Opaque key/value persistence
//!
//! Only used to remember small strings such as the last active preset id.
//! Storage is non-critical: every failure is logged and swallowed, a failed
//! read behaves like a missing key.

use color_eyre::eyre::{eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Key under which the last active preset id is stored
pub const LAST_PRESET_KEY: &str = "tapendos.activePreset";

const STORE_FILE: &str = "store.toml";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Option<String>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = ()> + Send;
}

/// Flat string table in a TOML file
pub struct TomlFileStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl TomlFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Store inside the application config directory
    pub fn in_config_dir() -> Self {
        Self::new(crate::config::config_dir().join(STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_table(&self) -> Result<BTreeMap<String, String>> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check store file: {}", e))?
        {
            return Ok(BTreeMap::new());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| eyre!("Failed to read store file: {}", e))?;
        toml::from_str(&content).map_err(|e| eyre!("Failed to parse store file: {}", e))
    }

    async fn write_entry(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut table = self.read_table().await.unwrap_or_else(|e| {
            warn!("Discarding unreadable store: {}", e);
            BTreeMap::new()
        });
        table.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(&table).map_err(|e| eyre!("Failed to serialize store: {}", e))?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write store file: {}", e))
    }
}

impl KeyValueStore for TomlFileStore {
    async fn get(&self, key: &str) -> Option<String> {
        match self.read_table().await {
            Ok(mut table) => table.remove(key),
            Err(e) => {
                warn!("Ignoring store read failure: {}", e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str) {
        match self.write_entry(key, value).await {
            Ok(()) => debug!(key, "Stored value"),
            Err(e) => warn!("Ignoring store write failure: {}", e),
        }
    }
}

/// Process-local store for simulation and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());
    }
}

/// Remembers which preset was active last
pub struct PresetMemory<S> {
    store: S,
}

impl<S: KeyValueStore> PresetMemory<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn remember(&self, preset_id: &str) {
        info!(preset = preset_id, "Remembering active preset");
        self.store.set(LAST_PRESET_KEY, preset_id).await;
    }

    pub async fn last(&self) -> Option<String> {
        self.store
            .get(LAST_PRESET_KEY)
            .await
            .filter(|id| !id.is_empty())
    }
}
