//! Durable device identity.
//!
//! The device identifier is resolved once when the session is built: an
//! existing value is read from a key-value store, otherwise a fresh one is
//! minted as `<device_type>_<uuid>` and written back.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{BeaconError, Result};

/// Key-value store holding the device identifier
pub trait DeviceIdStore: Send + Sync {
    /// Read a value; `Ok(None)` when the key was never written
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

/// Store key for the identifier within `namespace`
pub fn identity_key(namespace: &str) -> String {
    format!("{namespace}.device_id")
}

/// Read the stored identifier or mint and persist a new one.
///
/// Store failures never prevent a session: an unreadable store counts as
/// empty, and a failed write leaves the minted identifier valid for this
/// process only.
pub fn resolve_device_id(store: &dyn DeviceIdStore, namespace: &str, device_type: &str) -> String {
    let key = identity_key(namespace);

    match store.get(&key) {
        Ok(Some(id)) if !id.trim().is_empty() => return id,
        Ok(_) => {},
        Err(e) => tracing::warn!(error = %e, key = %key, "Identity store unreadable, minting new device id"),
    }

    let id = format!("{}_{}", device_type, uuid::Uuid::new_v4());
    if let Err(e) = store.put(&key, &id) {
        tracing::warn!(error = %e, key = %key, "Failed to persist device id");
    } else {
        tracing::info!(device_id = %id, "Minted new device id");
    }
    id
}

/// JSON file store (`{"key": "value", ...}`)
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Store backed by `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                BeaconError::Identity(format!("Corrupt identity file {:?}: {e}", self.path))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl DeviceIdStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        // A corrupt file is replaced rather than blocking the write
        let mut entries = self.load().unwrap_or_default();
        entries.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-process store, for tests and embedders with their own persistence
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceIdStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| BeaconError::Identity("memory store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| BeaconError::Identity("memory store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
