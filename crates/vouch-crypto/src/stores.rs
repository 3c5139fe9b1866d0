//! Key-value stores for pinned public keys.
//!
//! A record maps a contact id to the exported key that was trusted on the
//! first verified session. The trust store only needs `get`/`put`; the
//! file store keeps the map as pretty-printed JSON so it can be inspected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use tracing::debug;

use crate::error::StoreError;

/// Persistent key storage keyed by contact id.
pub trait KeyStore: Send + Sync {
    fn get(&self, contact_id: &str) -> Result<Option<String>, StoreError>;

    fn put(&self, contact_id: &str, exported_key: &str) -> Result<(), StoreError>;

    /// All records, sorted by contact id.
    fn entries(&self) -> Result<Vec<(String, String)>, StoreError>;
}

// ── In-memory store ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryKeyStore {
    records: DashMap<String, String>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, contact_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records.get(contact_id).map(|v| v.value().clone()))
    }

    fn put(&self, contact_id: &str, exported_key: &str) -> Result<(), StoreError> {
        self.records
            .insert(contact_id.to_string(), exported_key.to_string());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut entries: Vec<(String, String)> = self
            .records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }
}

// ── JSON file store ─────────────────────────────────────────────────────

/// Pins stored as `{ "contact id": "<exported key>", ... }` in one file.
///
/// The file is re-read on every access so that another process sharing it
/// sees fresh records. Writes go to a `.tmp` sibling and are renamed into
/// place.
pub struct FileKeyStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            StoreError::Corrupt(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    fn save(&self, records: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(records)
            .map_err(|e| StoreError::Unavailable(format!("failed to serialize pins: {e}")))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|e| {
            StoreError::Unavailable(format!("failed to write {}: {e}", tmp_path.display()))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            StoreError::Unavailable(format!("failed to rename pin file: {e}"))
        })?;
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self, contact_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load()?.remove(contact_id))
    }

    fn put(&self, contact_id: &str, exported_key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut records = self.load()?;
        records.insert(contact_id.to_string(), exported_key.to_string());
        self.save(&records)?;
        debug!(contact = %contact_id, path = %self.path.display(), "pin record written");
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self.load()?.into_iter().collect())
    }
}
