//! Local durable key-value storage.
//!
//! A small JSON-file-backed store for state that must survive restarts:
//! the device id and the last published playlist snapshot.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// String key-value store persisted as a single JSON file. Writes go through
/// a temp file and an atomic rename so a crash never leaves a torn file.
pub struct KvStore {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl KvStore {
    /// Open the store, creating parent directories and loading any existing
    /// contents. A corrupt file is discarded rather than refusing to start.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create data directory")?;
        }

        let map = match fs::read_to_string(&path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("Discarding corrupt state file {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.lock().expect("kv store poisoned").get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.lock().expect("kv store poisoned");
        map.insert(key.to_string(), value.to_string());
        self.flush(&map)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut map = self.map.lock().expect("kv store poisoned");
        if map.remove(key).is_some() {
            self.flush(&map)?;
        }
        Ok(())
    }

    fn flush(&self, map: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(map).context("Failed to serialize state")?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).context("Failed to write state file")?;
        fs::rename(&tmp, &self.path).context("Failed to replace state file")?;
        Ok(())
    }
}
