//! File-backed flat-map persistence.
//!
//! Each store file is a JSON object keyed by source id. Writes go to a
//! sibling temp file first and are renamed into place.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use crate::error::StoreError;

pub const RULES_FILE: &str = "rules.json";
pub const LAST_SEEN_FILE: &str = "last_seen.json";

/// Directory holding the store files.
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_path: PathBuf,
}

impl JsonStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    /// Load a map. A missing file is an empty map.
    pub async fn load_map<V>(&self, name: &str) -> Result<BTreeMap<String, V>, StoreError>
    where
        V: DeserializeOwned,
    {
        let path = self.path(name);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    /// Overwrite a map.
    pub async fn save_map<V>(&self, name: &str, map: &BTreeMap<String, V>) -> Result<(), StoreError>
    where
        V: Serialize,
    {
        let path = self.path(name);
        let body = serde_json::to_string_pretty(map)?;
        write_atomic(&path, &body).await
    }
}

async fn write_atomic(path: &Path, body: &str) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
