//! Per-table name→string persistence, backed by a single embedded [`sled::Db`].
//!
//! The app opens one `sled::Tree` per logical table (`config`, `groups`,
//! `units`, `cores`, `wu_log`) lazily on first use and keeps the handle for
//! the process lifetime, matching the concurrency note in spec.md §5. Values
//! are always UTF-8 JSON strings — the store itself does no interpretation.

use crate::error::{FahError, Result};
use std::path::Path;

pub struct KvStore {
    db: sled::Db,
}

impl KvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| FahError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn table(&self, name: &str) -> Result<KvTable> {
        let tree = self
            .db
            .open_tree(name)
            .map_err(|e| FahError::Storage(e.to_string()))?;
        Ok(KvTable { tree })
    }
}

/// A single name→string table.
#[derive(Clone)]
pub struct KvTable {
    tree: sled::Tree,
}

impl KvTable {
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let bytes = self
            .tree
            .get(key)
            .map_err(|e| FahError::Storage(e.to_string()))?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).ok().flatten().unwrap_or_else(|| default.to_string())
    }

    pub fn has(&self, key: &str) -> bool {
        self.tree.contains_key(key).unwrap_or(false)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.tree
            .insert(key, value.as_bytes())
            .map_err(|e| FahError::Storage(e.to_string()))?;
        self.tree.flush().map_err(|e| FahError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key)
            .map_err(|e| FahError::Storage(e.to_string()))?;
        self.tree.flush().map_err(|e| FahError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Iterate over all `(key, value)` pairs in the table.
    pub fn iter(&self) -> impl Iterator<Item = (String, String)> {
        self.tree.iter().filter_map(|entry| {
            let (k, v) = entry.ok()?;
            Some((
                String::from_utf8_lossy(&k).into_owned(),
                String::from_utf8_lossy(&v).into_owned(),
            ))
        })
    }
}
