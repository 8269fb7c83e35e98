//! In-memory storage backend.
//!
//! Used by tests and by embedders that keep ratchet state client-side. Records
//! are still sealed by the store before they arrive here.

use crate::error::{PqRatchetError, Result};
use crate::store::{StoreBackend, Table};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// A thread-safe in-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    states: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    skipped: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: Table) -> &RwLock<BTreeMap<Vec<u8>, Vec<u8>>> {
        match table {
            Table::RatchetStates => &self.states,
            Table::SkippedKeys => &self.skipped,
        }
    }
}

impl StoreBackend for MemoryBackend {
    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        let mut map = self
            .table(table)
            .write()
            .map_err(|_| PqRatchetError::storage("memory backend poisoned"))?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self
            .table(table)
            .read()
            .map_err(|_| PqRatchetError::storage("memory backend poisoned"))?;
        Ok(map.get(key).cloned())
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<bool> {
        let mut map = self
            .table(table)
            .write()
            .map_err(|_| PqRatchetError::storage("memory backend poisoned"))?;
        Ok(map.remove(key).is_some())
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self
            .table(table)
            .read()
            .map_err(|_| PqRatchetError::storage("memory backend poisoned"))?;
        Ok(map
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
