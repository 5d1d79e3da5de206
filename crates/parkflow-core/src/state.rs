use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::StateEntry;

/// Per-facility "last known value" storage.
///
/// A missing key is not an error: `get` returns `None`, which never equals
/// any real reading.
pub trait StateStore: Send + Sync {
    /// Get the last committed entry for a facility.
    fn get(&self, facility_key: &str) -> Result<Option<StateEntry>>;

    /// Overwrite the entry for a facility.
    fn put(&self, facility_key: &str, entry: StateEntry) -> Result<()>;

    /// Apply a set of updates. Durable stores override this to make the
    /// whole set land or none of it.
    fn put_all(&self, updates: &BTreeMap<String, StateEntry>) -> Result<()> {
        for (key, entry) in updates {
            self.put(key, *entry)?;
        }
        Ok(())
    }
}

/// Volatile state store, used in tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, StateEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, facility_key: &str) -> Result<Option<StateEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::StateStore("state lock poisoned".into()))?;
        Ok(entries.get(facility_key).copied())
    }

    fn put(&self, facility_key: &str, entry: StateEntry) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::StateStore("state lock poisoned".into()))?;
        entries.insert(facility_key.to_string(), entry);
        Ok(())
    }

    fn put_all(&self, updates: &BTreeMap<String, StateEntry>) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::StateStore("state lock poisoned".into()))?;
        for (key, entry) in updates {
            entries.insert(key.clone(), *entry);
        }
        Ok(())
    }
}
