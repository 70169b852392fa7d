use std::collections::HashMap;
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::{CacheEntry, CacheError, CacheStore};

/// Process-local cache backend.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn store(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        self.write().insert(key.to_string(), entry.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.write().remove(key);
        Ok(())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn purge_drops_only_expired() {
        let store = MemoryCacheStore::new();
        let now = Utc::now();
        for (key, offset) in [("fresh", 60), ("stale", -60)] {
            store
                .store(
                    key,
                    &CacheEntry {
                        status: 200,
                        headers: BTreeMap::new(),
                        body: key.into(),
                        stored_at: now,
                        expires_at: now + chrono::Duration::seconds(offset),
                    },
                )
                .unwrap();
        }
        assert_eq!(store.purge_expired(now).unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.load("fresh").unwrap().is_some());
    }
}
