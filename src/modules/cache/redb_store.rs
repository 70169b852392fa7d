use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};

use super::{CacheEntry, CacheError, CacheStore};

/// Maps request URL to a JSON-encoded [`CacheEntry`].
const RESPONSES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("responses");

fn backend(err: impl std::fmt::Display) -> CacheError {
    CacheError::Backend(err.to_string())
}

/// Embedded redb database backend.
pub struct RedbCacheStore {
    db: Database,
}

impl RedbCacheStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db = Database::create(path.as_ref()).map_err(backend)?;
        let txn = db.begin_write().map_err(backend)?;
        txn.open_table(RESPONSES_TABLE).map_err(backend)?;
        txn.commit().map_err(backend)?;
        Ok(Self { db })
    }
}

impl std::fmt::Debug for RedbCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbCacheStore").finish_non_exhaustive()
    }
}

impl CacheStore for RedbCacheStore {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(RESPONSES_TABLE).map_err(backend)?;
        let Some(raw) = table.get(key).map_err(backend)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(raw.value())?))
    }

    fn store(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let encoded = serde_json::to_vec(entry)?;
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(RESPONSES_TABLE).map_err(backend)?;
            table.insert(key, encoded.as_slice()).map_err(backend)?;
        }
        txn.commit().map_err(backend)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(RESPONSES_TABLE).map_err(backend)?;
            table.remove(key).map_err(backend)?;
        }
        txn.commit().map_err(backend)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let txn = self.db.begin_write().map_err(backend)?;
        let removed;
        {
            let mut table = txn.open_table(RESPONSES_TABLE).map_err(backend)?;
            let mut expired = Vec::new();
            for row in table.iter().map_err(backend)? {
                let (key, value) = row.map_err(backend)?;
                // Undecodable rows are dropped along with expired ones.
                let stale = serde_json::from_slice::<CacheEntry>(value.value())
                    .map_or(true, |entry| entry.is_expired(now));
                if stale {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(backend)?;
            }
            removed = expired.len();
        }
        txn.commit().map_err(backend)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entry(expires_in: i64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            status: 404,
            headers: BTreeMap::new(),
            body: String::new(),
            stored_at: now,
            expires_at: now + chrono::Duration::seconds(expires_in),
        }
    }

    #[test]
    fn stores_loads_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbCacheStore::open(dir.path().join("cache.redb")).unwrap();

        store.store("https://example.com/missing", &entry(900)).unwrap();
        store.store("https://example.com/old", &entry(-5)).unwrap();
        assert_eq!(
            store.load("https://example.com/missing").unwrap().unwrap().status,
            404
        );

        assert_eq!(store.purge_expired(Utc::now()).unwrap(), 1);
        assert!(store.load("https://example.com/old").unwrap().is_none());

        store.remove("https://example.com/missing").unwrap();
        assert!(store.load("https://example.com/missing").unwrap().is_none());
    }
}
