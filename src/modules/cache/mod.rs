//! Response cache.
//!
//! [`ResponseCache`] applies the TTL policy (only 200 and 404 are kept) on top of
//! a pluggable [`CacheStore`] backend. Expired entries are evicted lazily on read.
//! Backend failures never fail a fetch: they are logged and treated as a miss.

mod json_file;
mod memory;
mod redb_store;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use json_file::JsonFileCacheStore;
pub use memory::MemoryCacheStore;
pub use redb_store::RedbCacheStore;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Statuses worth remembering; everything else must be re-evaluated.
pub fn is_cacheable_status(status: u16) -> bool {
    matches!(status, 200 | 404)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Key/value backend holding cache entries keyed by exact URL.
pub trait CacheStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    fn store(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
    /// Drop every entry expired at `now`, returning how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError>;
}

/// TTL policy over a [`CacheStore`].
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live entry for `url`; an expired entry is evicted and reported as a miss.
    pub fn get(&self, url: &str) -> Option<CacheEntry> {
        let entry = match self.store.load(url) {
            Ok(entry) => entry?,
            Err(err) => {
                log::warn!("cache lookup for {url} failed: {err}");
                return None;
            }
        };

        if entry.is_expired(Utc::now()) {
            if let Err(err) = self.store.remove(url) {
                log::warn!("evicting expired cache entry for {url} failed: {err}");
            }
            return None;
        }
        Some(entry)
    }

    /// Store a response if its status is cacheable. Returns whether it was written.
    pub fn put(
        &self,
        url: &str,
        status: u16,
        headers: BTreeMap<String, String>,
        body: &str,
    ) -> bool {
        if !is_cacheable_status(status) || self.ttl.is_zero() {
            return false;
        }
        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return false;
        };

        let now = Utc::now();
        let entry = CacheEntry {
            status,
            headers,
            body: body.to_string(),
            stored_at: now,
            expires_at: now + ttl,
        };
        match self.store.store(url, &entry) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("caching {url} failed: {err}");
                false
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired(Utc::now()).unwrap_or_else(|err| {
            log::warn!("cache purge failed: {err}");
            0
        })
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_200_and_404_are_cached() {
        let cache = ResponseCache::in_memory();
        assert!(cache.put("https://a/1", 200, BTreeMap::new(), "ok"));
        assert!(cache.put("https://a/2", 404, BTreeMap::new(), ""));
        assert!(!cache.put("https://a/3", 403, BTreeMap::new(), "challenge"));
        assert!(!cache.put("https://a/4", 503, BTreeMap::new(), "down"));

        assert_eq!(cache.get("https://a/1").unwrap().body, "ok");
        assert_eq!(cache.get("https://a/2").unwrap().status, 404);
        assert!(cache.get("https://a/3").is_none());
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = ResponseCache::in_memory().with_ttl(Duration::ZERO);
        assert!(!cache.put("https://a/1", 200, BTreeMap::new(), "ok"));
        assert!(cache.get("https://a/1").is_none());
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let store = Arc::new(MemoryCacheStore::new());
        let past = Utc::now() - chrono::Duration::minutes(1);
        store
            .store(
                "https://a/old",
                &CacheEntry {
                    status: 200,
                    headers: BTreeMap::new(),
                    body: "stale".into(),
                    stored_at: past - chrono::Duration::minutes(15),
                    expires_at: past,
                },
            )
            .unwrap();

        let cache = ResponseCache::new(store.clone());
        assert!(cache.get("https://a/old").is_none());
        assert!(store.load("https://a/old").unwrap().is_none());
    }

    struct BrokenStore;

    impl CacheStore for BrokenStore {
        fn load(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Backend("disk on fire".into()))
        }
        fn store(&self, _key: &str, _entry: &CacheEntry) -> Result<(), CacheError> {
            Err(CacheError::Backend("disk on fire".into()))
        }
        fn remove(&self, _key: &str) -> Result<(), CacheError> {
            Ok(())
        }
        fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, CacheError> {
            Err(CacheError::Backend("disk on fire".into()))
        }
    }

    #[test]
    fn backend_errors_degrade_to_miss() {
        let cache = ResponseCache::new(Arc::new(BrokenStore));
        assert!(cache.get("https://a/1").is_none());
        assert!(!cache.put("https://a/1", 200, BTreeMap::new(), "ok"));
        assert_eq!(cache.purge_expired(), 0);
    }
}
