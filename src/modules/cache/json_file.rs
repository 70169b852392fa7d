//! JSON-file cache backend.
//!
//! The whole map lives in memory and is written through to a single JSON
//! document on every mutation, so entries survive a process restart.
//!
//! File I/O is synchronous and runs on the calling thread. Writers are
//! serialized among themselves; readers keep seeing the previous map until a
//! write has reached the disk, and never wait on the file.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{CacheEntry, CacheError, CacheStore};

#[derive(Debug)]
pub struct JsonFileCacheStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, CacheEntry>>,
    writer: Mutex<()>,
}

impl JsonFileCacheStore {
    /// Open the cache file at `path`, starting empty when it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        log::debug!("loaded {} cache entries from {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop entries stored more than `max_age` ago, whatever their expiry.
    pub fn purge_older_than(&self, max_age: Duration) -> Result<usize, CacheError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|err| CacheError::Backend(err.to_string()))?;
        let cutoff = Utc::now() - max_age;
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|_, entry| entry.stored_at >= cutoff);
            before - entries.len()
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` to a copy of the map, drop expired entries, and publish the copy
    /// only once it is on disk. A failed write leaves memory and file untouched.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, CacheEntry>) -> T,
    ) -> Result<T, CacheError> {
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut next = self.read().clone();
        let output = f(&mut next);
        let now = Utc::now();
        next.retain(|_, entry| !entry.is_expired(now));

        self.persist(&next)?;
        *self.write() = next;
        Ok(output)
    }

    fn persist(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }
}

impl CacheStore for JsonFileCacheStore {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.read().get(key).cloned())
    }

    fn store(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), entry.clone());
        })
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        if !self.read().contains_key(key) {
            return Ok(());
        }
        self.mutate(|entries| {
            entries.remove(key);
        })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let before = self.read().len();
        self.mutate(|entries| {
            entries.retain(|_, entry| !entry.is_expired(now));
        })?;
        Ok(before.saturating_sub(self.read().len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(stored_at: DateTime<Utc>, ttl_secs: i64) -> CacheEntry {
        CacheEntry {
            status: 200,
            headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
            body: "<html>ok</html>".into(),
            stored_at,
            expires_at: stored_at + chrono::Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("streams.json");

        let store = JsonFileCacheStore::open(&path).unwrap();
        store.store("https://example.com/a", &entry(Utc::now(), 900)).unwrap();
        drop(store);

        let reopened = JsonFileCacheStore::open(&path).unwrap();
        let loaded = reopened.load("https://example.com/a").unwrap().unwrap();
        assert_eq!(loaded.body, "<html>ok</html>");
        assert_eq!(loaded.headers["content-type"], "text/html");
    }

    #[test]
    fn purge_older_than_uses_store_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCacheStore::open(dir.path().join("c.json")).unwrap();
        let now = Utc::now();
        store.store("old", &entry(now - chrono::Duration::hours(2), 86_400)).unwrap();
        store.store("new", &entry(now, 86_400)).unwrap();

        assert_eq!(store.purge_older_than(Duration::from_secs(3600)).unwrap(), 1);
        assert!(store.load("old").unwrap().is_none());
        assert!(store.load("new").unwrap().is_some());

        let reopened = JsonFileCacheStore::open(store.path()).unwrap();
        assert!(reopened.load("old").unwrap().is_none());
    }

    #[test]
    fn writes_prune_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.json");
        let now = Utc::now();
        let seeded = BTreeMap::from([
            ("https://example.com/stale".to_string(), entry(now - chrono::Duration::hours(1), 60)),
            ("https://example.com/live".to_string(), entry(now, 900)),
        ]);
        fs::write(&path, serde_json::to_vec(&seeded).unwrap()).unwrap();

        let store = JsonFileCacheStore::open(&path).unwrap();
        store.store("https://example.com/new", &entry(now, 900)).unwrap();
        assert!(store.load("https://example.com/stale").unwrap().is_none());

        let on_disk: BTreeMap<String, CacheEntry> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let keys: Vec<&str> = on_disk.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["https://example.com/live", "https://example.com/new"]);
    }

    #[test]
    fn failed_write_keeps_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.json");
        let store = JsonFileCacheStore::open(&path).unwrap();
        store.store("https://example.com/a", &entry(Utc::now(), 900)).unwrap();

        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(store.store("https://example.com/b", &entry(Utc::now(), 900)).is_err());
        assert!(store.load("https://example.com/b").unwrap().is_none());
        assert!(store.load("https://example.com/a").unwrap().is_some());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(JsonFileCacheStore::open(&path), Err(CacheError::Serde(_))));
    }
}
