//! Cache storage backends.
//!
//! [`CacheStore`] is the seam between the executor and where entries live.
//! [`MemoryStore`] keeps entries in a bounded in-process LRU; the Redis
//! backend lives in `cache::redis`.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tracing::debug;

use super::clock::SharedClock;
use super::config::CacheConfig;
use super::entry::{CacheEntry, Freshness};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache entry could not be encoded: {0}")]
    Encoding(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of trying to become the only filler of a key across instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillLock {
    /// This caller should produce; the token (if any) releases the lock.
    Acquired(Option<String>),
    /// Another instance holds the lock.
    Contended,
}

#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Short backend name for logs and stats.
    fn name(&self) -> &'static str;

    /// Fetch a servable entry. Entries past `stale_until` are never returned.
    async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>>;

    /// Insert or replace an entry. Returns keys displaced to make room.
    async fn put(&self, entry: CacheEntry) -> StoreResult<Vec<String>>;

    /// Remove the given keys, returning how many existed.
    async fn remove(&self, keys: &[String]) -> StoreResult<usize>;

    /// Remove every key starting with `prefix`, returning the removed keys.
    async fn remove_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn clear(&self) -> StoreResult<()>;

    async fn acquire_fill_lock(&self, _key: &str, _lease: Duration) -> StoreResult<FillLock> {
        Ok(FillLock::Acquired(None))
    }

    async fn release_fill_lock(&self, _key: &str, _token: String) -> StoreResult<()> {
        Ok(())
    }
}

/// Bounded in-process store.
///
/// Expired entries are dropped lazily when read; capacity pressure evicts
/// the least recently used entry.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, CacheEntry>>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.memory_capacity_non_zero())),
            clock,
        }
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        let now = self.clock.now();
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.freshness(now) == Freshness::Expired,
        };
        if expired {
            entries.pop(key);
            debug!(cache = "memory", key, outcome = "expired", "Dropped expired entry");
            return Ok(None);
        }
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> StoreResult<Vec<String>> {
        let key = entry.key.clone();
        let displaced = rw_write(&self.entries, SOURCE, "put").push(key.clone(), entry);
        match displaced {
            Some((evicted, _)) if evicted != key => {
                debug!(cache = "memory", key = %evicted, outcome = "evicted", "Evicted entry at capacity");
                Ok(vec![evicted])
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn remove(&self, keys: &[String]) -> StoreResult<usize> {
        let mut entries = rw_write(&self.entries, SOURCE, "remove");
        Ok(keys
            .iter()
            .filter(|key| entries.pop(key.as_str()).is_some())
            .count())
    }

    async fn remove_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut entries = rw_write(&self.entries, SOURCE, "remove_prefix");
        let matching: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matching {
            entries.pop(key);
        }
        Ok(matching)
    }

    async fn clear(&self) -> StoreResult<()> {
        rw_write(&self.entries, SOURCE, "clear").clear();
        Ok(())
    }
}
