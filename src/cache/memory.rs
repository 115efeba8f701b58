//! Memory tier with LRU eviction by byte budget.
//!
//! Holds decoded-ready blobs behind revocable object URLs. Every entry that
//! leaves the tier takes its URL with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::debug;

use super::object_url::{ObjectUrl, UrlRegistry};
use crate::types::CacheKey;

/// In-memory blob cache bounded by total bytes.
pub struct MemoryCache {
    /// Entries indexed by opaque cache id.
    entries: HashMap<String, MemoryEntry>,
    /// Maximum total bytes to keep.
    budget_bytes: u64,
    /// Bytes currently held.
    total_bytes: u64,
    /// Monotonic recency clock; larger is more recent.
    clock: u64,
    /// Registry minting the entries' URLs.
    registry: Arc<UrlRegistry>,
}

/// A cached blob with its URL handle and access bookkeeping.
struct MemoryEntry {
    key: CacheKey,
    url: ObjectUrl,
    data: Bytes,
    size: u64,
    last_accessed: SystemTime,
    recency: u64,
}

/// Result of a memory-tier insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryInsert {
    /// URL of the inserted entry.
    pub url: String,
    /// Ids evicted to make room.
    pub evicted: Vec<String>,
}

impl MemoryCache {
    /// Creates a new cache with the given byte budget.
    pub fn new(budget_bytes: u64, registry: Arc<UrlRegistry>) -> Self {
        Self {
            entries: HashMap::new(),
            budget_bytes,
            total_bytes: 0,
            clock: 0,
            registry,
        }
    }

    /// Returns the URL and bytes for an id, marking it most recently used.
    pub fn get(&mut self, id: &str) -> Option<(String, Bytes)> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(id)?;
        entry.recency = stamp;
        entry.last_accessed = SystemTime::now();
        Some((entry.url.as_str().to_string(), entry.data.clone()))
    }

    /// Checks membership without touching recency.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Inserts a blob, evicting least recently used entries first.
    ///
    /// Returns None when the blob alone is larger than the whole budget; such
    /// blobs are never held in memory.
    pub fn insert(&mut self, key: &CacheKey, data: Bytes) -> Option<MemoryInsert> {
        let size = data.len() as u64;
        if size > self.budget_bytes {
            debug!(key = %key, size, budget = self.budget_bytes, "blob larger than memory budget");
            return None;
        }

        self.remove(key.id());

        let mut evicted = Vec::new();
        while self.total_bytes + size > self.budget_bytes {
            match self.evict_lru() {
                Some(id) => evicted.push(id),
                None => break,
            }
        }

        let url = self.registry.create(data.clone());
        let url_str = url.as_str().to_string();
        let recency = self.tick();
        self.total_bytes += size;
        self.entries.insert(
            key.id().to_string(),
            MemoryEntry {
                key: key.clone(),
                url,
                data,
                size,
                last_accessed: SystemTime::now(),
                recency,
            },
        );

        Some(MemoryInsert {
            url: url_str,
            evicted,
        })
    }

    /// Evicts the least recently used entry, revoking its URL.
    ///
    /// Returns the evicted id if any.
    pub fn evict_lru(&mut self) -> Option<String> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.recency)
            .map(|(id, _)| id.clone())?;

        if let Some(entry) = self.entries.remove(&oldest) {
            debug!(key = %entry.key, size = entry.size, "evicted from memory tier");
            self.release(entry);
        }
        Some(oldest)
    }

    /// Removes a specific entry, revoking its URL.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                self.release(entry);
                true
            }
            None => false,
        }
    }

    /// Removes every entry, revoking all URLs.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.url.revoke();
        }
        self.total_bytes = 0;
    }

    /// Ids with `last_accessed` before `cutoff`.
    pub fn idle_since(&self, cutoff: SystemTime) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.last_accessed < cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently held.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Configured byte budget.
    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    fn release(&mut self, entry: MemoryEntry) {
        self.total_bytes -= entry.size;
        entry.url.revoke();
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::new("u1", name)
    }

    fn blob(len: usize) -> Bytes {
        Bytes::from(vec![7u8; len])
    }

    #[test]
    fn new_cache_is_empty() {
        let cache = MemoryCache::new(100, UrlRegistry::new());
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn insert_and_get() {
        let registry = UrlRegistry::new();
        let mut cache = MemoryCache::new(100, Arc::clone(&registry));
        let k = key("a.mp3");
        let inserted = cache.insert(&k, blob(10)).unwrap();

        let (url, data) = cache.get(k.id()).unwrap();
        assert_eq!(url, inserted.url);
        assert_eq!(data.len(), 10);
        assert_eq!(registry.resolve(&url).unwrap().len(), 10);
    }

    #[test]
    fn lru_by_bytes_evicts_least_recent() {
        let registry = UrlRegistry::new();
        let mut cache = MemoryCache::new(10, Arc::clone(&registry));
        let (k1, k2, k3, k4) = (key("k1"), key("k2"), key("k3"), key("k4"));
        cache.insert(&k1, blob(4));
        cache.insert(&k2, blob(4));
        // k3 does not fit next to k1 and k2; k1 is the oldest.
        let third = cache.insert(&k3, blob(4)).unwrap();
        assert_eq!(third.evicted, vec![k1.id().to_string()]);

        // Touch k2 so k3 becomes the least recently used.
        cache.get(k2.id());
        let fourth = cache.insert(&k4, blob(4)).unwrap();
        assert_eq!(fourth.evicted, vec![k3.id().to_string()]);
        assert!(cache.contains(k2.id()));
        assert!(cache.contains(k4.id()));
        assert!(cache.total_bytes() <= 10);
        assert_eq!(registry.live_count(), cache.len());
    }

    #[test]
    fn oversized_blob_is_not_held() {
        let mut cache = MemoryCache::new(8, UrlRegistry::new());
        assert!(cache.insert(&key("big"), blob(9)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn replacing_entry_revokes_previous_url() {
        let registry = UrlRegistry::new();
        let mut cache = MemoryCache::new(100, Arc::clone(&registry));
        let k = key("a");
        let first = cache.insert(&k, blob(5)).unwrap();
        let second = cache.insert(&k, blob(6)).unwrap();
        assert!(registry.resolve(&first.url).is_none());
        assert!(registry.resolve(&second.url).is_some());
        assert_eq!(cache.total_bytes(), 6);
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn clear_revokes_all() {
        let registry = UrlRegistry::new();
        let mut cache = MemoryCache::new(100, Arc::clone(&registry));
        cache.insert(&key("a"), blob(1));
        cache.insert(&key("b"), blob(1));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn contains_does_not_bump_recency() {
        let mut cache = MemoryCache::new(8, UrlRegistry::new());
        let (a, b, c) = (key("a"), key("b"), key("c"));
        cache.insert(&a, blob(4));
        cache.insert(&b, blob(4));
        assert!(cache.contains(a.id()));
        let inserted = cache.insert(&c, blob(4)).unwrap();
        assert_eq!(inserted.evicted, vec![a.id().to_string()]);
    }
}
