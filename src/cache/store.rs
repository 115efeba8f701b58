//! Two-tier blob cache store.
//!
//! Combines the memory tier (revocable URLs, LRU by bytes) with the
//! persistent tier (disk, LRU by bytes). The tiers keep independent budgets
//! and recency clocks. If the persistent tier cannot be opened the store
//! runs memory-only without surfacing an error.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::memory::MemoryCache;
use super::object_url::UrlRegistry;
use super::persistent::DiskStore;
use crate::config::PlayerConfig;
use crate::error::ErrorCode;
use crate::types::CacheKey;

/// A cached blob handed to callers.
#[derive(Debug, Clone)]
pub struct BlobHandle {
    /// Opaque cache id.
    pub key_id: String,
    /// Object URL, when the memory tier holds the blob.
    pub url: Option<String>,
    /// The audio bytes.
    pub data: Bytes,
}

/// Snapshot of cache occupancy and counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub memory_budget_bytes: u64,
    pub persistent_entries: usize,
    pub persistent_bytes: u64,
    pub persistent_budget_bytes: u64,
    pub live_urls: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_only: bool,
}

/// Tier settings for a [`BlobCacheStore`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub memory_budget_bytes: u64,
    pub persistent_budget_bytes: u64,
    pub max_age: Duration,
    pub root: PathBuf,
    pub memory_enabled: bool,
}

impl StoreSettings {
    /// Builds settings from the player configuration.
    pub fn from_config(config: &PlayerConfig, memory_enabled: bool) -> Self {
        Self {
            memory_budget_bytes: config.memory_budget_bytes,
            persistent_budget_bytes: config.persistent_budget_bytes,
            max_age: config.max_age(),
            root: config.effective_cache_path(),
            memory_enabled,
        }
    }
}

/// Process-wide blob cache, shared by reference between preloader and player.
pub struct BlobCacheStore {
    settings: StoreSettings,
    registry: Arc<UrlRegistry>,
    memory: Mutex<MemoryCache>,
    persistent: tokio::sync::Mutex<Option<DiskStore>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BlobCacheStore {
    /// Creates a store. The persistent tier stays closed until [`init`](Self::init).
    pub fn new(settings: StoreSettings) -> Self {
        let registry = UrlRegistry::new();
        let memory = MemoryCache::new(settings.memory_budget_bytes, Arc::clone(&registry));
        Self {
            settings,
            registry,
            memory: Mutex::new(memory),
            persistent: tokio::sync::Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Opens the persistent tier. Failure degrades to memory-only mode.
    pub async fn init(&self) {
        let mut persistent = self.persistent.lock().await;
        if persistent.is_some() {
            return;
        }
        match DiskStore::open(&self.settings.root, self.settings.persistent_budget_bytes).await {
            Ok(store) => *persistent = Some(store),
            Err(e) => warn!(error = %e, "persistent cache unavailable, running memory-only"),
        }
    }

    /// Releases every URL and closes the persistent tier.
    pub async fn dispose(&self) {
        self.lock_memory().clear();
        self.persistent.lock().await.take();
        info!("blob cache disposed");
    }

    /// Looks a blob up, memory tier first, promoting persistent hits.
    pub async fn get(&self, key: &CacheKey) -> Option<BlobHandle> {
        if self.settings.memory_enabled {
            if let Some((url, data)) = self.lock_memory().get(key.id()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(BlobHandle {
                    key_id: key.id().to_string(),
                    url: Some(url),
                    data,
                });
            }
        }

        let data = {
            let mut persistent = self.persistent.lock().await;
            match persistent.as_mut() {
                Some(store) => match store.get(key.id()).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(key = %key, error = %e, "persistent read failed");
                        None
                    }
                },
                None => None,
            }
        };

        let Some(data) = data else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "promoting persistent hit into memory");
        let url = self.insert_memory(key, data.clone());
        Some(BlobHandle {
            key_id: key.id().to_string(),
            url,
            data,
        })
    }

    /// Stores a blob in both tiers and returns a handle to it.
    ///
    /// Storage failures are logged; the handle is still returned so playback
    /// can proceed from memory.
    pub async fn put(&self, key: &CacheKey, data: Bytes, source_url: Option<&str>) -> BlobHandle {
        {
            let mut persistent = self.persistent.lock().await;
            if let Some(store) = persistent.as_mut() {
                match store.put(key.id(), &data, source_url).await {
                    Ok(evicted) => {
                        self.evictions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
                    }
                    Err(e) if e.code == ErrorCode::QuotaExceeded => {
                        warn!(key = %key, error = %e, "blob not persisted");
                    }
                    Err(e) => warn!(key = %key, error = %e, "persistent write failed"),
                }
            }
        }

        let url = self.insert_memory(key, data.clone());
        BlobHandle {
            key_id: key.id().to_string(),
            url,
            data,
        }
    }

    /// Membership check in either tier. Does not touch recency.
    pub async fn has(&self, key: &CacheKey) -> bool {
        if self.settings.memory_enabled && self.lock_memory().contains(key.id()) {
            return true;
        }
        self.persistent
            .lock()
            .await
            .as_ref()
            .map(|store| store.contains(key.id()))
            .unwrap_or(false)
    }

    /// Removes a blob from both tiers.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let in_memory = self.lock_memory().remove(key.id());
        let mut persistent = self.persistent.lock().await;
        let on_disk = match persistent.as_mut() {
            Some(store) => store.remove(key.id()).await.unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "persistent remove failed");
                false
            }),
            None => false,
        };
        in_memory || on_disk
    }

    /// Revokes every URL and empties the persistent tier.
    pub async fn clear(&self) {
        self.lock_memory().clear();
        if let Some(store) = self.persistent.lock().await.as_mut() {
            if let Err(e) = store.clear().await {
                warn!(error = %e, "persistent clear failed");
            }
        }
        info!("blob cache cleared");
    }

    /// Removes entries not accessed within the configured max age.
    ///
    /// Never runs on its own; callers schedule it. Returns the number of
    /// entries removed across both tiers.
    pub async fn sweep_expired(&self) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(self.settings.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.sweep_expired_before(cutoff).await
    }

    /// Removes entries whose last access is before `cutoff`.
    pub async fn sweep_expired_before(&self, cutoff: SystemTime) -> usize {
        let memory_removed = {
            let mut memory = self.lock_memory();
            let idle = memory.idle_since(cutoff);
            idle.iter().filter(|id| memory.remove(id)).count()
        };

        let persistent_removed = match self.persistent.lock().await.as_mut() {
            Some(store) => match store.sweep_older_than(cutoff).await {
                Ok(removed) => removed.len(),
                Err(e) => {
                    warn!(error = %e, "expiry sweep failed");
                    0
                }
            },
            None => 0,
        };

        let total = memory_removed + persistent_removed;
        if total > 0 {
            info!(
                memory = memory_removed,
                persistent = persistent_removed,
                "expired cache entries removed"
            );
        }
        total
    }

    /// Resolves a live object URL to its bytes.
    pub fn resolve_url(&self, url: &str) -> Option<Bytes> {
        self.registry.resolve(url)
    }

    /// True when the persistent tier is closed or failed to open.
    pub async fn is_memory_only(&self) -> bool {
        self.persistent.lock().await.is_none()
    }

    /// True when blobs are also held in memory.
    pub fn memory_enabled(&self) -> bool {
        self.settings.memory_enabled
    }

    /// Current occupancy and counters.
    pub async fn stats(&self) -> CacheStats {
        let (memory_entries, memory_bytes) = {
            let memory = self.lock_memory();
            (memory.len(), memory.total_bytes())
        };
        let persistent = self.persistent.lock().await;
        CacheStats {
            memory_entries,
            memory_bytes,
            memory_budget_bytes: self.settings.memory_budget_bytes,
            persistent_entries: persistent.as_ref().map(|s| s.len()).unwrap_or(0),
            persistent_bytes: persistent.as_ref().map(|s| s.total_bytes()).unwrap_or(0),
            persistent_budget_bytes: self.settings.persistent_budget_bytes,
            live_urls: self.registry.live_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            memory_only: persistent.is_none(),
        }
    }

    fn insert_memory(&self, key: &CacheKey, data: Bytes) -> Option<String> {
        if !self.settings.memory_enabled {
            return None;
        }
        let inserted = self.lock_memory().insert(key, data)?;
        self.evictions
            .fetch_add(inserted.evicted.len() as u64, Ordering::Relaxed);
        Some(inserted.url)
    }

    fn lock_memory(&self) -> MutexGuard<'_, MemoryCache> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings(
        root: PathBuf,
        memory: u64,
        persistent: u64,
        memory_enabled: bool,
    ) -> StoreSettings {
        StoreSettings {
            memory_budget_bytes: memory,
            persistent_budget_bytes: persistent,
            max_age: Duration::from_secs(7 * 24 * 3600),
            root,
            memory_enabled,
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new("user-1", name)
    }

    #[tokio::test]
    async fn put_then_get_returns_same_bytes() {
        let dir = tempdir().unwrap();
        let store = BlobCacheStore::new(settings(dir.path().to_path_buf(), 1024, 4096, true));
        store.init().await;

        let data = Bytes::from((0..=255u8).collect::<Vec<_>>());
        let put = store.put(&key("a.mp3"), data.clone(), Some("https://signed")).await;
        assert!(put.url.is_some());

        let got = store.get(&key("a.mp3")).await.unwrap();
        assert_eq!(got.data, data);
        assert_eq!(store.resolve_url(got.url.as_deref().unwrap()).unwrap(), data);
    }

    #[tokio::test]
    async fn persistent_hit_is_promoted_to_memory() {
        let dir = tempdir().unwrap();
        let store = BlobCacheStore::new(settings(dir.path().to_path_buf(), 8, 64, true));
        store.init().await;

        store.put(&key("a"), Bytes::from(vec![1; 8]), None).await;
        // Pushes "a" out of memory, not off disk.
        store.put(&key("b"), Bytes::from(vec![2; 8]), None).await;
        assert_eq!(store.stats().await.memory_entries, 1);

        let got = store.get(&key("a")).await.unwrap();
        assert!(got.url.is_some());
        let stats = store.stats().await;
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.persistent_entries, 2);
        assert_eq!(stats.live_urls, 1);
    }

    #[tokio::test]
    async fn budgets_hold_after_each_put() {
        let dir = tempdir().unwrap();
        let store = BlobCacheStore::new(settings(dir.path().to_path_buf(), 10, 20, true));
        store.init().await;

        for (i, size) in [4usize, 6, 3, 8, 10, 1, 7].iter().enumerate() {
            store
                .put(&key(&format!("k{}", i)), Bytes::from(vec![0; *size]), None)
                .await;
            let stats = store.stats().await;
            assert!(stats.memory_bytes <= 10);
            assert!(stats.persistent_bytes <= 20);
            assert_eq!(stats.live_urls, stats.memory_entries);
        }
    }

    #[tokio::test]
    async fn has_does_not_change_recency() {
        let dir = tempdir().unwrap();
        let store = BlobCacheStore::new(settings(dir.path().to_path_buf(), 8, 8, true));
        store.init().await;

        store.put(&key("a"), Bytes::from(vec![0; 4]), None).await;
        store.put(&key("b"), Bytes::from(vec![0; 4]), None).await;
        assert!(store.has(&key("a")).await);
        store.put(&key("c"), Bytes::from(vec![0; 4]), None).await;

        assert!(!store.has(&key("a")).await);
        assert!(store.has(&key("b")).await);
    }

    #[tokio::test]
    async fn memory_disabled_variant_returns_bare_handles() {
        let dir = tempdir().unwrap();
        let store = BlobCacheStore::new(settings(dir.path().to_path_buf(), 64, 64, false));
        store.init().await;

        let handle = store.put(&key("a"), Bytes::from_static(b"abc"), None).await;
        assert!(handle.url.is_none());
        let got = store.get(&key("a")).await.unwrap();
        assert!(got.url.is_none());
        assert_eq!(got.data, Bytes::from_static(b"abc"));
        assert_eq!(store.stats().await.live_urls, 0);
    }

    #[tokio::test]
    async fn unavailable_storage_degrades_to_memory_only() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file in the way").unwrap();

        let store = BlobCacheStore::new(settings(blocker, 64, 64, true));
        store.init().await;
        assert!(store.is_memory_only().await);

        let handle = store.put(&key("a"), Bytes::from_static(b"xyz"), None).await;
        assert!(handle.url.is_some());
        assert!(store.get(&key("a")).await.is_some());
        assert!(store.get(&key("missing")).await.is_none());
    }

    #[tokio::test]
    async fn clear_revokes_and_empties() {
        let dir = tempdir().unwrap();
        let store = BlobCacheStore::new(settings(dir.path().to_path_buf(), 64, 64, true));
        store.init().await;
        let handle = store.put(&key("a"), Bytes::from_static(b"abc"), None).await;

        store.clear().await;
        assert!(store.resolve_url(handle.url.as_deref().unwrap()).is_none());
        assert!(store.get(&key("a")).await.is_none());
        let stats = store.stats().await;
        assert_eq!(stats.persistent_entries, 0);
        assert_eq!(stats.live_urls, 0);
    }

    #[tokio::test]
    async fn sweep_is_explicit_and_uses_last_access() {
        let dir = tempdir().unwrap();
        let store = BlobCacheStore::new(settings(dir.path().to_path_buf(), 64, 64, true));
        store.init().await;
        store.put(&key("a"), Bytes::from_static(b"abc"), None).await;

        assert_eq!(store.sweep_expired().await, 0);
        let removed = store
            .sweep_expired_before(SystemTime::now() + Duration::from_secs(1))
            .await;
        assert_eq!(removed, 2);
        assert!(!store.has(&key("a")).await);
    }
}
