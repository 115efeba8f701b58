//! Persistent blob tier on disk.
//!
//! One directory per schema generation holds a blob file per cache id and an
//! `index.json` of entry records. The index keeps a secondary ordering by
//! recency so LRU eviction never scans blob files.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PlayerError, Result};

/// Version of the on-disk layout. Bump when [`StoredEntry`] changes shape.
pub const SCHEMA_VERSION: u32 = 1;

const INDEX_FILE: &str = "index.json";
const BLOB_EXTENSION: &str = "blob";

/// Index record for one persisted blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Opaque cache id.
    pub id: String,
    /// Blob size in bytes.
    pub size: u64,
    /// Last read or write.
    #[serde(with = "system_time_millis")]
    pub last_accessed: SystemTime,
    /// When the blob was first written.
    #[serde(with = "system_time_millis")]
    pub timestamp: SystemTime,
    /// LRU stamp; larger is more recent.
    pub recency: u64,
    /// URL the blob was fetched from, for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<StoredEntry>,
}

/// Disk-backed LRU blob store bounded by total bytes.
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    budget_bytes: u64,
    total_bytes: u64,
    clock: u64,
    entries: HashMap<String, StoredEntry>,
    by_recency: BTreeMap<u64, String>,
}

impl DiskStore {
    /// Opens (or creates) the store under `root`.
    ///
    /// Older schema generations found under `root` are deleted. A corrupt
    /// index starts the generation over rather than failing.
    pub async fn open(root: &Path, budget_bytes: u64) -> Result<Self> {
        let dir = root.join(format!("v{}", SCHEMA_VERSION));
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            PlayerError::storage(format!("cannot create {}: {}", dir.display(), e))
        })?;
        discard_old_generations(root).await;

        let mut store = Self {
            dir,
            budget_bytes,
            total_bytes: 0,
            clock: 0,
            entries: HashMap::new(),
            by_recency: BTreeMap::new(),
        };

        for entry in store.read_index().await {
            if tokio::fs::try_exists(store.blob_path(&entry.id)).await.unwrap_or(false) {
                store.clock = store.clock.max(entry.recency);
                store.track(entry);
            }
        }

        // Budget may have shrunk since the index was written.
        let mut evicted = Vec::new();
        while store.total_bytes > store.budget_bytes {
            match store.evict_lru().await? {
                Some(id) => evicted.push(id),
                None => break,
            }
        }
        if !evicted.is_empty() {
            store.save_index().await?;
        }

        info!(
            dir = %store.dir.display(),
            entries = store.entries.len(),
            bytes = store.total_bytes,
            "persistent audio cache opened"
        );
        Ok(store)
    }

    /// Reads a blob, marking it most recently used.
    pub async fn get(&mut self, id: &str) -> Result<Option<Bytes>> {
        if !self.entries.contains_key(id) {
            return Ok(None);
        }

        let data = match tokio::fs::read(self.blob_path(id)).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!(id, error = %e, "blob file unreadable, dropping entry");
                self.untrack(id);
                self.save_index().await?;
                return Ok(None);
            }
        };

        let stamp = self.tick();
        if let Some(mut entry) = self.untrack(id) {
            entry.recency = stamp;
            entry.last_accessed = SystemTime::now();
            self.track(entry);
        }
        self.save_index().await?;
        Ok(Some(data))
    }

    /// Checks membership without touching recency.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Writes a blob, evicting least recently used entries first.
    ///
    /// Returns the ids evicted to make room. Fails with QUOTA_EXCEEDED when
    /// the blob alone exceeds the budget.
    pub async fn put(
        &mut self,
        id: &str,
        data: &Bytes,
        source_url: Option<&str>,
    ) -> Result<Vec<String>> {
        let size = data.len() as u64;
        if size > self.budget_bytes {
            return Err(PlayerError::quota_exceeded(size, self.budget_bytes));
        }

        let previous = self.untrack(id);

        let mut evicted = Vec::new();
        while self.total_bytes + size > self.budget_bytes {
            match self.evict_lru().await? {
                Some(evicted_id) => evicted.push(evicted_id),
                None => break,
            }
        }

        let path = self.blob_path(id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let now = SystemTime::now();
        let recency = self.tick();
        self.track(StoredEntry {
            id: id.to_string(),
            size,
            last_accessed: now,
            timestamp: previous.map(|p| p.timestamp).unwrap_or(now),
            recency,
            source_url: source_url.map(str::to_string),
        });
        self.save_index().await?;

        debug!(id, size, evicted = evicted.len(), "blob persisted");
        Ok(evicted)
    }

    /// Evicts the least recently used entry.
    ///
    /// The index is not saved; callers save once after a batch of changes.
    pub async fn evict_lru(&mut self) -> Result<Option<String>> {
        let Some((_, id)) = self.by_recency.iter().next().map(|(r, id)| (*r, id.clone())) else {
            return Ok(None);
        };
        self.delete(&id).await?;
        debug!(id, "evicted from persistent tier");
        Ok(Some(id))
    }

    /// Removes one entry.
    pub async fn remove(&mut self, id: &str) -> Result<bool> {
        if !self.entries.contains_key(id) {
            return Ok(false);
        }
        self.delete(id).await?;
        self.save_index().await?;
        Ok(true)
    }

    /// Removes every entry.
    pub async fn clear(&mut self) -> Result<()> {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            self.delete(&id).await?;
        }
        self.save_index().await
    }

    /// Removes entries whose `last_accessed` is before `cutoff`.
    ///
    /// Returns the removed ids.
    pub async fn sweep_older_than(&mut self, cutoff: SystemTime) -> Result<Vec<String>> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.last_accessed < cutoff)
            .map(|e| e.id.clone())
            .collect();

        for id in &expired {
            self.delete(id).await?;
        }
        if !expired.is_empty() {
            self.save_index().await?;
        }
        Ok(expired)
    }

    /// Returns the record for an id.
    pub fn entry(&self, id: &str) -> Option<&StoredEntry> {
        self.entries.get(id)
    }

    /// Number of persisted blobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is persisted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently persisted.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Configured byte budget.
    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Generation directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn delete(&mut self, id: &str) -> Result<()> {
        self.untrack(id);
        match tokio::fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn track(&mut self, entry: StoredEntry) {
        self.total_bytes += entry.size;
        self.by_recency.insert(entry.recency, entry.id.clone());
        self.entries.insert(entry.id.clone(), entry);
    }

    fn untrack(&mut self, id: &str) -> Option<StoredEntry> {
        let entry = self.entries.remove(id)?;
        self.by_recency.remove(&entry.recency);
        self.total_bytes -= entry.size;
        Some(entry)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, BLOB_EXTENSION))
    }

    async fn read_index(&self) -> Vec<StoredEntry> {
        let path = self.dir.join(INDEX_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_slice::<IndexFile>(&raw) {
            Ok(index) if index.version == SCHEMA_VERSION => index.entries,
            Ok(index) => {
                warn!(
                    found = index.version,
                    expected = SCHEMA_VERSION,
                    "index version mismatch, starting empty"
                );
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "corrupt cache index, starting empty");
                Vec::new()
            }
        }
    }

    async fn save_index(&self) -> Result<()> {
        let mut entries: Vec<StoredEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.recency);
        let index = IndexFile {
            version: SCHEMA_VERSION,
            entries,
        };
        let json = serde_json::to_vec(&index)
            .map_err(|e| PlayerError::storage(format!("cannot encode index: {}", e)))?;
        let path = self.dir.join(INDEX_FILE);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Deletes `v{n}` directories other than the current schema generation.
async fn discard_old_generations(root: &Path) {
    let current = format!("v{}", SCHEMA_VERSION);
    let Ok(mut dir) = tokio::fs::read_dir(root).await else {
        return;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_generation = name.len() > 1
            && name.starts_with('v')
            && name[1..].chars().all(|c| c.is_ascii_digit());
        if is_generation && name != current {
            info!(generation = %name, "removing outdated cache generation");
            if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                warn!(generation = %name, error = %e, "could not remove outdated generation");
            }
        }
    }
}

/// Serde for SystemTime as Unix milliseconds.
mod system_time_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let duration = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}
