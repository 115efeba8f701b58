//! Two-tier audio blob cache.
//!
//! Provides byte-budgeted LRU caching in memory (behind revocable object
//! URLs) and on disk, combined by [`BlobCacheStore`].

pub mod memory;
pub mod object_url;
pub mod persistent;
pub mod store;

// Re-export commonly used types
pub use memory::MemoryCache;
pub use object_url::{is_object_url, ObjectUrl, UrlRegistry};
pub use persistent::{DiskStore, StoredEntry};
pub use store::{BlobCacheStore, BlobHandle, CacheStats, StoreSettings};
