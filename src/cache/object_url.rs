//! Revocable object URLs for in-memory blobs.
//!
//! An [`ObjectUrl`] is a `blob:` style handle that resolves to cached bytes
//! until it is revoked. Dropping the handle revokes it, so a memory entry
//! that is evicted can never leave a live URL behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

/// URL scheme prefix for minted handles.
pub const OBJECT_URL_PREFIX: &str = "blob:beatstream/";

/// Registry of live object URLs.
#[derive(Debug, Default)]
pub struct UrlRegistry {
    urls: Mutex<HashMap<String, Bytes>>,
}

impl UrlRegistry {
    /// Creates an empty, shareable registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mints a new URL resolving to `data`.
    pub fn create(self: &Arc<Self>, data: Bytes) -> ObjectUrl {
        let url = format!("{}{}", OBJECT_URL_PREFIX, uuid::Uuid::new_v4());
        self.lock().insert(url.clone(), data);
        ObjectUrl {
            url,
            registry: Arc::clone(self),
        }
    }

    /// Returns the bytes behind a live URL.
    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        self.lock().get(url).cloned()
    }

    /// Number of URLs that have not been revoked.
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    fn revoke(&self, url: &str) -> bool {
        self.lock().remove(url).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        // A poisoned map is still structurally valid.
        self.urls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An owned, revocable URL handle.
#[derive(Debug)]
pub struct ObjectUrl {
    url: String,
    registry: Arc<UrlRegistry>,
}

impl ObjectUrl {
    /// The URL string.
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Revokes the URL now.
    pub fn revoke(self) {
        drop(self);
    }
}

impl Drop for ObjectUrl {
    fn drop(&mut self) {
        self.registry.revoke(&self.url);
    }
}

/// Returns true if `url` looks like a handle minted by a [`UrlRegistry`].
pub fn is_object_url(url: &str) -> bool {
    url.starts_with(OBJECT_URL_PREFIX)
}
