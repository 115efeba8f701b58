//! Playable sources handed from the preloader to the playback backends.

use bytes::Bytes;

use crate::cache::BlobHandle;

/// Where a track's audio comes from.
#[derive(Debug, Clone)]
pub enum TrackSource {
    /// Bytes held by the blob cache.
    Cached(BlobHandle),
    /// A remote URL that still has to be fetched.
    Remote(String),
}

impl TrackSource {
    /// True when the bytes are already local.
    pub fn is_cached(&self) -> bool {
        matches!(self, TrackSource::Cached(_))
    }

    /// The object URL or remote URL, for logging and element playback.
    pub fn url(&self) -> Option<&str> {
        match self {
            TrackSource::Cached(handle) => handle.url.as_deref(),
            TrackSource::Remote(url) => Some(url),
        }
    }

    /// The cached bytes, if any.
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            TrackSource::Cached(handle) => Some(&handle.data),
            TrackSource::Remote(_) => None,
        }
    }
}
