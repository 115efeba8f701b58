//! Core types for the beatstream daemon.
//!
//! This module re-exports the data types shared by the cache, preloader and
//! player:
//! - [`Beat`]: read-only beat metadata from the beats API
//! - [`CacheKey`]: identity of one audio asset, independent of signed URLs
//! - [`PreloadTask`]: a beat queued for background download
//! - [`TrackSource`]: what a playback backend is asked to play

mod beat;
mod source;
mod task;

pub use beat::{compute_cache_id, Beat, CacheKey};
pub use source::TrackSource;
pub use task::{PreloadStatus, PreloadTask};
