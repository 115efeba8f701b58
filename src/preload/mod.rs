//! Preloading of beats into the blob cache.
//!
//! Resolves signed URLs, streams audio with progress, deduplicates
//! concurrent requests and runs bounded batches for upcoming tracks.

pub mod fetcher;
pub mod preloader;
pub mod queue;
pub mod signed_url;

// Re-export commonly used items
pub use fetcher::{AudioFetcher, HttpFetcher, ProbeOutcome, ProgressFn};
pub use preloader::{
    BatchOptions, BatchResult, PreloaderSettings, Preloader, PriorityFn, TaskCallback,
    UPCOMING_CONCURRENCY,
};
pub use queue::PreloadQueue;
pub use signed_url::{HttpSignedUrlProvider, SignedUrlProvider, UrlMemo};
