//! beatstream-daemon: audio caching and gapless playback for streamed beats.
//!
//! Beats are streamed from object storage through signed URLs. This crate
//! keeps them in a two-tier blob cache, preloads upcoming tracks and plays
//! them back gaplessly, recovering from the usual streaming failures.
//!
//! # Modules
//!
//! - [`types`]: Beat metadata, cache keys, preload tasks, track sources
//! - [`config`]: Runtime configuration (PlayerConfig, Platform)
//! - [`error`]: Error types and codes (PlayerError, ErrorCode)
//! - [`cache`]: Memory and persistent blob tiers behind [`cache::BlobCacheStore`]
//! - [`preload`]: Signed URLs, streamed fetches and the deduplicating preloader
//! - [`playback`]: Decoder, audio graph and the two playback backends
//! - [`recovery`]: Error classification, strategies and stall detection
//! - [`player`]: The composition root driving a playlist
//! - [`rpc`]: JSON-RPC 2.0 daemon surface over stdio
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//! use beatstream_daemon::{
//!     config::PlayerConfig,
//!     playback::AudioGraph,
//!     player::Player,
//!     types::Beat,
//! };
//!
//! let config = PlayerConfig::from_env();
//! let graph = Arc::new(Mutex::new(AudioGraph::new(config.sample_rate, config.channels)));
//! let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let player = Player::with_http(config, graph, events);
//! player.init().await;
//!
//! let beats = vec![Beat::new("1", "42", "night-drive.mp3", "Night Drive")];
//! player.load_playlist(beats, Some(0)).await?;
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod playback;
pub mod player;
pub mod preload;
pub mod recovery;
pub mod rpc;
pub mod types;

// Re-export commonly used types at crate root for convenience
pub use config::{Platform, PlayerConfig};
pub use error::{ErrorCode, PlayerError, Result};
pub use player::{Player, PlayerEvent};
pub use types::{compute_cache_id, Beat, CacheKey, TrackSource};
