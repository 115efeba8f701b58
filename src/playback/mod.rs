//! Playback backends.
//!
//! Two implementations share the [`PlaybackBackend`] interface:
//! - [`GaplessEngine`]: decodes whole tracks and crossfades on the audio clock
//! - [`ElementBackend`]: sequential element-style playback for mobile, with
//!   metadata-only preload and a user-gesture window
//!
//! The backend is chosen once at startup from [`Capabilities`].

pub mod decoder;
pub mod element;
pub mod gapless;
pub mod graph;
pub mod output;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{Platform, PlayerConfig};
use crate::error::{PlayerError, Result};
use crate::preload::AudioFetcher;
use crate::types::TrackSource;

pub use decoder::{decode, DecodedAudio};
pub use element::{ElementBackend, InteractionGate};
pub use gapless::{DeckState, GaplessEngine};
pub use graph::{AudioGraph, VoiceId};
pub use output::{GraphSource, NullOutput};

/// Graph shared between a backend and the output that renders it.
pub type SharedGraph = Arc<Mutex<AudioGraph>>;

/// Locks a shared graph, recovering from poisoning.
pub fn lock_graph(graph: &SharedGraph) -> MutexGuard<'_, AudioGraph> {
    graph.lock().unwrap_or_else(|e| e.into_inner())
}

/// Which backend implementation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Gapless,
    Element,
}

/// A next track loaded away from the backend.
#[derive(Debug)]
pub struct PreparedTrack {
    pub source_id: String,
    pub audio: PreparedAudio,
}

#[derive(Debug)]
pub enum PreparedAudio {
    /// Decoded at the graph's format.
    Decoded(Arc<DecodedAudio>),
    /// Raw bytes, decoded when played.
    Encoded { data: Bytes, hint: Option<String> },
}

/// Result of a play request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayOutcome {
    /// Audio is playing.
    Started,
    /// Held until the next user gesture.
    Deferred,
}

/// Something the owner of a backend must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The current track played to its end with no transition running.
    TrackEnded { source_id: String },
    /// A crossfade began.
    TransitionStarted { from: String, to: String },
    /// A crossfade finished and the next track is now current.
    TransitionComplete { source_id: String },
    /// A play call was deferred until the user interacts again.
    InteractionRequired,
}

/// Common interface of the playback implementations.
pub trait PlaybackBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Loads `source` and plays it from `start_at`.
    fn play(&mut self, source: TrackSource, start_at: Duration)
        -> BoxFuture<'_, Result<PlayOutcome>>;

    /// Fetches and decodes `source` for use as the next track. The future
    /// owns what it needs, so it can run without the backend borrowed.
    fn prepare_next(&self, source: TrackSource) -> BoxFuture<'static, Result<PreparedTrack>>;

    /// Installs a prepared next track. Returns false when one is already held.
    fn install_next(&mut self, prepared: PreparedTrack) -> bool;

    /// Readies the next track. Returns false when one is already held.
    fn preload_next(&mut self, source: TrackSource) -> BoxFuture<'_, Result<bool>> {
        if self.next_source_id().is_some() {
            return Box::pin(async { Ok(false) });
        }
        let prepare = self.prepare_next(source);
        Box::pin(async move {
            let prepared = prepare.await?;
            Ok(self.install_next(prepared))
        })
    }

    /// Id of the held next track, if any.
    fn next_source_id(&self) -> Option<String>;

    /// Starts a crossfade to the held next track. Returns false when no
    /// transition was started.
    fn transition_to_next(&mut self) -> bool;

    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
    fn seek(&mut self, position: Duration) -> Result<()>;
    fn set_volume(&mut self, volume: f32);

    /// Position within the current track.
    fn position(&self) -> Duration;

    /// Length of the current track.
    fn duration(&self) -> Option<Duration>;

    /// Id of the current track, if any.
    fn current_source_id(&self) -> Option<String>;

    fn is_paused(&self) -> bool;

    /// True while a crossfade is running.
    fn is_transitioning(&self) -> bool {
        false
    }

    /// Collects events produced since the last call.
    fn poll_events(&mut self) -> Vec<PlaybackEvent>;

    /// Notes a user gesture without running deferred work.
    fn note_interaction(&mut self) {}

    /// Records a user gesture, running any deferred play.
    fn record_interaction(&mut self) -> BoxFuture<'_, Result<Option<PlayOutcome>>> {
        Box::pin(async { Ok(None) })
    }

    /// Fraction of the current track played, in `0.0..=1.0`.
    fn progress(&self) -> f32 {
        match self.duration() {
            Some(total) if !total.is_zero() => {
                (self.position().as_secs_f32() / total.as_secs_f32()).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }
}

/// What the runtime environment supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub platform: Platform,
    /// Decoded-buffer playback with crossfades is reliable.
    pub gapless: bool,
    /// Blobs may be held in the memory tier.
    pub memory_cache: bool,
}

impl Capabilities {
    /// Detects capabilities from the configured platform.
    pub fn detect(config: &PlayerConfig) -> Self {
        let platform = config.platform.resolve();
        let desktop = platform == Platform::Desktop;
        Self {
            platform,
            gapless: desktop,
            memory_cache: config.memory_cache.unwrap_or(desktop),
        }
    }
}

/// Builds the backend matching `capabilities`.
pub fn select_backend(
    capabilities: &Capabilities,
    config: &PlayerConfig,
    graph: SharedGraph,
    fetcher: Arc<dyn AudioFetcher>,
) -> Box<dyn PlaybackBackend> {
    if capabilities.gapless {
        Box::new(GaplessEngine::new(graph, fetcher, config.crossfade()))
    } else {
        let gate = InteractionGate::new(config.interaction_window(capabilities.platform));
        Box::new(ElementBackend::new(graph, fetcher, gate))
    }
}

/// Stable id of a source: the cache id for cached blobs, else the URL.
pub fn source_id(source: &TrackSource) -> String {
    match source {
        TrackSource::Cached(handle) => handle.key_id.clone(),
        TrackSource::Remote(url) => url.clone(),
    }
}

/// Bytes of a source, fetching remote ones.
pub(crate) async fn source_bytes(
    fetcher: &dyn AudioFetcher,
    source: &TrackSource,
) -> Result<Bytes> {
    match source {
        TrackSource::Cached(handle) => Ok(handle.data.clone()),
        TrackSource::Remote(url) => fetcher.fetch(url, None, CancellationToken::new()).await,
    }
}

/// Decodes off the async runtime.
pub(crate) async fn decode_blocking(
    data: Bytes,
    hint: Option<String>,
    rate: u32,
    channels: u16,
) -> Result<DecodedAudio> {
    tokio::task::spawn_blocking(move || decode(data, hint.as_deref(), rate, channels))
        .await
        .map_err(|e| PlayerError::playback(format!("decode task failed: {}", e)))?
}

/// Fetches `source` and decodes it at the graph's format.
pub(crate) async fn load_decoded(
    fetcher: &dyn AudioFetcher,
    graph: &SharedGraph,
    source: &TrackSource,
) -> Result<DecodedAudio> {
    let data = source_bytes(fetcher, source).await?;
    let (rate, channels) = {
        let graph = lock_graph(graph);
        (graph.sample_rate(), graph.channels())
    };
    decode_blocking(data, source_hint(source), rate, channels).await
}

/// Decoder hint for a source.
pub(crate) fn source_hint(source: &TrackSource) -> Option<String> {
    let name = match source {
        TrackSource::Cached(_) => return None,
        TrackSource::Remote(url) => url.split('?').next().unwrap_or(url),
    };
    decoder::extension_hint(name).map(str::to_string)
}
