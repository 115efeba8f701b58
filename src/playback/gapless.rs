//! Gapless playback engine.
//!
//! Decodes whole tracks into buffers and plays them through per-track gain
//! nodes in the audio graph. One next track can be held decoded and muted;
//! a transition crossfades into it with complementary linear ramps on the
//! audio clock. Transitions are serialized by [`DeckState`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use super::{
    load_decoded, lock_graph, source_id, BackendKind, DecodedAudio, PlayOutcome,
    PlaybackBackend, PlaybackEvent, PreparedAudio, PreparedTrack, SharedGraph, VoiceId,
};
use crate::error::{PlayerError, Result};
use crate::preload::AudioFetcher;
use crate::types::TrackSource;

/// Engine state. Exactly one of these holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeckState {
    /// Nothing loaded, or the last track ended.
    Idle,
    /// Fetching and decoding the current track.
    Loading,
    /// The current track is playing.
    Playing,
    /// Crossfading into the next track until the clock reaches `until`.
    Transitioning { until: u64 },
}

/// A decoded track attached to the graph.
#[derive(Debug)]
struct Deck {
    source_id: String,
    audio: Arc<DecodedAudio>,
    voice: VoiceId,
}

/// Decoded-buffer backend with crossfaded transitions.
pub struct GaplessEngine {
    graph: SharedGraph,
    fetcher: Arc<dyn AudioFetcher>,
    crossfade: Duration,
    state: DeckState,
    current: Option<Deck>,
    next: Option<Deck>,
    ended_reported: bool,
    events: Vec<PlaybackEvent>,
    decodes: Arc<AtomicUsize>,
}

impl GaplessEngine {
    pub fn new(graph: SharedGraph, fetcher: Arc<dyn AudioFetcher>, crossfade: Duration) -> Self {
        Self {
            graph,
            fetcher,
            crossfade,
            state: DeckState::Idle,
            current: None,
            next: None,
            ended_reported: false,
            events: Vec::new(),
            decodes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> DeckState {
        self.state
    }

    /// Number of tracks decoded so far.
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    async fn load(&self, source: &TrackSource) -> Result<Arc<DecodedAudio>> {
        let audio = load_decoded(self.fetcher.as_ref(), &self.graph, source).await?;
        self.decodes.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(audio))
    }

    async fn play_inner(&mut self, source: TrackSource, start_at: Duration) -> Result<PlayOutcome> {
        let id = source_id(&source);
        self.drop_current();
        self.state = DeckState::Loading;

        let deck = match self.next.take() {
            Some(next) if next.source_id == id => {
                debug!(source = %id, "playing held next track");
                next
            }
            held => {
                if let Some(stale) = held {
                    lock_graph(&self.graph).stop(stale.voice);
                }
                let audio = match self.load(&source).await {
                    Ok(audio) => audio,
                    Err(e) => {
                        self.state = DeckState::Idle;
                        return Err(e);
                    }
                };
                let voice = lock_graph(&self.graph).add_voice(Arc::clone(&audio), 1.0);
                Deck {
                    source_id: id,
                    audio,
                    voice,
                }
            }
        };

        {
            let mut graph = lock_graph(&self.graph);
            graph.resume();
            graph.set_gain(deck.voice, 1.0);
            graph.start(deck.voice, start_at);
        }
        info!(source = %deck.source_id, duration = ?deck.audio.duration(), "playback started");
        self.current = Some(deck);
        self.ended_reported = false;
        self.state = DeckState::Playing;
        Ok(PlayOutcome::Started)
    }

    fn drop_current(&mut self) {
        if let Some(current) = self.current.take() {
            lock_graph(&self.graph).stop(current.voice);
        }
    }

    fn finish_transition(&mut self) {
        let Some(next) = self.next.take() else {
            self.state = DeckState::Idle;
            return;
        };
        let ended = {
            let mut graph = lock_graph(&self.graph);
            if let Some(old) = self.current.take() {
                graph.stop(old.voice);
            }
            graph.set_gain(next.voice, 1.0);
            graph.has_ended(next.voice)
        };
        info!(source = %next.source_id, "transition complete");
        self.events.push(PlaybackEvent::TransitionComplete {
            source_id: next.source_id.clone(),
        });
        self.current = Some(next);
        self.ended_reported = false;
        self.state = DeckState::Playing;
        if ended {
            self.report_ended();
        }
    }

    fn report_ended(&mut self) {
        if self.ended_reported {
            return;
        }
        let Some(current) = self.current.as_ref() else {
            return;
        };
        self.ended_reported = true;
        self.state = DeckState::Idle;
        info!(source = %current.source_id, "track ended");
        self.events.push(PlaybackEvent::TrackEnded {
            source_id: current.source_id.clone(),
        });
    }
}

impl PlaybackBackend for GaplessEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Gapless
    }

    fn play(
        &mut self,
        source: TrackSource,
        start_at: Duration,
    ) -> BoxFuture<'_, Result<PlayOutcome>> {
        Box::pin(self.play_inner(source, start_at))
    }

    fn prepare_next(&self, source: TrackSource) -> BoxFuture<'static, Result<PreparedTrack>> {
        let fetcher = Arc::clone(&self.fetcher);
        let graph = Arc::clone(&self.graph);
        let decodes = Arc::clone(&self.decodes);
        Box::pin(async move {
            let audio = load_decoded(fetcher.as_ref(), &graph, &source).await?;
            decodes.fetch_add(1, Ordering::Relaxed);
            Ok(PreparedTrack {
                source_id: source_id(&source),
                audio: PreparedAudio::Decoded(Arc::new(audio)),
            })
        })
    }

    fn install_next(&mut self, prepared: PreparedTrack) -> bool {
        if self.next.is_some() {
            return false;
        }
        let PreparedAudio::Decoded(audio) = prepared.audio else {
            warn!(source = %prepared.source_id, "next track was not decoded");
            return false;
        };
        let voice = lock_graph(&self.graph).add_voice(Arc::clone(&audio), 0.0);
        debug!(source = %prepared.source_id, "next track decoded");
        self.next = Some(Deck {
            source_id: prepared.source_id,
            audio,
            voice,
        });
        true
    }

    fn next_source_id(&self) -> Option<String> {
        self.next.as_ref().map(|d| d.source_id.clone())
    }

    fn transition_to_next(&mut self) -> bool {
        if matches!(self.state, DeckState::Transitioning { .. }) {
            debug!("transition already running");
            return false;
        }
        let (Some(current), Some(next)) = (self.current.as_ref(), self.next.as_ref()) else {
            return false;
        };
        if self.state != DeckState::Playing {
            return false;
        }

        let until = {
            let mut graph = lock_graph(&self.graph);
            graph.ramp_gain(current.voice, 0.0, self.crossfade);
            graph.set_gain(next.voice, 0.0);
            graph.start(next.voice, Duration::ZERO);
            graph.ramp_gain(next.voice, 1.0, self.crossfade);
            graph.clock() + graph.duration_to_frames(self.crossfade).max(1)
        };
        info!(from = %current.source_id, to = %next.source_id, "crossfade started");
        self.events.push(PlaybackEvent::TransitionStarted {
            from: current.source_id.clone(),
            to: next.source_id.clone(),
        });
        self.state = DeckState::Transitioning { until };
        true
    }

    fn pause(&mut self) {
        lock_graph(&self.graph).suspend();
    }

    fn resume(&mut self) {
        lock_graph(&self.graph).resume();
    }

    fn stop(&mut self) {
        {
            let mut graph = lock_graph(&self.graph);
            for deck in self.current.take().into_iter().chain(self.next.take()) {
                graph.stop(deck.voice);
            }
        }
        self.state = DeckState::Idle;
        self.ended_reported = false;
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        if self.state != DeckState::Playing {
            return Err(PlayerError::invalid_state(format!(
                "cannot seek while {:?}",
                self.state
            )));
        }
        let Some(current) = self.current.as_ref() else {
            return Err(PlayerError::invalid_state("nothing is playing"));
        };
        lock_graph(&self.graph).seek(current.voice, position.min(current.audio.duration()));
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        lock_graph(&self.graph).set_master_gain(volume.clamp(0.0, 1.0));
    }

    fn position(&self) -> Duration {
        self.current
            .as_ref()
            .and_then(|d| lock_graph(&self.graph).position(d.voice))
            .unwrap_or_default()
    }

    fn duration(&self) -> Option<Duration> {
        self.current.as_ref().map(|d| d.audio.duration())
    }

    fn current_source_id(&self) -> Option<String> {
        self.current.as_ref().map(|d| d.source_id.clone())
    }

    fn is_paused(&self) -> bool {
        lock_graph(&self.graph).is_suspended()
    }

    fn is_transitioning(&self) -> bool {
        matches!(self.state, DeckState::Transitioning { .. })
    }

    fn poll_events(&mut self) -> Vec<PlaybackEvent> {
        let (clock, ended) = {
            let mut graph = lock_graph(&self.graph);
            (graph.clock(), graph.take_ended())
        };

        if let DeckState::Transitioning { until } = self.state {
            if clock >= until {
                self.finish_transition();
            }
        }

        let current_ended = self
            .current
            .as_ref()
            .is_some_and(|d| ended.contains(&d.voice));
        if current_ended && self.state == DeckState::Playing {
            self.report_ended();
        }

        std::mem::take(&mut self.events)
    }
}
