//! Element-style playback for constrained hosts.
//!
//! Behaves like a bare media element: nothing is decoded until play, the
//! next track is held as raw bytes only, and tracks follow each other
//! without overlap. Play calls are only honoured shortly after a user
//! gesture; anything else is deferred until the next gesture.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use super::{
    decode_blocking, lock_graph, source_bytes, source_hint, source_id, BackendKind,
    DecodedAudio, PlayOutcome, PlaybackBackend, PlaybackEvent, PreparedAudio, PreparedTrack,
    SharedGraph, VoiceId,
};
use crate::error::{PlayerError, Result};
use crate::preload::AudioFetcher;
use crate::types::TrackSource;

/// Rolling window after a user gesture in which playback may start.
#[derive(Debug, Clone)]
pub struct InteractionGate {
    window: Duration,
    last: Option<Instant>,
}

impl InteractionGate {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&mut self, at: Instant) {
        self.last = Some(at);
    }

    pub fn allows(&self) -> bool {
        self.allows_at(Instant::now())
    }

    /// True if a gesture happened within the window before `now`.
    pub fn allows_at(&self, now: Instant) -> bool {
        self.last
            .is_some_and(|last| now.saturating_duration_since(last) <= self.window)
    }
}

#[derive(Debug)]
struct Element {
    source_id: String,
    audio: Arc<DecodedAudio>,
    voice: VoiceId,
}

#[derive(Debug)]
struct HeldNext {
    source_id: String,
    data: Bytes,
    hint: Option<String>,
}

/// Sequential backend without crossfades.
pub struct ElementBackend {
    graph: SharedGraph,
    fetcher: Arc<dyn AudioFetcher>,
    gate: InteractionGate,
    current: Option<Element>,
    next: Option<HeldNext>,
    deferred: Option<(TrackSource, Duration)>,
    ended_reported: bool,
    events: Vec<PlaybackEvent>,
}

impl ElementBackend {
    pub fn new(graph: SharedGraph, fetcher: Arc<dyn AudioFetcher>, gate: InteractionGate) -> Self {
        Self {
            graph,
            fetcher,
            gate,
            current: None,
            next: None,
            deferred: None,
            ended_reported: false,
            events: Vec::new(),
        }
    }

    pub fn gate(&self) -> &InteractionGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut InteractionGate {
        &mut self.gate
    }

    /// True while a play call waits for a gesture.
    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    async fn play_inner(&mut self, source: TrackSource, start_at: Duration) -> Result<PlayOutcome> {
        if !self.gate.allows() {
            info!(source = %source_id(&source), "play deferred until next user interaction");
            self.deferred = Some((source, start_at));
            self.events.push(PlaybackEvent::InteractionRequired);
            return Ok(PlayOutcome::Deferred);
        }
        self.deferred = None;
        self.start(source, start_at).await
    }

    async fn start(&mut self, source: TrackSource, start_at: Duration) -> Result<PlayOutcome> {
        let id = source_id(&source);
        if let Some(current) = self.current.take() {
            lock_graph(&self.graph).stop(current.voice);
        }

        let (data, hint) = match self.next.take() {
            Some(held) if held.source_id == id => (held.data, held.hint),
            _ => (source_bytes(self.fetcher.as_ref(), &source).await?, source_hint(&source)),
        };
        let (rate, channels) = {
            let graph = lock_graph(&self.graph);
            (graph.sample_rate(), graph.channels())
        };
        let audio = Arc::new(decode_blocking(data, hint, rate, channels).await?);

        let voice = {
            let mut graph = lock_graph(&self.graph);
            let voice = graph.add_voice(Arc::clone(&audio), 1.0);
            graph.resume();
            graph.start(voice, start_at);
            voice
        };
        info!(source = %id, "element playback started");
        self.current = Some(Element {
            source_id: id,
            audio,
            voice,
        });
        self.ended_reported = false;
        Ok(PlayOutcome::Started)
    }

    async fn interaction(&mut self) -> Result<Option<PlayOutcome>> {
        self.gate.record();
        match self.deferred.take() {
            Some((source, start_at)) => {
                debug!("running deferred play");
                self.start(source, start_at).await.map(Some)
            }
            None => Ok(None),
        }
    }
}

impl PlaybackBackend for ElementBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Element
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
        Box::pin(async move {
            let data = source_bytes(fetcher.as_ref(), &source).await?;
            Ok(PreparedTrack {
                source_id: source_id(&source),
                audio: PreparedAudio::Encoded {
                    data,
                    hint: source_hint(&source),
                },
            })
        })
    }

    fn install_next(&mut self, prepared: PreparedTrack) -> bool {
        if self.next.is_some() {
            return false;
        }
        let PreparedAudio::Encoded { data, hint } = prepared.audio else {
            warn!(source = %prepared.source_id, "element backend holds encoded tracks only");
            return false;
        };
        debug!(source = %prepared.source_id, bytes = data.len(), "next element buffered");
        self.next = Some(HeldNext {
            source_id: prepared.source_id,
            data,
            hint,
        });
        true
    }

    fn next_source_id(&self) -> Option<String> {
        self.next.as_ref().map(|n| n.source_id.clone())
    }

    fn transition_to_next(&mut self) -> bool {
        false
    }

    fn pause(&mut self) {
        lock_graph(&self.graph).suspend();
    }

    fn resume(&mut self) {
        lock_graph(&self.graph).resume();
    }

    fn stop(&mut self) {
        if let Some(current) = self.current.take() {
            lock_graph(&self.graph).stop(current.voice);
        }
        self.next = None;
        self.deferred = None;
        self.ended_reported = false;
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
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
            .and_then(|e| lock_graph(&self.graph).position(e.voice))
            .unwrap_or_default()
    }

    fn duration(&self) -> Option<Duration> {
        self.current.as_ref().map(|e| e.audio.duration())
    }

    fn current_source_id(&self) -> Option<String> {
        self.current.as_ref().map(|e| e.source_id.clone())
    }

    fn is_paused(&self) -> bool {
        lock_graph(&self.graph).is_suspended()
    }

    fn poll_events(&mut self) -> Vec<PlaybackEvent> {
        let ended = lock_graph(&self.graph).take_ended();
        if let Some(current) = self.current.as_ref() {
            if !self.ended_reported && ended.contains(&current.voice) {
                self.ended_reported = true;
                info!(source = %current.source_id, "track ended");
                self.events.push(PlaybackEvent::TrackEnded {
                    source_id: current.source_id.clone(),
                });
            }
        }
        std::mem::take(&mut self.events)
    }

    fn note_interaction(&mut self) {
        self.gate.record();
    }

    fn record_interaction(&mut self) -> BoxFuture<'_, Result<Option<PlayOutcome>>> {
        Box::pin(self.interaction())
    }
}
