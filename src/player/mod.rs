//! Player: the composition root.
//!
//! Owns the blob cache, the preloader, the playback backend and the error
//! recovery state, and drives them from a playlist. A periodic [`Player::tick`]
//! polls backend events, preloads the next track once enough of the current
//! one has played and starts crossfades near the end of a track.

pub mod session;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{BlobCacheStore, CacheStats, StoreSettings};
use crate::config::PlayerConfig;
use crate::error::{ErrorCode, PlayerError, Result};
use crate::playback::{
    select_backend, BackendKind, Capabilities, PlayOutcome, PlaybackBackend, PlaybackEvent,
    SharedGraph,
};
use crate::preload::{
    AudioFetcher, BatchOptions, BatchResult, HttpFetcher, HttpSignedUrlProvider, Preloader,
    PreloaderSettings, ProgressFn, SignedUrlProvider,
};
use crate::recovery::{watch_stall, ErrorRecovery, RecoveryStrategy};
use crate::types::{Beat, TrackSource};

pub use session::{LoggingMediaSession, MediaSession, SessionState};

/// Preload progress is reported in steps of this many percent.
const PROGRESS_STEP: u8 = 5;

/// Something clients of the player should hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    TrackEnded {
        beat_id: String,
    },
    PreloadProgress {
        beat_id: String,
        received: u64,
        total: u64,
        percent: u8,
    },
    PlaybackError {
        beat_id: String,
        code: ErrorCode,
        message: String,
        strategy: RecoveryStrategy,
        attempt: u32,
    },
    InteractionRequired {
        beat_id: Option<String>,
    },
    TransitionComplete {
        beat_id: String,
    },
}

/// Snapshot of what is playing.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackStatus {
    pub beat_id: Option<String>,
    pub index: Option<usize>,
    pub playlist_len: usize,
    pub position_sec: f32,
    pub duration_sec: Option<f32>,
    pub progress: f32,
    pub paused: bool,
    pub transitioning: bool,
    pub backend: BackendKind,
}

#[derive(Debug, Default)]
struct Playlist {
    beats: Vec<Beat>,
    index: Option<usize>,
    /// Index handed to the backend as its next track.
    next_prepared: Option<usize>,
    /// Bumped by every play request; older requests give up when it moves.
    generation: u64,
}

impl Playlist {
    fn current(&self) -> Option<&Beat> {
        self.index.and_then(|i| self.beats.get(i))
    }
}

/// Next playlist entry claimed for preparation.
struct NextClaim {
    index: usize,
    beat: Beat,
    generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Explicitly constructed player. Share it behind an `Arc`.
pub struct Player {
    config: PlayerConfig,
    capabilities: Capabilities,
    store: Arc<BlobCacheStore>,
    preloader: Preloader,
    backend: tokio::sync::Mutex<Box<dyn PlaybackBackend>>,
    playlist: Mutex<Playlist>,
    recovery: Mutex<ErrorRecovery>,
    session: Arc<dyn MediaSession>,
    events: mpsc::UnboundedSender<PlayerEvent>,
}

impl Player {
    pub fn new(
        config: PlayerConfig,
        graph: SharedGraph,
        fetcher: Arc<dyn AudioFetcher>,
        urls: Arc<dyn SignedUrlProvider>,
        session: Arc<dyn MediaSession>,
        events: mpsc::UnboundedSender<PlayerEvent>,
    ) -> Self {
        let capabilities = Capabilities::detect(&config);
        let store = Arc::new(BlobCacheStore::new(StoreSettings::from_config(
            &config,
            capabilities.memory_cache,
        )));
        let preloader = Preloader::new(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            urls,
            PreloaderSettings {
                failure_cooldown: config.failure_cooldown(),
                max_retries: config.preload_retries,
            },
        );
        let backend = select_backend(&capabilities, &config, graph, fetcher);
        info!(
            platform = %capabilities.platform,
            backend = ?backend.kind(),
            memory_cache = capabilities.memory_cache,
            "player created"
        );

        Self {
            config,
            capabilities,
            store,
            preloader,
            backend: tokio::sync::Mutex::new(backend),
            playlist: Mutex::new(Playlist::default()),
            recovery: Mutex::new(ErrorRecovery::new()),
            session,
            events,
        }
    }

    /// Builds a player talking HTTP to the configured beats API.
    pub fn with_http(
        config: PlayerConfig,
        graph: SharedGraph,
        events: mpsc::UnboundedSender<PlayerEvent>,
    ) -> Self {
        let client = reqwest::Client::new();
        let max_bytes = config.persistent_budget_bytes.max(config.memory_budget_bytes);
        let fetcher = Arc::new(HttpFetcher::with_client(client.clone()).with_max_bytes(max_bytes));
        let urls = Arc::new(HttpSignedUrlProvider::new(
            client,
            config.api_base_url.clone(),
            config.signed_url_ttl(),
        ));
        Self::new(
            config,
            graph,
            fetcher,
            urls,
            Arc::new(LoggingMediaSession),
            events,
        )
    }

    /// Opens the persistent cache tier.
    pub async fn init(&self) {
        self.store.init().await;
    }

    /// Stops playback, cancels preloads and closes the cache.
    pub async fn dispose(&self) {
        self.preloader.cancel_all();
        self.backend.lock().await.stop();
        self.session.set_playback_state(SessionState::None);
        self.store.dispose().await;
        info!("player disposed");
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn store(&self) -> &Arc<BlobCacheStore> {
        &self.store
    }

    pub fn preloader(&self) -> &Preloader {
        &self.preloader
    }

    /// Replaces the playlist, optionally starting playback at `start`.
    pub async fn load_playlist(
        &self,
        beats: Vec<Beat>,
        start: Option<usize>,
    ) -> Result<Option<PlayOutcome>> {
        if let Some(index) = start {
            if index >= beats.len() {
                return Err(PlayerError::invalid_request(format!(
                    "start index {} outside playlist of {}",
                    index,
                    beats.len()
                )));
            }
        }

        self.preloader.cancel_all();
        self.backend.lock().await.stop();
        lock(&self.recovery).reset();
        {
            let mut playlist = lock(&self.playlist);
            playlist.generation += 1;
            playlist.index = None;
            playlist.next_prepared = None;
            playlist.beats = beats;
            info!(len = playlist.beats.len(), "playlist loaded");
        }
        self.session.set_playback_state(SessionState::None);

        match start {
            Some(index) => self.play_from(index, Duration::ZERO, true).await.map(Some),
            None => Ok(None),
        }
    }

    /// Plays the playlist entry at `index` on behalf of the user.
    pub async fn play_index(&self, index: usize, start_at: Duration) -> Result<PlayOutcome> {
        self.play_from(index, start_at, true).await
    }

    pub async fn next(&self) -> Result<PlayOutcome> {
        let target = {
            let playlist = lock(&self.playlist);
            let next = playlist.index.map_or(0, |i| i + 1);
            if next >= playlist.beats.len() {
                return Err(PlayerError::invalid_state("already at the end of the playlist"));
            }
            next
        };
        self.play_from(target, Duration::ZERO, true).await
    }

    pub async fn previous(&self) -> Result<PlayOutcome> {
        let target = {
            let playlist = lock(&self.playlist);
            if playlist.beats.is_empty() {
                return Err(PlayerError::invalid_state("playlist is empty"));
            }
            playlist.index.map_or(0, |i| i.saturating_sub(1))
        };
        self.play_from(target, Duration::ZERO, true).await
    }

    pub async fn pause(&self) {
        self.backend.lock().await.pause();
        self.session.set_playback_state(SessionState::Paused);
    }

    pub async fn resume(&self) {
        let mut backend = self.backend.lock().await;
        backend.note_interaction();
        backend.resume();
        self.session.set_playback_state(SessionState::Playing);
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.backend.lock().await.seek(position)
    }

    pub async fn set_volume(&self, volume: f32) {
        self.backend.lock().await.set_volume(volume);
    }

    /// Records a user gesture, running a play that was waiting for one.
    pub async fn interaction(&self) -> Result<Option<PlayOutcome>> {
        let outcome = self.backend.lock().await.record_interaction().await?;
        if outcome == Some(PlayOutcome::Started) {
            self.session.set_playback_state(SessionState::Playing);
        }
        Ok(outcome)
    }

    pub async fn status(&self) -> PlaybackStatus {
        let (beat_id, index, playlist_len) = {
            let playlist = lock(&self.playlist);
            (
                playlist.current().map(|b| b.id.clone()),
                playlist.index,
                playlist.beats.len(),
            )
        };
        let backend = self.backend.lock().await;
        PlaybackStatus {
            beat_id,
            index,
            playlist_len,
            position_sec: backend.position().as_secs_f32(),
            duration_sec: backend.duration().map(|d| d.as_secs_f32()),
            progress: backend.progress(),
            paused: backend.is_paused(),
            transitioning: backend.is_transitioning(),
            backend: backend.kind(),
        }
    }

    /// Preloads `beats`, or the upcoming playlist entries when none are given.
    pub async fn preload(&self, beats: Option<Vec<Beat>>) -> Vec<BatchResult> {
        match beats {
            Some(beats) => {
                let options = BatchOptions {
                    max_concurrent: self.config.preload_concurrency,
                    priority_fn: None,
                };
                self.preloader.preload_batch(&beats, options, None).await
            }
            None => {
                let Some((current, beats)) = self.upcoming_context() else {
                    return Vec::new();
                };
                self.preloader
                    .preload_upcoming(&current, &beats, self.config.preload_count)
                    .await
            }
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.store.stats().await
    }

    pub async fn sweep(&self) -> usize {
        self.store.sweep_expired().await
    }

    pub async fn clear_cache(&self) {
        self.preloader.cancel_all();
        self.store.clear().await;
    }

    /// Runs [`Player::tick`] every `interval` until `cancel` fires.
    pub fn spawn_ticker(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let player = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => player.tick().await,
                }
            }
        })
    }

    /// Reacts to backend events and applies the preload and crossfade policy.
    ///
    /// Preparing the next track runs on its own task so a slow fetch or
    /// decode never holds up event handling.
    pub async fn tick(self: &Arc<Self>) {
        let events = self.backend.lock().await.poll_events();
        for event in events {
            self.handle_event(event).await;
        }

        let (progress, paused) = {
            let backend = self.backend.lock().await;
            (backend.progress(), backend.is_paused())
        };
        if paused {
            return;
        }
        if progress >= self.config.preload_threshold(self.capabilities.platform) {
            if let Some(claim) = self.claim_next() {
                let player = Arc::clone(self);
                tokio::spawn(async move { player.prepare_next(claim).await });
            }
        }
        self.maybe_transition().await;
    }

    async fn handle_event(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::TransitionStarted { from, to } => {
                debug!(%from, %to, "transition running");
            }
            PlaybackEvent::TransitionComplete { .. } => {
                let beat = {
                    let mut playlist = lock(&self.playlist);
                    let next = playlist
                        .next_prepared
                        .take()
                        .or_else(|| playlist.index.map(|i| i + 1));
                    playlist.index = next.filter(|i| *i < playlist.beats.len());
                    playlist.current().cloned()
                };
                if let Some(beat) = beat {
                    lock(&self.recovery).clear(&beat.id);
                    self.session.set_metadata(&beat);
                    self.emit(PlayerEvent::TransitionComplete { beat_id: beat.id });
                    self.spawn_preload_upcoming();
                }
            }
            PlaybackEvent::TrackEnded { .. } => {
                let (ended, next) = {
                    let playlist = lock(&self.playlist);
                    let next = playlist.index.map(|i| i + 1).filter(|i| *i < playlist.beats.len());
                    (playlist.current().map(|b| b.id.clone()), next)
                };
                if let Some(beat_id) = ended {
                    self.emit(PlayerEvent::TrackEnded { beat_id });
                }
                match next {
                    Some(index) => {
                        if let Err(e) = self.play_from(index, Duration::ZERO, false).await {
                            warn!(error = %e, "auto-advance failed");
                        }
                    }
                    None => {
                        info!("playlist finished");
                        self.session.set_playback_state(SessionState::None);
                    }
                }
            }
            PlaybackEvent::InteractionRequired => {
                let beat_id = lock(&self.playlist).current().map(|b| b.id.clone());
                self.emit(PlayerEvent::InteractionRequired { beat_id });
            }
        }
    }

    /// Marks the entry after the current one as being prepared, once per track.
    fn claim_next(&self) -> Option<NextClaim> {
        let mut playlist = lock(&self.playlist);
        let next = playlist.index? + 1;
        if next >= playlist.beats.len() || playlist.next_prepared == Some(next) {
            return None;
        }
        playlist.next_prepared = Some(next);
        Some(NextClaim {
            index: next,
            beat: playlist.beats[next].clone(),
            generation: playlist.generation,
        })
    }

    /// Fetches and decodes a claimed entry, then hands it to the backend.
    /// The backend is only locked to start the decode and to install it.
    async fn prepare_next(&self, claim: NextClaim) {
        let NextClaim {
            index,
            beat,
            generation,
        } = claim;
        let source = match self.preloader.preload(&beat, None).await {
            Ok(source) => source,
            Err(e) => {
                warn!(beat = %beat.id, error = %e, "could not prepare next track");
                return;
            }
        };

        let prepare = {
            let backend = self.backend.lock().await;
            if backend.next_source_id().is_some() {
                debug!(beat = %beat.id, "backend already holds a next track");
                return;
            }
            backend.prepare_next(source)
        };
        let prepared = match prepare.await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(beat = %beat.id, error = %e, "backend could not prepare next track");
                return;
            }
        };

        let mut backend = self.backend.lock().await;
        if lock(&self.playlist).generation != generation {
            debug!(beat = %beat.id, "playlist moved on, dropping prepared track");
            return;
        }
        if backend.install_next(prepared) {
            debug!(beat = %beat.id, index, "next track ready");
        } else {
            debug!(beat = %beat.id, "backend already holds a next track");
        }
    }

    async fn maybe_transition(&self) {
        let crossfade = self.config.crossfade();
        let mut backend = self.backend.lock().await;
        if backend.is_transitioning() || backend.next_source_id().is_none() {
            return;
        }
        let Some(duration) = backend.duration() else {
            return;
        };
        if duration.saturating_sub(backend.position()) <= crossfade {
            backend.transition_to_next();
        }
    }

    /// Plays from `index`, recovering from errors and skipping beats that
    /// cannot be played.
    async fn play_from(
        &self,
        index: usize,
        start_at: Duration,
        user_initiated: bool,
    ) -> Result<PlayOutcome> {
        let generation = {
            let mut playlist = lock(&self.playlist);
            if index >= playlist.beats.len() {
                return Err(PlayerError::invalid_request(format!(
                    "index {} outside playlist of {}",
                    index,
                    playlist.beats.len()
                )));
            }
            playlist.generation += 1;
            playlist.generation
        };

        let mut index = index;
        let mut start_at = start_at;
        loop {
            let beat = {
                let mut playlist = lock(&self.playlist);
                if playlist.generation != generation {
                    return Err(PlayerError::cancelled("play request superseded"));
                }
                let beat = playlist.beats.get(index).cloned();
                if beat.is_some() {
                    playlist.index = Some(index);
                    playlist.next_prepared = None;
                }
                beat
            };
            let Some(beat) = beat else {
                self.backend.lock().await.stop();
                self.session.set_playback_state(SessionState::None);
                return Err(PlayerError::playback("no playable beats left in the playlist"));
            };
            self.session.set_metadata(&beat);

            match self.load_with_recovery(&beat, start_at, user_initiated, generation).await? {
                Some(outcome) => {
                    if outcome == PlayOutcome::Started {
                        self.session.set_playback_state(SessionState::Playing);
                    }
                    self.spawn_preload_upcoming();
                    return Ok(outcome);
                }
                None => {
                    index += 1;
                    start_at = Duration::ZERO;
                }
            }
        }
    }

    /// Returns `None` when recovery gave up on the beat.
    async fn load_with_recovery(
        &self,
        beat: &Beat,
        start_at: Duration,
        user_initiated: bool,
        generation: u64,
    ) -> Result<Option<PlayOutcome>> {
        let mut source = self.resolve_source(beat).await;
        loop {
            if lock(&self.playlist).generation != generation {
                return Err(PlayerError::cancelled("play request superseded"));
            }
            let attempt = match source {
                Ok(source) => self.start_source(source, start_at, user_initiated).await,
                Err(e) => Err(e),
            };
            let error = match attempt {
                Ok(outcome) => {
                    lock(&self.recovery).clear(&beat.id);
                    return Ok(Some(outcome));
                }
                Err(e) => e,
            };

            let decision = lock(&self.recovery).handle(&beat.id, &error);
            self.emit(PlayerEvent::PlaybackError {
                beat_id: beat.id.clone(),
                code: error.code,
                message: error.message.clone(),
                strategy: decision.strategy,
                attempt: decision.attempt,
            });

            source = match decision.strategy {
                RecoveryStrategy::Retry => {
                    tokio::time::sleep(decision.delay).await;
                    self.resolve_source(beat).await
                }
                RecoveryStrategy::CacheFallback => self.cached_source(beat).await,
                RecoveryStrategy::RefreshUrl => {
                    if let Ok(key) = beat.cache_key() {
                        self.preloader.refresh_url(&key);
                    }
                    self.resolve_source(beat).await
                }
                RecoveryStrategy::TranscodeRequest | RecoveryStrategy::AlternateFormat => {
                    // No transcoding service is reachable from here; reload
                    // in case the stored asset was replaced.
                    self.resolve_source(beat).await
                }
                RecoveryStrategy::Skip => return Ok(None),
            };
        }
    }

    async fn resolve_source(&self, beat: &Beat) -> Result<TrackSource> {
        self.preloader
            .preload(beat, Some(self.progress_listener(&beat.id)))
            .await
    }

    async fn cached_source(&self, beat: &Beat) -> Result<TrackSource> {
        let key = beat.cache_key()?;
        self.store
            .get(&key)
            .await
            .map(TrackSource::Cached)
            .ok_or_else(|| PlayerError::network(format!("no cached copy of beat {}", beat.id)))
    }

    async fn start_source(
        &self,
        source: TrackSource,
        start_at: Duration,
        user_initiated: bool,
    ) -> Result<PlayOutcome> {
        // Only network sources can stall; blob URLs never hit the wire.
        let url = match &source {
            TrackSource::Remote(url) => Some(url.clone()),
            TrackSource::Cached(_) => None,
        };
        let fetcher = Arc::clone(self.preloader.fetcher());
        let mut backend = self.backend.lock().await;
        if user_initiated {
            backend.note_interaction();
        }
        watch_stall(
            backend.play(source, start_at),
            url.as_deref(),
            fetcher.as_ref(),
            self.config.stall_timeout(),
        )
        .await
    }

    fn upcoming_context(&self) -> Option<(Beat, Vec<Beat>)> {
        let playlist = lock(&self.playlist);
        let current = playlist.current()?.clone();
        Some((current, playlist.beats.clone()))
    }

    fn spawn_preload_upcoming(&self) {
        let count = self.config.preload_count;
        if count == 0 {
            return;
        }
        let Some((current, beats)) = self.upcoming_context() else {
            return;
        };
        let preloader = self.preloader.clone();
        tokio::spawn(async move {
            let results = preloader.preload_upcoming(&current, &beats, count).await;
            let failed = results.iter().filter(|r| !r.success).count();
            debug!(total = results.len(), failed, "upcoming preload finished");
        });
    }

    fn progress_listener(&self, beat_id: &str) -> ProgressFn {
        let events = self.events.clone();
        let beat_id = beat_id.to_string();
        let last_step = AtomicU8::new(0);
        Arc::new(move |received: u64, total: Option<u64>| {
            let Some(total) = total.filter(|t| *t > 0) else {
                return;
            };
            let percent = (received.saturating_mul(100) / total).min(100) as u8;
            let step = percent - percent % PROGRESS_STEP;
            if step > last_step.fetch_max(step, Ordering::Relaxed) {
                events
                    .send(PlayerEvent::PreloadProgress {
                        beat_id: beat_id.clone(),
                        received,
                        total,
                        percent,
                    })
                    .ok();
            }
        })
    }

    fn emit(&self, event: PlayerEvent) {
        self.events.send(event).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Platform;
    use crate::playback::test_support::{wav_bytes, CdnUrls, GatedFetcher, StaticFetcher};
    use crate::playback::{lock_graph, AudioGraph};
    use bytes::Bytes;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::time::timeout;

    struct Harness {
        player: Arc<Player>,
        graph: SharedGraph,
        events: mpsc::UnboundedReceiver<PlayerEvent>,
        _dir: TempDir,
    }

    impl Harness {
        fn advance(&self, ms: u64) {
            lock_graph(&self.graph).advance(Duration::from_millis(ms));
        }

        fn drain(&mut self) -> Vec<PlayerEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Waits for the background prepare of the next track.
        async fn wait_for_next(&self) {
            for _ in 0..400 {
                if self.player.backend.lock().await.next_source_id().is_some() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("next track was never prepared");
        }
    }

    fn beat(id: &str) -> Beat {
        Beat::new(id, "u1", format!("{}.wav", id), format!("Beat {}", id))
    }

    fn static_fetcher(bodies: &[(&str, Bytes)]) -> StaticFetcher {
        StaticFetcher {
            bodies: bodies
                .iter()
                .map(|(id, body)| (format!("https://cdn.test/{}.wav", id), body.clone()))
                .collect::<HashMap<_, _>>(),
            ..StaticFetcher::default()
        }
    }

    async fn harness(bodies: &[(&str, Bytes)], tune: impl FnOnce(&mut PlayerConfig)) -> Harness {
        harness_with(Arc::new(static_fetcher(bodies)), tune).await
    }

    async fn harness_with(
        fetcher: Arc<dyn AudioFetcher>,
        tune: impl FnOnce(&mut PlayerConfig),
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = PlayerConfig {
            cache_path: Some(dir.path().to_path_buf()),
            platform: Platform::Desktop,
            memory_cache: Some(true),
            crossfade_sec: 0.1,
            preload_count: 0,
            ..PlayerConfig::default()
        };
        tune(&mut config);

        let graph: SharedGraph = Arc::new(Mutex::new(AudioGraph::new(8_000, 1)));
        let (tx, rx) = mpsc::unbounded_channel();
        let player = Player::new(
            config,
            Arc::clone(&graph),
            fetcher,
            Arc::new(CdnUrls),
            Arc::new(LoggingMediaSession),
            tx,
        );
        player.init().await;
        Harness {
            player: Arc::new(player),
            graph,
            events: rx,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn plays_a_beat_through_the_cache() {
        let h = harness(&[("a", wav_bytes(8_000, 1, 0.5))], |_| {}).await;
        h.player.load_playlist(vec![beat("a")], None).await.unwrap();

        let outcome = h.player.play_index(0, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, PlayOutcome::Started);

        let status = h.player.status().await;
        assert_eq!(status.beat_id.as_deref(), Some("a"));
        assert_eq!(status.backend, BackendKind::Gapless);
        assert!(h.player.store().has(&beat("a").cache_key().unwrap()).await);
        assert_eq!(h.player.cache_stats().await.persistent_entries, 1);
    }

    #[tokio::test]
    async fn track_end_advances_to_next_beat() {
        let mut h = harness(
            &[("a", wav_bytes(8_000, 1, 0.2)), ("b", wav_bytes(8_000, 1, 0.2))],
            |c| c.crossfade_sec = 0.0,
        )
        .await;
        h.player
            .load_playlist(vec![beat("a"), beat("b")], Some(0))
            .await
            .unwrap();

        h.advance(300);
        h.player.tick().await;

        assert!(h.drain().contains(&PlayerEvent::TrackEnded {
            beat_id: "a".to_string()
        }));
        assert_eq!(h.player.status().await.beat_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn crossfades_into_the_prepared_next_beat() {
        let mut h = harness(
            &[("a", wav_bytes(8_000, 1, 1.0)), ("b", wav_bytes(8_000, 1, 1.0))],
            |c| c.desktop_preload_threshold = 0.5,
        )
        .await;
        h.player
            .load_playlist(vec![beat("a"), beat("b")], Some(0))
            .await
            .unwrap();

        h.advance(600);
        h.player.tick().await;
        h.wait_for_next().await;

        h.advance(350);
        h.player.tick().await;
        assert!(h.player.status().await.transitioning);

        h.advance(150);
        h.player.tick().await;
        let status = h.player.status().await;
        assert!(!status.transitioning);
        assert_eq!(status.beat_id.as_deref(), Some("b"));
        assert_eq!(status.index, Some(1));

        let events = h.drain();
        assert!(events.contains(&PlayerEvent::TransitionComplete {
            beat_id: "b".to_string()
        }));
        assert!(!events.iter().any(|e| matches!(e, PlayerEvent::TrackEnded { .. })));
    }

    #[tokio::test]
    async fn slow_next_fetch_does_not_hold_up_track_end() {
        let fetcher = Arc::new(GatedFetcher::new(
            static_fetcher(&[("a", wav_bytes(8_000, 1, 0.3)), ("b", wav_bytes(8_000, 1, 1.0))]),
            &["https://cdn.test/b.wav"],
        ));
        let mut h = harness_with(fetcher.clone(), |c| c.crossfade_sec = 0.0).await;
        h.player
            .load_playlist(vec![beat("a"), beat("b")], Some(0))
            .await
            .unwrap();

        // Past the preload threshold: preparing "b" starts and hangs.
        h.advance(270);
        timeout(Duration::from_secs(1), h.player.tick())
            .await
            .expect("tick waited on the next track");
        let status = timeout(Duration::from_secs(1), h.player.status())
            .await
            .expect("status waited on the next track");
        assert_eq!(status.index, Some(0));

        h.advance(100);
        let player = Arc::clone(&h.player);
        let ticking = tokio::spawn(async move { player.tick().await });
        let ended = timeout(Duration::from_secs(1), async {
            loop {
                match h.events.recv().await {
                    Some(PlayerEvent::TrackEnded { beat_id }) => break beat_id,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("track end was held up");
        assert_eq!(ended, "a");

        fetcher.open();
        timeout(Duration::from_secs(5), ticking).await.unwrap().unwrap();
        let status = h.player.status().await;
        assert_eq!(status.index, Some(1));
        assert_eq!(status.beat_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn unreachable_beat_walks_recovery_then_skips() {
        let mut h = harness(&[("good", wav_bytes(8_000, 1, 0.5))], |_| {}).await;
        h.player
            .load_playlist(vec![beat("gone"), beat("good")], None)
            .await
            .unwrap();

        let outcome = h.player.play_index(0, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, PlayOutcome::Started);
        let status = h.player.status().await;
        assert_eq!(status.index, Some(1));
        assert_eq!(status.beat_id.as_deref(), Some("good"));

        let failures: Vec<_> = h
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                PlayerEvent::PlaybackError {
                    beat_id,
                    code,
                    strategy,
                    ..
                } if beat_id == "gone" => Some((code, strategy)),
                _ => None,
            })
            .collect();
        assert_eq!(
            failures,
            vec![
                (ErrorCode::NetworkError, RecoveryStrategy::Retry),
                (ErrorCode::NetworkError, RecoveryStrategy::CacheFallback),
                (ErrorCode::NetworkError, RecoveryStrategy::RefreshUrl),
                (ErrorCode::NetworkError, RecoveryStrategy::Skip),
            ]
        );
        assert_eq!(lock(&h.player.recovery).entry("gone").map(|e| e.count), Some(4));
    }

    #[tokio::test]
    async fn undecodable_beat_is_skipped_after_recovery() {
        let mut h = harness(
            &[
                ("bad", Bytes::from_static(b"definitely not audio")),
                ("good", wav_bytes(8_000, 1, 0.5)),
            ],
            |_| {},
        )
        .await;
        h.player
            .load_playlist(vec![beat("bad"), beat("good")], None)
            .await
            .unwrap();

        let outcome = h.player.play_index(0, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, PlayOutcome::Started);
        assert_eq!(h.player.status().await.beat_id.as_deref(), Some("good"));

        let strategies: Vec<_> = h
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                PlayerEvent::PlaybackError {
                    beat_id, strategy, ..
                } if beat_id == "bad" => Some(strategy),
                _ => None,
            })
            .collect();
        assert_eq!(
            strategies,
            vec![
                RecoveryStrategy::TranscodeRequest,
                RecoveryStrategy::AlternateFormat,
                RecoveryStrategy::Skip
            ]
        );
    }

    #[tokio::test]
    async fn playlist_exhausted_by_skips_is_an_error() {
        let h = harness(&[("bad", Bytes::from_static(b"nope"))], |_| {}).await;
        h.player.load_playlist(vec![beat("bad")], None).await.unwrap();

        let err = h.player.play_index(0, Duration::ZERO).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PlaybackFailed);
    }

    #[tokio::test]
    async fn next_and_previous_walk_the_playlist() {
        let h = harness(
            &[("a", wav_bytes(8_000, 1, 0.3)), ("b", wav_bytes(8_000, 1, 0.3))],
            |_| {},
        )
        .await;
        h.player
            .load_playlist(vec![beat("a"), beat("b")], Some(0))
            .await
            .unwrap();

        h.player.next().await.unwrap();
        assert_eq!(h.player.status().await.index, Some(1));
        assert_eq!(h.player.next().await.unwrap_err().code, ErrorCode::InvalidState);

        h.player.previous().await.unwrap();
        assert_eq!(h.player.status().await.index, Some(0));
    }

    #[tokio::test]
    async fn pause_freezes_position() {
        let h = harness(&[("a", wav_bytes(8_000, 1, 1.0))], |_| {}).await;
        h.player.load_playlist(vec![beat("a")], Some(0)).await.unwrap();

        h.advance(200);
        h.player.pause().await;
        let paused_at = h.player.status().await.position_sec;
        h.advance(200);
        let status = h.player.status().await;
        assert!(status.paused);
        assert_eq!(status.position_sec, paused_at);

        h.player.resume().await;
        assert!(!h.player.status().await.paused);
    }

    #[tokio::test]
    async fn load_playlist_rejects_bad_start() {
        let h = harness(&[], |_| {}).await;
        let err = h.player.load_playlist(vec![beat("a")], Some(3)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn preload_reports_progress_and_fills_cache() {
        let mut h = harness(&[("a", wav_bytes(8_000, 1, 0.5))], |_| {}).await;
        let results = h.player.preload(Some(vec![beat("a"), beat("missing")])).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.beat.id == "a" && r.success));
        assert!(results.iter().any(|r| r.beat.id == "missing" && !r.success));
        assert_eq!(h.player.cache_stats().await.persistent_entries, 1);
        // Batch preloads carry no progress listener.
        assert!(h.drain().is_empty());

        h.player.clear_cache().await;
        assert_eq!(h.player.cache_stats().await.persistent_entries, 0);
    }

    #[tokio::test]
    async fn mobile_platform_selects_element_backend() {
        let h = harness(&[("a", wav_bytes(8_000, 1, 0.5))], |c| {
            c.platform = Platform::Mobile;
            c.memory_cache = None;
        })
        .await;
        assert!(!h.player.capabilities().memory_cache);
        assert_eq!(h.player.status().await.backend, BackendKind::Element);

        h.player.load_playlist(vec![beat("a")], Some(0)).await.unwrap();
        assert_eq!(h.player.status().await.beat_id.as_deref(), Some("a"));
    }
}
