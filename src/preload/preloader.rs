//! Background preloading of upcoming beats.
//!
//! Concurrent requests for the same cache key share one in-flight future,
//! so a beat is fetched at most once at a time. Every preload carries a
//! cancellation token derived from the preloader's root token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::{AudioFetcher, ProgressFn};
use super::queue::PreloadQueue;
use super::signed_url::SignedUrlProvider;
use crate::cache::BlobCacheStore;
use crate::error::{ErrorCode, PlayerError, Result};
use crate::types::{Beat, CacheKey, PreloadStatus, PreloadTask, TrackSource};

/// Workers used by [`Preloader::preload_upcoming`].
pub const UPCOMING_CONCURRENCY: usize = 2;

/// Priority of a beat given its index in the batch; higher runs first.
pub type PriorityFn = Arc<dyn Fn(&Beat, usize) -> i32 + Send + Sync>;

/// Called once per finished batch task.
pub type TaskCallback = Arc<dyn Fn(&BatchResult) + Send + Sync>;

type SharedPreload = Shared<BoxFuture<'static, Result<TrackSource>>>;
type Listeners = Arc<Mutex<Vec<ProgressFn>>>;

/// Options for [`Preloader::preload_batch`].
#[derive(Clone)]
pub struct BatchOptions {
    /// Number of workers pulling from the batch queue.
    pub max_concurrent: usize,
    /// Custom ordering. Defaults to playlist order.
    pub priority_fn: Option<PriorityFn>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: UPCOMING_CONCURRENCY,
            priority_fn: None,
        }
    }
}

/// Outcome of one beat in a batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub beat: Beat,
    pub success: bool,
    pub status: PreloadStatus,
    pub attempts: u32,
    pub source: Option<TrackSource>,
    pub error: Option<PlayerError>,
}

impl BatchResult {
    fn from_task(task: PreloadTask, source: Option<TrackSource>) -> Self {
        Self {
            success: task.status == PreloadStatus::Complete,
            status: task.status,
            attempts: task.attempts,
            error: task.last_error,
            beat: task.beat,
            source,
        }
    }
}

/// Preloader tuning.
#[derive(Debug, Clone)]
pub struct PreloaderSettings {
    /// How long a failed URL is served as-is instead of refetched.
    pub failure_cooldown: Duration,
    /// Requeues allowed for a transient failure inside a batch.
    pub max_retries: u32,
}

impl Default for PreloaderSettings {
    fn default() -> Self {
        Self {
            failure_cooldown: Duration::from_secs(30),
            max_retries: 2,
        }
    }
}

struct InFlight {
    generation: u64,
    future: SharedPreload,
    cancel: CancellationToken,
    listeners: Listeners,
}

struct State {
    in_flight: HashMap<String, InFlight>,
    failed: HashMap<String, (String, Instant)>,
    root: CancellationToken,
    next_generation: u64,
}

struct Inner {
    store: Arc<BlobCacheStore>,
    fetcher: Arc<dyn AudioFetcher>,
    urls: Arc<dyn SignedUrlProvider>,
    settings: PreloaderSettings,
    state: Mutex<State>,
}

/// Deduplicating, cancellable preloader. Cheap to clone.
#[derive(Clone)]
pub struct Preloader {
    inner: Arc<Inner>,
}

impl Preloader {
    pub fn new(
        store: Arc<BlobCacheStore>,
        fetcher: Arc<dyn AudioFetcher>,
        urls: Arc<dyn SignedUrlProvider>,
        settings: PreloaderSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                urls,
                settings,
                state: Mutex::new(State {
                    in_flight: HashMap::new(),
                    failed: HashMap::new(),
                    root: CancellationToken::new(),
                    next_generation: 0,
                }),
            }),
        }
    }

    /// Makes a beat playable from cache, fetching it if needed.
    ///
    /// Joins an in-flight preload for the same key instead of starting a
    /// second fetch. Inside the failure cool-down the remote URL is returned
    /// without fetching.
    pub async fn preload(
        &self,
        beat: &Beat,
        on_progress: Option<ProgressFn>,
    ) -> Result<TrackSource> {
        let key = beat.cache_key()?;
        self.join_or_start(key, on_progress).await
    }

    /// Preloads a set of beats with a bounded worker pool.
    ///
    /// Never fails as a whole: every beat gets a [`BatchResult`]. Transient
    /// failures are requeued until the task's retry cap is reached.
    pub async fn preload_batch(
        &self,
        beats: &[Beat],
        options: BatchOptions,
        on_task: Option<TaskCallback>,
    ) -> Vec<BatchResult> {
        if beats.is_empty() {
            return Vec::new();
        }

        let max_retries = self.inner.settings.max_retries;
        let tasks = beats.iter().enumerate().map(|(index, beat)| {
            let priority = match &options.priority_fn {
                Some(priority_fn) => priority_fn(beat, index),
                None => -(index as i32),
            };
            PreloadTask::new(beat.clone(), priority, max_retries)
        });
        let queue = Mutex::new(PreloadQueue::from_tasks(tasks));
        let results = Mutex::new(Vec::with_capacity(beats.len()));
        let workers = options.max_concurrent.clamp(1, beats.len());

        let (queue, results_ref, on_task) = (&queue, &results, &on_task);
        let worker = || async move {
            loop {
                let next = lock(queue).pop_next();
                let Some(mut task) = next else {
                    break;
                };
                task.set_loading();

                let result = match self.preload(&task.beat, None).await {
                    Ok(source @ TrackSource::Cached(_)) => {
                        task.set_complete();
                        BatchResult::from_task(task, Some(source))
                    }
                    Ok(remote) => {
                        // Cool-down hit: the remote URL is all there is.
                        task.last_error = Some(PlayerError::network("URL failed recently"));
                        task.status = PreloadStatus::Error;
                        BatchResult::from_task(task, Some(remote))
                    }
                    Err(e) => {
                        if task.record_failure(e) {
                            let (beat_id, attempts) = (task.beat.id.clone(), task.attempts);
                            let position = lock(queue).requeue(task);
                            debug!(beat = %beat_id, attempts, position, "requeueing preload");
                            continue;
                        }
                        BatchResult::from_task(task, None)
                    }
                };

                if let Some(callback) = on_task {
                    callback(&result);
                }
                lock(results_ref).push(result);
            }
        };

        join_all((0..workers).map(|_| worker())).await;

        let results = results.into_inner().unwrap_or_else(|e| e.into_inner());
        let ok = results.iter().filter(|r| r.success).count();
        info!(total = results.len(), ok, "preload batch finished");
        results
    }

    /// Preloads the `count` beats following `current` in `playlist`.
    pub async fn preload_upcoming(
        &self,
        current: &Beat,
        playlist: &[Beat],
        count: usize,
    ) -> Vec<BatchResult> {
        let Some(index) = playlist.iter().position(|b| b.id == current.id) else {
            return Vec::new();
        };
        let start = index + 1;
        let end = (start + count).min(playlist.len());
        if start >= end {
            return Vec::new();
        }
        let options = BatchOptions {
            max_concurrent: UPCOMING_CONCURRENCY,
            priority_fn: None,
        };
        self.preload_batch(&playlist[start..end], options, None).await
    }

    /// Cancels the in-flight preload for a key. Returns true if one existed.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let removed = self.inner.lock_state().in_flight.remove(key.id());
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(key = %key, "preload cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight preload. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.inner.lock_state();
        state.root.cancel();
        state.root = CancellationToken::new();
        let count = state.in_flight.len();
        state.in_flight.clear();
        if count > 0 {
            info!(count, "all preloads cancelled");
        }
        count
    }

    /// True while a preload for `key` is running.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.lock_state().in_flight.contains_key(key.id())
    }

    /// Number of running preloads.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock_state().in_flight.len()
    }

    /// Number of URLs remembered as recently failed.
    pub fn failed_count(&self) -> usize {
        self.inner.lock_state().failed.len()
    }

    /// Forgets a signed URL so the next load asks for a fresh one.
    pub fn refresh_url(&self, key: &CacheKey) {
        self.inner.urls.invalidate(key);
        self.inner.lock_state().failed.remove(key.id());
    }

    /// The shared blob cache.
    pub fn store(&self) -> &Arc<BlobCacheStore> {
        &self.inner.store
    }

    /// The fetcher, for stall probes.
    pub fn fetcher(&self) -> &Arc<dyn AudioFetcher> {
        &self.inner.fetcher
    }

    /// Resolves a signed URL for a beat.
    pub async fn signed_url(&self, beat: &Beat) -> Result<String> {
        let key = beat.cache_key()?;
        self.inner.urls.signed_url(&key).await
    }

    fn join_or_start(&self, key: CacheKey, on_progress: Option<ProgressFn>) -> SharedPreload {
        let mut state = self.inner.lock_state();
        if let Some(entry) = state.in_flight.get(key.id()) {
            debug!(key = %key, "joining in-flight preload");
            if let Some(progress) = on_progress {
                lock(&entry.listeners).push(progress);
            }
            return entry.future.clone();
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let cancel = state.root.child_token();
        let listeners: Listeners = Arc::new(Mutex::new(on_progress.into_iter().collect()));

        let inner = Arc::clone(&self.inner);
        let task_listeners = Arc::clone(&listeners);
        let task_cancel = cancel.clone();
        let id = key.id().to_string();
        let future = async move {
            let result = inner.load(&key, task_listeners, task_cancel).await;
            inner.finish(&key, generation);
            result
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            id,
            InFlight {
                generation,
                future: future.clone(),
                cancel,
                listeners,
            },
        );
        future
    }
}

impl Inner {
    async fn load(
        &self,
        key: &CacheKey,
        listeners: Listeners,
        cancel: CancellationToken,
    ) -> Result<TrackSource> {
        if let Some(handle) = self.store.get(key).await {
            debug!(key = %key, "preload served from cache");
            return Ok(TrackSource::Cached(handle));
        }

        if let Some(url) = self.recently_failed(key) {
            debug!(key = %key, "URL in failure cool-down, not refetching");
            return Ok(TrackSource::Remote(url));
        }

        let url = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(PlayerError::cancelled(format!("preload {}", key)))
            }
            url = self.urls.signed_url(key) => url?,
        };

        let progress: ProgressFn = Arc::new(move |received, total| {
            for listener in lock(&listeners).iter() {
                listener(received, total);
            }
        });

        match self.fetcher.fetch(&url, Some(progress), cancel).await {
            Ok(data) => {
                info!(key = %key, bytes = data.len(), "beat preloaded");
                let handle = self.store.put(key, data, Some(&url)).await;
                Ok(TrackSource::Cached(handle))
            }
            Err(e) => {
                match e.code {
                    ErrorCode::NetworkError => self.mark_failed(key, url),
                    ErrorCode::StaleUrl => self.urls.invalidate(key),
                    _ => {}
                }
                if e.code != ErrorCode::Cancelled {
                    warn!(key = %key, error = %e, "preload failed");
                }
                Err(e)
            }
        }
    }

    fn finish(&self, key: &CacheKey, generation: u64) {
        let mut state = self.lock_state();
        if state
            .in_flight
            .get(key.id())
            .is_some_and(|entry| entry.generation == generation)
        {
            state.in_flight.remove(key.id());
        }
    }

    fn mark_failed(&self, key: &CacheKey, url: String) {
        let cooldown = self.settings.failure_cooldown;
        let mut state = self.lock_state();
        state.failed.retain(|_, (_, at)| at.elapsed() < cooldown);
        state.failed.insert(key.id().to_string(), (url, Instant::now()));
    }

    fn recently_failed(&self, key: &CacheKey) -> Option<String> {
        let mut state = self.lock_state();
        match state.failed.get(key.id()) {
            Some((url, at)) if at.elapsed() < self.settings.failure_cooldown => Some(url.clone()),
            Some(_) => {
                state.failed.remove(key.id());
                None
            }
            None => None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StoreSettings;
    use crate::preload::fetcher::ProbeOutcome;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockFetcher {
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
        failures: Mutex<VecDeque<PlayerError>>,
        fail_matching: Option<String>,
        hang: bool,
    }

    impl AudioFetcher for MockFetcher {
        fn fetch(
            &self,
            url: &str,
            progress: Option<ProgressFn>,
            cancel: CancellationToken,
        ) -> BoxFuture<'_, Result<Bytes>> {
            let url = url.to_string();
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                lock(&self.urls).push(url.clone());
                if self.hang {
                    cancel.cancelled().await;
                    return Err(PlayerError::cancelled("download"));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Some(err) = lock(&self.failures).pop_front() {
                    return Err(err);
                }
                if let Some(pattern) = &self.fail_matching {
                    if url.contains(pattern.as_str()) {
                        return Err(PlayerError::format("unsupported codec"));
                    }
                }
                if let Some(progress) = progress {
                    progress(5, Some(10));
                    progress(10, Some(10));
                }
                Ok(Bytes::from(url.into_bytes()))
            })
        }

        fn probe(&self, _url: &str) -> BoxFuture<'_, ProbeOutcome> {
            Box::pin(async { ProbeOutcome::Reachable })
        }
    }

    #[derive(Default)]
    struct MockUrls {
        invalidations: AtomicUsize,
    }

    impl SignedUrlProvider for MockUrls {
        fn signed_url<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move { Ok(format!("https://signed/{}/{}", key.user_id, key.file_name)) })
        }

        fn invalidate(&self, _key: &CacheKey) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<BlobCacheStore>,
        fetcher: Arc<MockFetcher>,
        urls: Arc<MockUrls>,
        preloader: Preloader,
    }

    async fn fixture(fetcher: MockFetcher) -> Fixture {
        fixture_with(fetcher, PreloaderSettings::default()).await
    }

    async fn fixture_with(fetcher: MockFetcher, settings: PreloaderSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobCacheStore::new(StoreSettings {
            memory_budget_bytes: 1 << 20,
            persistent_budget_bytes: 1 << 20,
            max_age: Duration::from_secs(3600),
            root: dir.path().to_path_buf(),
            memory_enabled: true,
        }));
        store.init().await;
        let fetcher = Arc::new(fetcher);
        let urls = Arc::new(MockUrls::default());
        let preloader = Preloader::new(
            Arc::clone(&store),
            fetcher.clone(),
            urls.clone(),
            settings,
        );
        Fixture {
            _dir: dir,
            store,
            fetcher,
            urls,
            preloader,
        }
    }

    fn beat(id: &str) -> Beat {
        Beat::new(id, "u1", format!("{}.mp3", id), id)
    }

    #[tokio::test]
    async fn concurrent_preloads_share_one_fetch() {
        let f = fixture(MockFetcher::default()).await;
        let b = beat("x");

        let (first, second) =
            tokio::join!(f.preloader.preload(&b, None), f.preloader.preload(&b, None));

        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 1);
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.is_cached());
        assert_eq!(first.bytes(), second.bytes());
        assert_eq!(f.preloader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn cached_beat_is_not_fetched() {
        let f = fixture(MockFetcher::default()).await;
        let b = beat("x");
        f.store
            .put(&b.cache_key().unwrap(), Bytes::from_static(b"cached"), None)
            .await;

        let source = f.preloader.preload(&b, None).await.unwrap();
        assert_eq!(source.bytes().unwrap(), &Bytes::from_static(b"cached"));
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn progress_reaches_every_caller() {
        let f = fixture(MockFetcher::default()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |received, total| {
            lock(&sink).push((received, total));
        });

        f.preloader.preload(&beat("x"), Some(progress)).await.unwrap();
        assert_eq!(lock(&seen).last(), Some(&(10, Some(10))));
    }

    #[tokio::test]
    async fn network_failure_starts_cooldown() {
        let fetcher = MockFetcher::default();
        lock(&fetcher.failures).push_back(PlayerError::network("connection reset"));
        let f = fixture(fetcher).await;
        let b = beat("x");

        let err = f.preloader.preload(&b, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);

        let source = f.preloader.preload(&b, None).await.unwrap();
        assert!(!source.is_cached());
        assert_eq!(source.url(), Some("https://signed/u1/x.mp3"));
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 1);

        f.preloader.refresh_url(&b.cache_key().unwrap());
        assert!(f.preloader.preload(&b, None).await.unwrap().is_cached());
    }

    #[tokio::test]
    async fn expired_failures_are_pruned() {
        let fetcher = MockFetcher::default();
        lock(&fetcher.failures).push_back(PlayerError::network("connection reset"));
        lock(&fetcher.failures).push_back(PlayerError::network("connection reset"));
        let settings = PreloaderSettings {
            failure_cooldown: Duration::from_millis(10),
            ..PreloaderSettings::default()
        };
        let f = fixture_with(fetcher, settings).await;

        f.preloader.preload(&beat("x"), None).await.unwrap_err();
        assert_eq!(f.preloader.failed_count(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        f.preloader.preload(&beat("y"), None).await.unwrap_err();
        assert_eq!(f.preloader.failed_count(), 1);
    }

    #[tokio::test]
    async fn batch_never_fails_as_a_whole() {
        let f = fixture(MockFetcher {
            fail_matching: Some("bad".to_string()),
            ..Default::default()
        })
        .await;
        let beats = vec![beat("a"), beat("bad"), beat("c")];
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        let callback: TaskCallback = Arc::new(move |_: &BatchResult| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let results = f
            .preloader
            .preload_batch(&beats, BatchOptions::default(), Some(callback))
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(reported.load(Ordering::SeqCst), 3);
        assert_eq!(results.iter().filter(|r| r.success).count(), 2);
        let bad = results.iter().find(|r| r.beat.id == "bad").unwrap();
        assert_eq!(bad.status, PreloadStatus::Error);
        assert_eq!(bad.error.as_ref().unwrap().code, ErrorCode::FormatError);
        assert_eq!(bad.attempts, 1);
    }

    #[tokio::test]
    async fn stale_url_is_requeued_with_fresh_url() {
        let fetcher = MockFetcher::default();
        lock(&fetcher.failures).push_back(PlayerError::stale_url(403));
        let f = fixture(fetcher).await;

        let results = f
            .preloader
            .preload_batch(&[beat("x")], BatchOptions::default(), None)
            .await;

        assert!(results[0].success);
        assert_eq!(results[0].attempts, 2);
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.urls.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_follows_priority() {
        let f = fixture(MockFetcher::default()).await;
        let beats = vec![beat("a"), beat("b"), beat("c")];
        let options = BatchOptions {
            max_concurrent: 1,
            priority_fn: Some(Arc::new(|_: &Beat, index: usize| index as i32)),
        };

        f.preloader.preload_batch(&beats, options, None).await;

        let order = lock(&f.fetcher.urls).clone();
        assert_eq!(
            order,
            vec![
                "https://signed/u1/c.mp3",
                "https://signed/u1/b.mp3",
                "https://signed/u1/a.mp3"
            ]
        );
    }

    #[tokio::test]
    async fn upcoming_selects_following_beats() {
        let f = fixture(MockFetcher::default()).await;
        let playlist: Vec<Beat> = ["a", "b", "c", "d", "e"].iter().map(|id| beat(id)).collect();

        let results = f.preloader.preload_upcoming(&playlist[1], &playlist, 2).await;
        let mut ids: Vec<_> = results.iter().map(|r| r.beat.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["c", "d"]);

        let tail = f.preloader.preload_upcoming(&playlist[4], &playlist, 3).await;
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_fetch() {
        let f = fixture(MockFetcher {
            hang: true,
            ..Default::default()
        })
        .await;
        let b = beat("x");
        let key = b.cache_key().unwrap();

        let preloader = f.preloader.clone();
        let task_beat = b.clone();
        let handle = tokio::spawn(async move { preloader.preload(&task_beat, None).await });
        while !f.preloader.is_in_flight(&key) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(f.preloader.cancel(&key));
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
        assert!(!f.store.has(&key).await);
    }

    #[tokio::test]
    async fn cancel_all_aborts_everything() {
        let f = fixture(MockFetcher {
            hang: true,
            ..Default::default()
        })
        .await;

        let mut handles = Vec::new();
        for id in ["a", "b"] {
            let preloader = f.preloader.clone();
            let b = beat(id);
            handles.push(tokio::spawn(async move { preloader.preload(&b, None).await }));
        }
        while f.preloader.in_flight_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(f.preloader.cancel_all(), 2);
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap_err().code, ErrorCode::Cancelled);
        }
    }
}
