//! Playback error recovery.
//!
//! Every failure is classified by its media error code and mapped to an
//! ordered list of strategies. Each beat keeps an error entry recording
//! which strategies were tried in the current episode; a strategy is never
//! repeated within an episode, and the beat is skipped once the list is
//! exhausted or enough attempts failed.

pub mod stall;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ErrorCode, PlayerError};

pub use stall::watch_stall;

/// Attempts after which a beat is skipped regardless of strategies left.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base retry delay in milliseconds.
const BACKOFF_BASE_MS: u64 = 1000;

/// Upper bound of the retry delay in milliseconds.
const BACKOFF_CAP_MS: u64 = 8000;

/// Media error codes, as reported by media elements.
pub const MEDIA_ERR_ABORTED: u16 = 1;
pub const MEDIA_ERR_NETWORK: u16 = 2;
pub const MEDIA_ERR_DECODE: u16 = 3;
pub const MEDIA_ERR_SRC_NOT_SUPPORTED: u16 = 4;

/// What to do about a failed load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Load the same source again after a backoff.
    Retry,
    /// Play the cached blob instead of the network source.
    CacheFallback,
    /// Ask for a fresh signed URL.
    RefreshUrl,
    /// Ask the backend to transcode the asset.
    TranscodeRequest,
    /// Try another encoding of the asset.
    AlternateFormat,
    /// Give up on this beat and advance.
    Skip,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::CacheFallback => "cache-fallback",
            RecoveryStrategy::RefreshUrl => "refresh-url",
            RecoveryStrategy::TranscodeRequest => "transcode-request",
            RecoveryStrategy::AlternateFormat => "alternate-format",
            RecoveryStrategy::Skip => "skip",
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strategy order for a media error code.
pub fn strategies_for(media_code: u16) -> &'static [RecoveryStrategy] {
    use RecoveryStrategy::*;
    match media_code {
        MEDIA_ERR_NETWORK => &[Retry, CacheFallback, RefreshUrl],
        MEDIA_ERR_DECODE | MEDIA_ERR_SRC_NOT_SUPPORTED => &[TranscodeRequest, AlternateFormat],
        _ => &[Retry],
    }
}

/// Strategy order for an error. Stale URLs try a fresh URL first.
pub fn strategies_for_error(error: &PlayerError) -> &'static [RecoveryStrategy] {
    use RecoveryStrategy::*;
    match error.code {
        ErrorCode::StaleUrl => &[RefreshUrl, Retry, CacheFallback],
        code => strategies_for(code.media_error_code().unwrap_or(MEDIA_ERR_ABORTED)),
    }
}

/// Retry delay after `attempts` failed attempts.
pub fn backoff(attempts: u32) -> Duration {
    let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor).min(BACKOFF_CAP_MS))
}

/// Error bookkeeping for one beat.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub count: u32,
    pub last_error: Option<PlayerError>,
    pub strategies_tried: HashSet<RecoveryStrategy>,
    pub first_seen: SystemTime,
}

impl Default for ErrorEntry {
    fn default() -> Self {
        Self {
            count: 0,
            last_error: None,
            strategies_tried: HashSet::new(),
            first_seen: SystemTime::now(),
        }
    }
}

/// The chosen reaction to an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDecision {
    pub strategy: RecoveryStrategy,
    /// Wait this long before applying the strategy.
    pub delay: Duration,
    /// Errors seen for the beat in this episode, including this one.
    pub attempt: u32,
}

/// Per-beat recovery state machine.
#[derive(Debug, Default)]
pub struct ErrorRecovery {
    entries: HashMap<String, ErrorEntry>,
}

impl ErrorRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error for `beat_id` and decides what to do next.
    pub fn handle(&mut self, beat_id: &str, error: &PlayerError) -> RecoveryDecision {
        let entry = self.entries.entry(beat_id.to_string()).or_default();
        let prior = entry.count;
        entry.count += 1;
        entry.last_error = Some(error.clone());

        let next = if prior >= MAX_ATTEMPTS {
            None
        } else {
            strategies_for_error(error)
                .iter()
                .copied()
                .find(|s| !entry.strategies_tried.contains(s))
        };

        let decision = match next {
            Some(strategy) => {
                entry.strategies_tried.insert(strategy);
                let delay = if strategy == RecoveryStrategy::Retry {
                    backoff(prior)
                } else {
                    Duration::ZERO
                };
                RecoveryDecision {
                    strategy,
                    delay,
                    attempt: entry.count,
                }
            }
            None => RecoveryDecision {
                strategy: RecoveryStrategy::Skip,
                delay: Duration::ZERO,
                attempt: entry.count,
            },
        };

        if decision.strategy == RecoveryStrategy::Skip {
            warn!(beat = beat_id, attempts = entry.count, error = %error, "skipping beat");
        } else {
            info!(
                beat = beat_id,
                strategy = %decision.strategy,
                attempt = decision.attempt,
                delay_ms = decision.delay.as_millis() as u64,
                "recovering from playback error"
            );
        }
        decision
    }

    /// Ends the error episode for a beat after a successful load.
    pub fn clear(&mut self, beat_id: &str) -> bool {
        self.entries.remove(beat_id).is_some()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn entry(&self, beat_id: &str) -> Option<&ErrorEntry> {
        self.entries.get(beat_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
