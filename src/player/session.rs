//! Media session integration (lock screen, hardware keys).

use serde::Serialize;
use tracing::info;

use crate::types::Beat;

/// Playback state as a media session sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    None,
    Playing,
    Paused,
}

/// Receives now-playing metadata and state changes.
pub trait MediaSession: Send + Sync {
    fn set_metadata(&self, beat: &Beat);
    fn set_playback_state(&self, state: SessionState);
}

/// Session that only logs.
#[derive(Debug, Default)]
pub struct LoggingMediaSession;

impl MediaSession for LoggingMediaSession {
    fn set_metadata(&self, beat: &Beat) {
        info!(beat = %beat.id, title = %beat.title, "now playing");
    }

    fn set_playback_state(&self, state: SessionState) {
        info!(?state, "playback state");
    }
}
