//! PreloadTask type for tracking background downloads.
//!
//! A PreloadTask tracks one beat from the moment it is enqueued for
//! preloading until its blob is cached or the task gives up.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use super::beat::Beat;
use crate::error::PlayerError;

/// Status of a preload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreloadStatus {
    /// Enqueued, waiting for a worker.
    #[default]
    Pending,
    /// A worker is fetching the blob.
    Loading,
    /// Blob cached (or already present).
    Complete,
    /// Gave up after the retry cap or a permanent failure.
    Error,
}

/// A beat waiting to be preloaded, with its priority and retry bookkeeping.
#[derive(Debug, Clone)]
pub struct PreloadTask {
    /// The beat to preload.
    pub beat: Beat,

    /// Ordering priority; higher runs first.
    pub priority: i32,

    /// Current task state.
    pub status: PreloadStatus,

    /// Number of fetch attempts started so far.
    pub attempts: u32,

    /// Retries allowed after the first attempt for transient failures.
    pub max_retries: u32,

    /// Last failure, if any.
    pub last_error: Option<PlayerError>,

    /// When the task was enqueued.
    pub created_at: SystemTime,

    /// When the last attempt started.
    pub started_at: Option<SystemTime>,

    /// When the task reached a terminal state.
    pub completed_at: Option<SystemTime>,
}

impl PreloadTask {
    /// Creates a new pending task.
    pub fn new(beat: Beat, priority: i32, max_retries: u32) -> Self {
        Self {
            beat,
            priority,
            status: PreloadStatus::Pending,
            attempts: 0,
            max_retries,
            last_error: None,
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Marks the task as loading and counts the attempt.
    pub fn set_loading(&mut self) {
        self.status = PreloadStatus::Loading;
        self.attempts += 1;
        self.started_at = Some(SystemTime::now());
    }

    /// Marks the task as complete.
    pub fn set_complete(&mut self) {
        self.status = PreloadStatus::Complete;
        self.last_error = None;
        self.completed_at = Some(SystemTime::now());
    }

    /// Records a failure.
    ///
    /// Transient failures with retries left put the task back to pending and
    /// return true so the caller requeues it; anything else is terminal.
    pub fn record_failure(&mut self, error: PlayerError) -> bool {
        let retry = error.code.is_transient() && self.attempts <= self.max_retries;
        self.last_error = Some(error);
        if retry {
            self.status = PreloadStatus::Pending;
        } else {
            self.status = PreloadStatus::Error;
            self.completed_at = Some(SystemTime::now());
        }
        retry
    }
}
