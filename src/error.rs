//! Error types for the beatstream daemon.
//!
//! Defines the error codes and the error type shared by the cache,
//! preloader, playback and recovery layers so every failure can be turned
//! into a recovery decision at the subsystem boundary.

use std::fmt;
use std::sync::Arc;

/// Error codes carried by every [`PlayerError`].
///
/// These codes are reported in JSON-RPC error responses and drive the
/// recovery strategy chosen for a failing beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Fetch rejected, connection refused, CORS-style refusal or timeout.
    NetworkError,

    /// Decode failure, unsupported codec or a transcode that never landed.
    FormatError,

    /// Storage budget exceeded. Non-fatal, resolved by eviction.
    QuotaExceeded,

    /// Signed URL expired (HTTP 403/404 on use).
    StaleUrl,

    /// Persistent store could not be opened or written.
    StorageUnavailable,

    /// Preload or load was cancelled before it finished.
    Cancelled,

    /// Operation not allowed in the current playback state.
    InvalidState,

    /// Malformed request or metadata.
    InvalidRequest,

    /// Output or graph failure not covered by another code.
    PlaybackFailed,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::FormatError => "FORMAT_ERROR",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::StaleUrl => "STALE_URL",
            ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::PlaybackFailed => "PLAYBACK_FAILED",
        }
    }

    /// Returns a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "Audio could not be fetched from the network",
            ErrorCode::FormatError => "Audio data could not be decoded",
            ErrorCode::QuotaExceeded => "Cache storage budget exceeded",
            ErrorCode::StaleUrl => "Signed URL expired or no longer valid",
            ErrorCode::StorageUnavailable => "Persistent audio cache is unavailable",
            ErrorCode::Cancelled => "Operation was cancelled",
            ErrorCode::InvalidState => "Operation not valid in the current playback state",
            ErrorCode::InvalidRequest => "Request or beat metadata is invalid",
            ErrorCode::PlaybackFailed => "Audio output failed",
        }
    }

    /// Returns a recovery hint suggesting how to resolve this error.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => {
                "Check the connection to object storage; the beat is retried with backoff \
                 and skipped after repeated failures"
            }
            ErrorCode::FormatError => {
                "The file may be corrupt or in an unsupported codec; request a transcode \
                 or an alternate format"
            }
            ErrorCode::QuotaExceeded => {
                "Lower BEATSTREAM_PERSISTENT_BUDGET_MB or run the `sweep` maintenance call"
            }
            ErrorCode::StaleUrl => "Request a fresh signed URL from the beats API",
            ErrorCode::StorageUnavailable => {
                "Verify BEATSTREAM_CACHE_PATH is writable; playback continues memory-only"
            }
            ErrorCode::Cancelled => "Nothing to do; the request was superseded",
            ErrorCode::InvalidState => "Load a playlist or start playback first",
            ErrorCode::InvalidRequest => {
                "Beats need a non-empty user_id and audio file name"
            }
            ErrorCode::PlaybackFailed => "Check the audio output device and restart the daemon",
        }
    }

    /// Media error code (1 aborted, 2 network, 3 decode, 4 unsupported
    /// source) this code is reported as, if any.
    pub fn media_error_code(&self) -> Option<u16> {
        match self {
            ErrorCode::Cancelled => Some(1),
            ErrorCode::NetworkError | ErrorCode::StaleUrl => Some(2),
            ErrorCode::FormatError => Some(3),
            _ => None,
        }
    }

    /// Returns true for failures worth retrying within a preload batch.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCode::NetworkError | ErrorCode::StaleUrl)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for player operations.
///
/// Cloneable so a single failure can be handed to every caller awaiting a
/// shared preload.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{code}] {message}. Recovery: {}", .code.recovery_hint())]
pub struct PlayerError {
    /// The error code identifying the type of error.
    pub code: ErrorCode,
    /// Human-readable error message with context.
    pub message: String,
    /// Optional underlying cause of the error.
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl PlayerError {
    /// Creates a new PlayerError with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new PlayerError with an underlying cause.
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a NETWORK_ERROR error.
    pub fn network(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, reason)
    }

    /// Creates a FORMAT_ERROR error.
    pub fn format(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::FormatError,
            format!("Failed to decode audio: {}", reason.into()),
        )
    }

    /// Creates a QUOTA_EXCEEDED error.
    pub fn quota_exceeded(size: u64, budget: u64) -> Self {
        Self::new(
            ErrorCode::QuotaExceeded,
            format!("Blob of {} bytes exceeds cache budget of {} bytes", size, budget),
        )
    }

    /// Creates a STALE_URL error for an HTTP status seen on use.
    pub fn stale_url(status: u16) -> Self {
        Self::new(
            ErrorCode::StaleUrl,
            format!("Signed URL rejected with HTTP {}", status),
        )
    }

    /// Creates a STORAGE_UNAVAILABLE error.
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::StorageUnavailable,
            format!("Persistent store failed: {}", reason.into()),
        )
    }

    /// Creates a CANCELLED error.
    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, format!("Cancelled: {}", what.into()))
    }

    /// Creates an INVALID_STATE error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, reason)
    }

    /// Creates an INVALID_REQUEST error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, reason)
    }

    /// Creates a PLAYBACK_FAILED error.
    pub fn playback(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::PlaybackFailed, reason)
    }
}

impl From<reqwest::Error> for PlayerError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 403 || status.as_u16() == 404 => {
                let mut stale = PlayerError::stale_url(status.as_u16());
                stale.source = Some(Arc::new(err));
                stale
            }
            _ => PlayerError::with_source(
                ErrorCode::NetworkError,
                format!("Request failed: {}", err),
                err,
            ),
        }
    }
}

impl From<std::io::Error> for PlayerError {
    fn from(err: std::io::Error) -> Self {
        PlayerError::with_source(
            ErrorCode::StorageUnavailable,
            format!("I/O error: {}", err),
            err,
        )
    }
}

/// Result type alias using PlayerError.
pub type Result<T> = std::result::Result<T, PlayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_as_str() {
        assert_eq!(ErrorCode::NetworkError.as_str(), "NETWORK_ERROR");
        assert_eq!(ErrorCode::FormatError.as_str(), "FORMAT_ERROR");
        assert_eq!(ErrorCode::QuotaExceeded.as_str(), "QUOTA_EXCEEDED");
        assert_eq!(ErrorCode::StaleUrl.as_str(), "STALE_URL");
        assert_eq!(ErrorCode::StorageUnavailable.as_str(), "STORAGE_UNAVAILABLE");
        assert_eq!(ErrorCode::Cancelled.as_str(), "CANCELLED");
        assert_eq!(ErrorCode::InvalidState.as_str(), "INVALID_STATE");
    }

    #[test]
    fn error_code_recovery_hints_not_empty() {
        for code in [
            ErrorCode::NetworkError,
            ErrorCode::FormatError,
            ErrorCode::QuotaExceeded,
            ErrorCode::StaleUrl,
            ErrorCode::StorageUnavailable,
            ErrorCode::Cancelled,
            ErrorCode::InvalidState,
            ErrorCode::InvalidRequest,
            ErrorCode::PlaybackFailed,
        ] {
            assert!(!code.recovery_hint().is_empty());
            assert!(!code.description().is_empty());
        }
    }

    #[test]
    fn media_error_codes() {
        assert_eq!(ErrorCode::Cancelled.media_error_code(), Some(1));
        assert_eq!(ErrorCode::NetworkError.media_error_code(), Some(2));
        assert_eq!(ErrorCode::StaleUrl.media_error_code(), Some(2));
        assert_eq!(ErrorCode::FormatError.media_error_code(), Some(3));
        assert_eq!(ErrorCode::QuotaExceeded.media_error_code(), None);
    }

    #[test]
    fn player_error_display() {
        let err = PlayerError::stale_url(403);
        assert!(err.to_string().contains("STALE_URL"));
        assert!(err.to_string().contains("403"));
        assert!(err.to_string().contains("Recovery:"));
    }

    #[test]
    fn player_error_is_cloneable_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: PlayerError = io.into();
        let copy = err.clone();
        assert_eq!(copy.code, ErrorCode::StorageUnavailable);
        assert!(std::error::Error::source(&copy).is_some());
    }
}
