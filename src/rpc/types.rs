//! JSON-RPC types for the daemon protocol.
//!
//! Requests, results and notification payloads exchanged over stdio.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, PlayerError};
use crate::playback::PlayOutcome;
use crate::preload::BatchResult;
use crate::recovery::RecoveryStrategy;
use crate::types::Beat;

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Integer(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

/// A JSON-RPC request wrapper.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub id: RequestId,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A JSON-RPC response wrapper.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse<T: Serialize> {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub result: T,
}

impl<T: Serialize> JsonRpcResponse<T> {
    pub fn new(id: RequestId, result: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
        }
    }
}

/// A JSON-RPC error response.
#[derive(Debug, Serialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: &'static str,
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            error,
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonRpcErrorData>,
}

/// Extended error data for application-specific errors.
#[derive(Debug, Serialize)]
pub struct JsonRpcErrorData {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl JsonRpcError {
    /// Creates a parse error (-32700).
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
            data: None,
        }
    }

    /// Creates an invalid request error (-32600).
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a method not found error (-32601).
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    /// Creates an invalid params error (-32602).
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    /// Creates an internal error (-32603).
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }

    /// Maps a player error to an application error (-32000 to -32008).
    pub fn player(err: &PlayerError) -> Self {
        let code = match err.code {
            ErrorCode::NetworkError => -32000,
            ErrorCode::FormatError => -32001,
            ErrorCode::QuotaExceeded => -32002,
            ErrorCode::StaleUrl => -32003,
            ErrorCode::StorageUnavailable => -32004,
            ErrorCode::Cancelled => -32005,
            ErrorCode::InvalidState => -32006,
            ErrorCode::InvalidRequest => -32007,
            ErrorCode::PlaybackFailed => -32008,
        };
        Self {
            code,
            message: err.code.description().to_string(),
            data: Some(JsonRpcErrorData {
                error_code: err.code.as_str().to_string(),
                details: Some(err.message.clone()),
            }),
        }
    }
}

impl From<PlayerError> for JsonRpcError {
    fn from(err: PlayerError) -> Self {
        JsonRpcError::player(&err)
    }
}

// ============================================================================
// Requests and results
// ============================================================================

/// Parameters for `load_playlist`.
#[derive(Debug, Deserialize)]
pub struct LoadPlaylistParams {
    pub beats: Vec<Beat>,
    /// Start playing at this index right away.
    #[serde(default)]
    pub start: Option<usize>,
}

/// Parameters for `play`.
#[derive(Debug, Deserialize)]
pub struct PlayParams {
    pub index: usize,
    #[serde(default)]
    pub start_at_sec: f32,
}

impl PlayParams {
    /// Returns the start offset, rejecting values no `Duration` can hold.
    pub fn validate(&self) -> Result<Duration, JsonRpcError> {
        seconds("start_at_sec", self.start_at_sec)
    }
}

/// Parameters for `seek`.
#[derive(Debug, Deserialize)]
pub struct SeekParams {
    pub position_sec: f32,
}

impl SeekParams {
    pub fn validate(&self) -> Result<Duration, JsonRpcError> {
        seconds("position_sec", self.position_sec)
    }
}

fn seconds(field: &str, value: f32) -> Result<Duration, JsonRpcError> {
    Duration::try_from_secs_f32(value).map_err(|_| {
        JsonRpcError::invalid_params(format!(
            "{} must be a non-negative number of seconds, got {}",
            field, value
        ))
    })
}

/// Parameters for `volume`.
#[derive(Debug, Deserialize)]
pub struct VolumeParams {
    pub volume: f32,
}

/// Parameters for `preload`. Without beats, the upcoming entries of the
/// playlist are preloaded.
#[derive(Debug, Default, Deserialize)]
pub struct PreloadParams {
    #[serde(default)]
    pub beats: Option<Vec<Beat>>,
}

/// Result of `play`, `next`, `previous` and `load_playlist`.
#[derive(Debug, Serialize)]
pub struct PlayResult {
    pub status: Option<PlayOutcome>,
    pub beat_id: Option<String>,
    pub index: Option<usize>,
}

/// One entry of the `preload` result.
#[derive(Debug, Serialize)]
pub struct PreloadItem {
    pub beat_id: String,
    pub success: bool,
    pub attempts: u32,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&BatchResult> for PreloadItem {
    fn from(result: &BatchResult) -> Self {
        Self {
            beat_id: result.beat.id.clone(),
            success: result.success,
            attempts: result.attempts,
            cached: result.source.as_ref().is_some_and(|s| s.is_cached()),
            error: result.error.as_ref().map(|e| e.code.as_str().to_string()),
        }
    }
}

/// Result of `sweep`.
#[derive(Debug, Serialize)]
pub struct SweepResult {
    pub removed: usize,
}

// ============================================================================
// Notifications
// ============================================================================

/// A JSON-RPC notification (no id field).
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification<T: Serialize> {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: T,
}

impl<T: Serialize> JsonRpcNotification<T> {
    pub fn new(method: &'static str, params: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Sent when a track played to its end.
#[derive(Debug, Serialize)]
pub struct TrackEndedParams {
    pub beat_id: String,
}

/// Sent every 5% of a streamed download.
#[derive(Debug, Serialize)]
pub struct PreloadProgressParams {
    pub beat_id: String,
    pub bytes_received: u64,
    pub bytes_total: u64,
    pub percent: u8,
}

/// Sent for every playback error together with the chosen recovery.
#[derive(Debug, Serialize)]
pub struct PlaybackErrorParams {
    pub beat_id: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_error_code: Option<u16>,
    pub message: String,
    pub strategy: RecoveryStrategy,
    pub attempt: u32,
}

/// Sent when a play is waiting for a user gesture.
#[derive(Debug, Serialize)]
pub struct InteractionRequiredParams {
    pub beat_id: Option<String>,
}

/// Sent when a crossfade finished.
#[derive(Debug, Serialize)]
pub struct TransitionCompleteParams {
    pub beat_id: String,
}
