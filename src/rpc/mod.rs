//! JSON-RPC module for daemon communication.
//!
//! Provides the JSON-RPC 2.0 server implementation for:
//! - `load_playlist`, `play`, `next`, `previous`: Playlist control
//! - `pause`, `resume`, `seek`, `volume`, `progress`: Transport
//! - `preload`, `cache_stats`, `sweep`, `clear_cache`: Cache control
//! - `interaction`: User gesture for deferred playback
//! - `ping`: Health check
//! - `shutdown`: Graceful shutdown
//!
//! Notifications:
//! - `track_ended`, `transition_complete`: Track boundaries
//! - `preload_progress`: Download progress in 5% steps
//! - `playback_error`: A playback failure and its recovery strategy
//! - `interaction_required`: Playback waits for a user gesture

pub mod methods;
pub mod server;
pub mod types;

// Re-export commonly used types
pub use server::{notify, run_server, send_notification, ServerState};
pub use types::{
    JsonRpcError, JsonRpcErrorResponse, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    LoadPlaylistParams, PlayParams, PlayResult, PreloadItem, PreloadParams, RequestId,
};
