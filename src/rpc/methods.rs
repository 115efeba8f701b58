//! JSON-RPC method handlers.
//!
//! Implements the handlers for all supported JSON-RPC methods. Commands
//! that come from the user (play, next, previous, resume, interaction)
//! count as user gestures.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::playback::PlayOutcome;

use super::server::ServerState;
use super::types::{
    JsonRpcError, LoadPlaylistParams, PlayParams, PlayResult, PreloadItem, PreloadParams,
    SeekParams, SweepResult, VolumeParams,
};

type MethodResult = Result<Value, JsonRpcError>;

/// Handles a JSON-RPC method call.
pub async fn handle_request(method: &str, params: Value, state: &ServerState) -> MethodResult {
    match method {
        "ping" => handle_ping(),
        "shutdown" => handle_shutdown(state).await,
        "load_playlist" => handle_load_playlist(params, state).await,
        "play" => handle_play(params, state).await,
        "next" => {
            let outcome = state.player.next().await?;
            play_result(state, Some(outcome)).await
        }
        "previous" => {
            let outcome = state.player.previous().await?;
            play_result(state, Some(outcome)).await
        }
        "pause" => {
            state.player.pause().await;
            to_value(state.player.status().await)
        }
        "resume" => {
            state.player.resume().await;
            to_value(state.player.status().await)
        }
        "seek" => handle_seek(params, state).await,
        "volume" => handle_volume(params, state).await,
        "progress" => to_value(state.player.status().await),
        "preload" => handle_preload(params, state).await,
        "cache_stats" => to_value(state.player.cache_stats().await),
        "sweep" => {
            let removed = state.player.sweep().await;
            to_value(SweepResult { removed })
        }
        "clear_cache" => {
            state.player.clear_cache().await;
            Ok(serde_json::json!({ "status": "cleared" }))
        }
        "interaction" => {
            let outcome = state.player.interaction().await?;
            play_result(state, outcome).await
        }
        _ => Err(JsonRpcError::method_not_found(method)),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, JsonRpcError> {
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T) -> MethodResult {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

async fn play_result(state: &ServerState, status: Option<PlayOutcome>) -> MethodResult {
    let current = state.player.status().await;
    to_value(PlayResult {
        status,
        beat_id: current.beat_id,
        index: current.index,
    })
}

/// Handles the ping method for health checks.
fn handle_ping() -> MethodResult {
    Ok(serde_json::json!({ "status": "ok" }))
}

/// Handles the shutdown method.
async fn handle_shutdown(state: &ServerState) -> MethodResult {
    state.shutdown();
    Ok(serde_json::json!({ "status": "shutting_down" }))
}

async fn handle_load_playlist(params: Value, state: &ServerState) -> MethodResult {
    let params: LoadPlaylistParams = parse(params)?;
    let outcome = state.player.load_playlist(params.beats, params.start).await?;
    play_result(state, outcome).await
}

async fn handle_play(params: Value, state: &ServerState) -> MethodResult {
    let params: PlayParams = parse(params)?;
    let start_at = params.validate()?;
    let outcome = state.player.play_index(params.index, start_at).await?;
    play_result(state, Some(outcome)).await
}

async fn handle_seek(params: Value, state: &ServerState) -> MethodResult {
    let params: SeekParams = parse(params)?;
    let position = params.validate()?;
    state.player.seek(position).await?;
    to_value(state.player.status().await)
}

async fn handle_volume(params: Value, state: &ServerState) -> MethodResult {
    let params: VolumeParams = parse(params)?;
    if !params.volume.is_finite() {
        return Err(JsonRpcError::invalid_params("volume must be a number"));
    }
    state.player.set_volume(params.volume).await;
    Ok(serde_json::json!({ "volume": params.volume.clamp(0.0, 1.0) }))
}

async fn handle_preload(params: Value, state: &ServerState) -> MethodResult {
    let params: PreloadParams = if params.is_null() {
        PreloadParams::default()
    } else {
        parse(params)?
    };
    let results = state.player.preload(params.beats).await;
    let items: Vec<PreloadItem> = results.iter().map(PreloadItem::from).collect();
    to_value(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Platform, PlayerConfig};
    use crate::playback::AudioGraph;
    use crate::player::Player;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_state(dir: &TempDir) -> ServerState {
        let config = PlayerConfig {
            cache_path: Some(dir.path().to_path_buf()),
            platform: Platform::Desktop,
            api_base_url: "http://127.0.0.1:9".to_string(),
            ..PlayerConfig::default()
        };
        let graph = Arc::new(Mutex::new(AudioGraph::new(8_000, 1)));
        let (tx, _rx) = mpsc::unbounded_channel();
        ServerState::new(Arc::new(Player::with_http(config, graph, tx)))
    }

    #[tokio::test]
    async fn ping() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let result = handle_request("ping", Value::Null, &state).await.unwrap();
        assert_eq!(result["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_method() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let err = handle_request("generate", Value::Null, &state).await.unwrap_err();
        assert_eq!(err.code, -32601);
    }

    #[tokio::test]
    async fn shutdown_sets_flag() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        handle_request("shutdown", Value::Null, &state).await.unwrap();
        assert!(state.is_shutdown());
    }

    #[tokio::test]
    async fn play_with_bad_params() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let err = handle_request("play", serde_json::json!({ "index": "x" }), &state)
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn play_with_huge_offset_is_invalid_params() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let params = serde_json::json!({ "index": 0, "start_at_sec": 1e20 });
        let err = handle_request("play", params, &state).await.unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn seek_with_huge_position_is_invalid_params() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let params = serde_json::json!({ "position_sec": 1e20 });
        let err = handle_request("seek", params, &state).await.unwrap_err();
        assert_eq!(err.code, -32602);

        let params = serde_json::json!({ "position_sec": -3.0 });
        let err = handle_request("seek", params, &state).await.unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn play_outside_playlist_is_player_error() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let err = handle_request("play", serde_json::json!({ "index": 0 }), &state)
            .await
            .unwrap_err();
        assert_eq!(err.code, -32007);
    }

    #[tokio::test]
    async fn next_on_empty_playlist_is_invalid_state() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let err = handle_request("next", Value::Null, &state).await.unwrap_err();
        assert_eq!(err.code, -32006);
    }

    #[tokio::test]
    async fn load_empty_playlist_and_report_progress() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let result = handle_request("load_playlist", serde_json::json!({ "beats": [] }), &state)
            .await
            .unwrap();
        assert!(result["status"].is_null());

        let progress = handle_request("progress", Value::Null, &state).await.unwrap();
        assert_eq!(progress["playlist_len"], 0);
        assert_eq!(progress["backend"], "gapless");
    }

    #[tokio::test]
    async fn cache_methods() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state.player.init().await;

        let stats = handle_request("cache_stats", Value::Null, &state).await.unwrap();
        assert_eq!(stats["persistent_entries"], 0);

        let swept = handle_request("sweep", Value::Null, &state).await.unwrap();
        assert_eq!(swept["removed"], 0);

        let cleared = handle_request("clear_cache", Value::Null, &state).await.unwrap();
        assert_eq!(cleared["status"], "cleared");
    }

    #[tokio::test]
    async fn preload_without_playlist_is_empty() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let result = handle_request("preload", Value::Null, &state).await.unwrap();
        assert_eq!(result, serde_json::json!([]));
    }

    #[tokio::test]
    async fn volume_validates() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let result = handle_request("volume", serde_json::json!({ "volume": 2.0 }), &state)
            .await
            .unwrap();
        assert_eq!(result["volume"], 1.0);
    }
}
