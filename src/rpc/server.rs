//! JSON-RPC server over stdin/stdout.
//!
//! Implements the JSON-RPC 2.0 protocol for daemon communication. Player
//! events are forwarded to stdout as notifications while requests are
//! served.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::player::{Player, PlayerEvent};

use super::methods::handle_request;
use super::types::{
    InteractionRequiredParams, JsonRpcError, JsonRpcErrorResponse, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, PlaybackErrorParams, PreloadProgressParams,
    TrackEndedParams, TransitionCompleteParams,
};

/// State shared across all request handlers.
pub struct ServerState {
    /// The player serving requests.
    pub player: Arc<Player>,
    /// Flag to signal server shutdown.
    shutdown: Arc<AtomicBool>,
}

impl ServerState {
    /// Creates new server state.
    pub fn new(player: Arc<Player>) -> Self {
        Self {
            player,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Returns true if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Methods served on their own task. They may wait on fetches, decodes or
/// recovery backoff; a newer play request supersedes an older one.
const SPAWNED_METHODS: &[&str] = &["load_playlist", "play", "next", "previous", "interaction"];

/// Runs the JSON-RPC server, reading from stdin and writing to stdout.
///
/// Returns when stdin closes or `shutdown` is called.
pub async fn run_server(
    state: ServerState,
    events: mpsc::UnboundedReceiver<PlayerEvent>,
) -> Result<()> {
    let forwarder = tokio::spawn(forward_events(events));
    info!("JSON-RPC server started, waiting for requests");
    let result = serve(
        Arc::new(state),
        BufReader::new(tokio::io::stdin()),
        write_line,
    )
    .await;
    forwarder.abort();
    info!("JSON-RPC server stopped");
    result
}

/// Serves requests line by line from `reader`, handing each response line
/// to `write`.
async fn serve<R, W>(state: Arc<ServerState>, reader: R, write: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Fn(&str) + Clone + Send + 'static,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "error reading stdin");
                break;
            }
        };

        // Skip empty lines
        if line.trim().is_empty() {
            continue;
        }

        match parse_request(&line) {
            Err(response) => write(&response),
            Ok(request) if SPAWNED_METHODS.contains(&request.method.as_str()) => {
                let state = Arc::clone(&state);
                let write = write.clone();
                tokio::spawn(async move {
                    let response = dispatch(request, &state).await;
                    write(&response);
                });
            }
            Ok(request) => write(&dispatch(request, &state).await),
        }

        if state.is_shutdown() {
            info!("server shutdown requested");
            break;
        }
    }
    Ok(())
}

/// Parses and checks a request line. On failure, returns the error
/// response to send.
fn parse_request(line: &str) -> std::result::Result<JsonRpcRequest, String> {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            let error = JsonRpcErrorResponse::new(
                None,
                JsonRpcError::parse_error(format!("Invalid JSON: {}", e)),
            );
            return Err(serde_json::to_string(&error).unwrap_or_default());
        }
    };

    if request.jsonrpc != "2.0" {
        let error = JsonRpcErrorResponse::new(
            Some(request.id),
            JsonRpcError::invalid_request("Invalid JSON-RPC version (expected 2.0)"),
        );
        return Err(serde_json::to_string(&error).unwrap_or_default());
    }
    Ok(request)
}

/// Runs a parsed request and serializes its response.
async fn dispatch(request: JsonRpcRequest, state: &ServerState) -> String {
    debug!(method = %request.method, "request");
    match handle_request(&request.method, request.params, state).await {
        Ok(response) => {
            serde_json::to_string(&JsonRpcResponse::new(request.id, response)).unwrap_or_default()
        }
        Err(error) => serde_json::to_string(&JsonRpcErrorResponse::new(Some(request.id), error))
            .unwrap_or_default(),
    }
}

/// Writes one line to stdout under the stdout lock.
fn write_line(line: &str) {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", line).ok();
    stdout.flush().ok();
}

/// Sends a JSON-RPC notification to stdout.
pub fn send_notification<T: serde::Serialize>(method: &'static str, params: T) {
    let notification = JsonRpcNotification::new(method, params);
    if let Ok(json) = serde_json::to_string(&notification) {
        write_line(&json);
    }
}

async fn forward_events(mut events: mpsc::UnboundedReceiver<PlayerEvent>) {
    while let Some(event) = events.recv().await {
        notify(event);
    }
}

/// Maps a player event onto its notification.
pub fn notify(event: PlayerEvent) {
    match event {
        PlayerEvent::TrackEnded { beat_id } => {
            send_notification("track_ended", TrackEndedParams { beat_id })
        }
        PlayerEvent::PreloadProgress {
            beat_id,
            received,
            total,
            percent,
        } => send_notification(
            "preload_progress",
            PreloadProgressParams {
                beat_id,
                bytes_received: received,
                bytes_total: total,
                percent,
            },
        ),
        PlayerEvent::PlaybackError {
            beat_id,
            code,
            message,
            strategy,
            attempt,
        } => send_notification(
            "playback_error",
            PlaybackErrorParams {
                beat_id,
                code: code.as_str().to_string(),
                media_error_code: code.media_error_code(),
                message,
                strategy,
                attempt,
            },
        ),
        PlayerEvent::InteractionRequired { beat_id } => {
            send_notification("interaction_required", InteractionRequiredParams { beat_id })
        }
        PlayerEvent::TransitionComplete { beat_id } => {
            send_notification("transition_complete", TransitionCompleteParams { beat_id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Platform, PlayerConfig};
    use crate::playback::test_support::{wav_bytes, CdnUrls, GatedFetcher, StaticFetcher};
    use crate::playback::AudioGraph;
    use crate::player::LoggingMediaSession;
    use crate::types::Beat;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn process_request(line: &str, state: &ServerState) -> String {
        match parse_request(line) {
            Ok(request) => dispatch(request, state).await,
            Err(response) => response,
        }
    }

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

    #[test]
    fn server_state_shutdown() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        assert!(!state.is_shutdown());
        state.shutdown();
        assert!(state.is_shutdown());
    }

    #[tokio::test]
    async fn process_invalid_json() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let response = process_request("not json", &state).await;
        assert!(response.contains("-32700"));
    }

    #[tokio::test]
    async fn process_invalid_version() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let request = r#"{"jsonrpc":"1.0","method":"ping","id":1}"#;
        let response = process_request(request, &state).await;
        assert!(response.contains("-32600"));
    }

    #[tokio::test]
    async fn process_unknown_method() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let request = r#"{"jsonrpc":"2.0","method":"unknown","id":1}"#;
        let response = process_request(request, &state).await;
        assert!(response.contains("-32601"));
    }

    #[tokio::test]
    async fn process_ping() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let request = r#"{"jsonrpc":"2.0","method":"ping","id":"p"}"#;
        let response = process_request(request, &state).await;
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["id"], "p");
        assert_eq!(value["result"]["status"], "ok");
    }

    #[tokio::test]
    async fn pause_is_answered_while_play_is_pending() {
        let dir = TempDir::new().unwrap();
        let url = "https://cdn.test/a.wav";
        let mut inner = StaticFetcher::default();
        inner.bodies.insert(url.to_string(), wav_bytes(8_000, 1, 0.5));
        let fetcher = Arc::new(GatedFetcher::new(inner, &[url]));

        let config = PlayerConfig {
            cache_path: Some(dir.path().to_path_buf()),
            platform: Platform::Desktop,
            preload_count: 0,
            ..PlayerConfig::default()
        };
        let graph = Arc::new(Mutex::new(AudioGraph::new(8_000, 1)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let player = Arc::new(Player::new(
            config,
            graph,
            fetcher.clone(),
            Arc::new(CdnUrls),
            Arc::new(LoggingMediaSession),
            tx,
        ));
        player.init().await;
        player
            .load_playlist(vec![Beat::new("a", "u1", "a.wav", "A")], None)
            .await
            .unwrap();
        let state = Arc::new(ServerState::new(player));

        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"play","params":{"index":0},"id":1}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"pause","id":2}"#,
            "\n",
        );
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let write = move |line: &str| {
            out_tx.send(line.to_string()).ok();
        };
        serve(Arc::clone(&state), BufReader::new(input.as_bytes()), write)
            .await
            .unwrap();

        let first: Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["id"], 2);
        assert_eq!(first["result"]["paused"], true);
        assert!(out_rx.try_recv().is_err());

        fetcher.open();
        let second = timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second: Value = serde_json::from_str(&second).unwrap();
        assert_eq!(second["id"], 1);
        assert_eq!(second["result"]["status"], "started");
        assert_eq!(second["result"]["beat_id"], "a");
    }
}
