//! beatstream-daemon: audio cache and gapless playback for streamed beats.
//!
//! This binary can run in two modes:
//! - CLI mode: one-shot cache maintenance (`--stats`, `--sweep`)
//! - Daemon mode: JSON-RPC server over stdio driving the player

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beatstream_daemon::cache::{BlobCacheStore, StoreSettings};
use beatstream_daemon::cli::Cli;
use beatstream_daemon::config::PlayerConfig;
use beatstream_daemon::playback::output::open_device;
use beatstream_daemon::playback::{AudioGraph, NullOutput, SharedGraph};
use beatstream_daemon::player::Player;
use beatstream_daemon::rpc::{run_server, ServerState};

/// How often the player polls playback events.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Render period of the headless output.
const NULL_OUTPUT_TICK: Duration = Duration::from_millis(20);

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse_args();

    let mut config = PlayerConfig::from_env();
    cli.apply(&mut config);
    if let Some(reason) = config.validate() {
        bail!("invalid configuration: {}", reason);
    }

    if cli.is_daemon_mode() {
        let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
        runtime.block_on(run_daemon_mode(config))
    } else if cli.is_cli_mode() {
        let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
        runtime.block_on(run_cli_mode(&cli, config))
    } else {
        print_usage();
        Ok(())
    }
}

/// Logs go to stderr; stdout carries JSON-RPC only.
fn init_logging() {
    let filter =
        EnvFilter::try_from_env("BEATSTREAM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Runs one cache maintenance command.
async fn run_cli_mode(cli: &Cli, config: PlayerConfig) -> anyhow::Result<()> {
    let store = BlobCacheStore::new(StoreSettings::from_config(&config, false));
    store.init().await;
    if store.is_memory_only().await {
        bail!(
            "cache directory {} is not usable",
            config.effective_cache_path().display()
        );
    }

    if cli.sweep {
        let removed = store.sweep_expired().await;
        eprintln!("Removed {} expired entries", removed);
    }
    if cli.stats {
        let stats = store.stats().await;
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    store.dispose().await;
    Ok(())
}

/// Runs the daemon mode (JSON-RPC server).
async fn run_daemon_mode(config: PlayerConfig) -> anyhow::Result<()> {
    let graph: SharedGraph = Arc::new(Mutex::new(AudioGraph::new(
        config.sample_rate,
        config.channels,
    )));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let player = Arc::new(Player::with_http(config, Arc::clone(&graph), events_tx));
    player.init().await;

    let capabilities = player.capabilities();
    info!(
        platform = %capabilities.platform,
        gapless = capabilities.gapless,
        memory_cache = capabilities.memory_cache,
        cache = %player.config().effective_cache_path().display(),
        "daemon starting"
    );

    // The stream must outlive the server loop.
    let stream = open_device(Arc::clone(&graph));
    let null_output = match &stream {
        Some(_) => None,
        None => Some(NullOutput::spawn(Arc::clone(&graph), NULL_OUTPUT_TICK)),
    };

    let cancel = CancellationToken::new();
    let ticker = player.spawn_ticker(TICK_INTERVAL, cancel.clone());

    let result = run_server(ServerState::new(Arc::clone(&player)), events_rx).await;

    cancel.cancel();
    ticker.await.ok();
    if let Some(output) = null_output {
        output.shutdown().await;
    }
    player.dispose().await;
    drop(stream);

    result.context("JSON-RPC server failed")
}

/// Prints usage information.
fn print_usage() {
    eprintln!("beatstream-daemon: audio cache and gapless playback for streamed beats");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  Daemon mode (JSON-RPC server):");
    eprintln!("    beatstream-daemon --daemon --api-url https://api.example.com");
    eprintln!();
    eprintln!("  Cache maintenance:");
    eprintln!("    beatstream-daemon --stats");
    eprintln!("    beatstream-daemon --sweep");
    eprintln!();
    eprintln!("Run 'beatstream-daemon --help' for full options.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_usage_doesnt_panic() {
        print_usage();
    }
}
