//! Stall detection for track loads.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{PlayerError, Result};
use crate::preload::{AudioFetcher, ProbeOutcome};

/// Awaits `load`, probing `url` if it takes longer than `timeout`.
///
/// A reachable URL keeps the load running; a stale or unreachable one fails
/// it with an error the recovery rules understand. Loads without a URL
/// (cached blobs) are never probed.
pub async fn watch_stall<T, F>(
    load: F,
    url: Option<&str>,
    fetcher: &dyn AudioFetcher,
    timeout: Duration,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(url) = url else {
        return load.await;
    };
    tokio::pin!(load);

    tokio::select! {
        result = &mut load => return result,
        _ = tokio::time::sleep(timeout) => {}
    }

    warn!(url, timeout_ms = timeout.as_millis() as u64, "load stalled, probing source");
    match fetcher.probe(url).await {
        ProbeOutcome::Reachable => {
            debug!(url, "source reachable, still waiting");
            load.await
        }
        ProbeOutcome::Stale(status) => Err(PlayerError::stale_url(status)),
        ProbeOutcome::Unreachable(reason) => Err(PlayerError::network(format!(
            "stalled load, source unreachable: {}",
            reason
        ))),
    }
}
