//! Audio output for the graph.
//!
//! [`GraphSource`] exposes the graph as a rodio [`Source`] so the device
//! callback drives the audio clock. When no device is available,
//! [`NullOutput`] renders the graph in real time into nothing so playback
//! still progresses.

use std::time::Duration;

use rodio::Source;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{lock_graph, SharedGraph};

/// Frames rendered per graph lock.
const RENDER_FRAMES: usize = 512;

/// Endless rodio source pulling from the graph.
pub struct GraphSource {
    graph: SharedGraph,
    buffer: Vec<f32>,
    position: usize,
    channels: u16,
    sample_rate: u32,
}

impl GraphSource {
    pub fn new(graph: SharedGraph) -> Self {
        let (channels, sample_rate) = {
            let g = lock_graph(&graph);
            (g.channels(), g.sample_rate())
        };
        Self {
            graph,
            buffer: vec![0.0; RENDER_FRAMES * channels as usize],
            position: RENDER_FRAMES * channels as usize,
            channels,
            sample_rate,
        }
    }
}

impl Iterator for GraphSource {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.buffer.len() {
            lock_graph(&self.graph).render(&mut self.buffer);
            self.position = 0;
        }
        let sample = self.buffer[self.position];
        self.position += 1;
        Some(sample)
    }
}

impl Source for GraphSource {
    fn current_span_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Opens the default output device and attaches the graph to it.
///
/// The returned stream must stay alive for as long as audio should play.
pub fn open_device(graph: SharedGraph) -> Option<rodio::OutputStream> {
    match rodio::OutputStreamBuilder::open_default_stream() {
        Ok(stream) => {
            stream.mixer().add(GraphSource::new(graph));
            info!("audio output opened");
            Some(stream)
        }
        Err(e) => {
            warn!(error = %e, "no audio output device");
            None
        }
    }
}

/// Renders the graph on a timer without a device.
pub struct NullOutput {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NullOutput {
    /// Spawns the render loop on the current runtime.
    pub fn spawn(graph: SharedGraph, tick: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            let mut scratch = Vec::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let mut graph = lock_graph(&graph);
                        let frames = graph.duration_to_frames(tick) as usize;
                        scratch.resize(frames * graph.channels() as usize, 0.0);
                        graph.render(&mut scratch);
                    }
                }
            }
        });
        info!("rendering audio without an output device");
        Self { cancel, task }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.task.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{AudioGraph, DecodedAudio};
    use std::sync::{Arc, Mutex};

    #[test]
    fn source_pulls_rendered_audio() {
        let graph = Arc::new(Mutex::new(AudioGraph::new(1000, 2)));
        let voice = {
            let mut g = lock_graph(&graph);
            let v = g.add_voice(
                Arc::new(DecodedAudio::from_interleaved(vec![0.25; 2000], 1000, 2)),
                1.0,
            );
            g.start(v, Duration::ZERO);
            v
        };

        let mut source = GraphSource::new(Arc::clone(&graph));
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), 1000);
        let first: Vec<f32> = source.by_ref().take(4).collect();
        assert_eq!(first, vec![0.25; 4]);
        assert_eq!(lock_graph(&graph).clock(), RENDER_FRAMES as u64);
        assert!(lock_graph(&graph).position(voice).is_some());
    }

    #[tokio::test]
    async fn null_output_advances_clock() {
        let graph = Arc::new(Mutex::new(AudioGraph::new(1000, 1)));
        let output = NullOutput::spawn(Arc::clone(&graph), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        output.shutdown().await;
        assert!(lock_graph(&graph).clock() > 0);
    }
}
