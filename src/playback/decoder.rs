//! Whole-track decoding into graph-ready buffers.
//!
//! Audio bytes are decoded with symphonia, mixed to the graph's channel
//! count and resampled to the graph's rate with rubato. The result is an
//! interleaved `f32` buffer that the mixer can play from any offset.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use crate::error::{ErrorCode, PlayerError, Result};

/// A fully decoded track in the graph's format.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Interleaved samples.
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    /// Wraps interleaved samples.
    pub fn from_interleaved(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
        }
    }

    /// Number of frames.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playing time.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}

/// Decodes `data` into a buffer at `target_rate` with `target_channels`.
///
/// `extension` is a format hint taken from the stored file name.
pub fn decode(
    data: Bytes,
    extension: Option<&str>,
    target_rate: u32,
    target_channels: u16,
) -> Result<DecodedAudio> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| {
            PlayerError::with_source(ErrorCode::FormatError, "unrecognized audio format", e)
        })?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| PlayerError::format("no supported audio tracks"))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| PlayerError::with_source(ErrorCode::FormatError, "unsupported codec", e))?;

    let mut interleaved: Vec<f32> = Vec::new();
    let mut source_rate = 0;
    let mut source_channels = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                return Err(PlayerError::with_source(ErrorCode::FormatError, "corrupt stream", e))
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                source_rate = spec.rate;
                source_channels = spec.channels.count();
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(buffer.samples());
            }
            Err(SymphoniaError::IoError(_)) => break,
            // A damaged packet is skipped; the rest of the track still plays.
            Err(SymphoniaError::DecodeError(reason)) => {
                debug!(reason, "skipping undecodable packet")
            }
            Err(e) => {
                return Err(PlayerError::with_source(ErrorCode::FormatError, "decoder failed", e))
            }
        }
    }

    if interleaved.is_empty() || source_channels == 0 || source_rate == 0 {
        return Err(PlayerError::format("no audio decoded"));
    }

    let mut planes = remix(&interleaved, source_channels, target_channels as usize);
    if source_rate != target_rate {
        planes = resample(planes, source_rate, target_rate)?;
    }

    debug!(
        source_rate,
        source_channels,
        frames = planes.first().map(Vec::len).unwrap_or(0),
        "track decoded"
    );
    Ok(DecodedAudio::from_interleaved(
        interleave(&planes),
        target_rate,
        target_channels,
    ))
}

/// Splits interleaved audio into `target` planar channels.
///
/// Mono output averages every source channel; otherwise output channel `c`
/// takes source channel `c % source`.
fn remix(interleaved: &[f32], source: usize, target: usize) -> Vec<Vec<f32>> {
    let frames = interleaved.len() / source;
    let mut planes = vec![Vec::with_capacity(frames); target];
    for frame in interleaved.chunks_exact(source) {
        if target == 1 {
            planes[0].push(frame.iter().sum::<f32>() / source as f32);
        } else {
            for (c, plane) in planes.iter_mut().enumerate() {
                plane.push(frame[c % source]);
            }
        }
    }
    planes
}

fn resample(planes: Vec<Vec<f32>>, from: u32, to: u32) -> Result<Vec<Vec<f32>>> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let frames = planes.first().map(Vec::len).unwrap_or(0);
    let ratio = to as f64 / from as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, frames, planes.len())
        .map_err(|e| {
            PlayerError::with_source(ErrorCode::FormatError, "resampler setup failed", e)
        })?;
    resampler
        .process(&planes, None)
        .map_err(|e| PlayerError::with_source(ErrorCode::FormatError, "resampling failed", e))
}

fn interleave(planes: &[Vec<f32>]) -> Vec<f32> {
    let frames = planes.first().map(Vec::len).unwrap_or(0);
    let mut out = Vec::with_capacity(frames * planes.len());
    for i in 0..frames {
        for plane in planes {
            out.push(plane[i]);
        }
    }
    out
}

/// File extension of a stored file name, used as a decoder hint.
pub fn extension_hint(file_name: &str) -> Option<&str> {
    let (_, ext) = file_name.rsplit_once('.')?;
    (!ext.is_empty() && !ext.contains('/')).then_some(ext)
}
