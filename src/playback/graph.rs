//! Software audio graph.
//!
//! A mixer of decoded voices, each behind its own gain node, summed into a
//! master gain. The graph owns the audio clock: it advances by one frame for
//! every frame rendered, so gain ramps scheduled against it are sample
//! accurate no matter who pulls the audio (the output device or a test).

use std::sync::Arc;
use std::time::Duration;

use super::decoder::DecodedAudio;

/// Identifies a voice in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(u64);

/// Linear gain automation on the audio clock.
#[derive(Debug, Clone, Copy)]
struct GainRamp {
    from: f32,
    to: f32,
    start: u64,
    end: u64,
}

#[derive(Debug, Clone, Copy)]
struct GainParam {
    value: f32,
    ramp: Option<GainRamp>,
}

impl GainParam {
    fn fixed(value: f32) -> Self {
        Self { value, ramp: None }
    }

    fn at(&self, clock: u64) -> f32 {
        match self.ramp {
            Some(ramp) if clock >= ramp.end => ramp.to,
            Some(ramp) if clock <= ramp.start => ramp.from,
            Some(ramp) => {
                let t = (clock - ramp.start) as f32 / (ramp.end - ramp.start) as f32;
                ramp.from + (ramp.to - ramp.from) * t
            }
            None => self.value,
        }
    }

    /// Folds a finished ramp into the fixed value.
    fn settle(&mut self, clock: u64) {
        if let Some(ramp) = self.ramp {
            if clock >= ramp.end {
                self.value = ramp.to;
                self.ramp = None;
            }
        }
    }
}

#[derive(Debug)]
struct Voice {
    id: VoiceId,
    audio: Arc<DecodedAudio>,
    /// Next frame to play.
    frame: usize,
    gain: GainParam,
    started: bool,
    ended: bool,
}

/// The mixer graph.
#[derive(Debug)]
pub struct AudioGraph {
    sample_rate: u32,
    channels: u16,
    clock: u64,
    voices: Vec<Voice>,
    master: f32,
    suspended: bool,
    next_id: u64,
    ended: Vec<VoiceId>,
}

impl AudioGraph {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            clock: 0,
            voices: Vec::new(),
            master: 1.0,
            suspended: false,
            next_id: 0,
            ended: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Frames rendered so far.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// The audio clock as time.
    pub fn current_time(&self) -> Duration {
        self.frames_to_duration(self.clock)
    }

    pub fn duration_to_frames(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as u64
    }

    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }

    /// Adds a voice that stays silent and still until [`start`](Self::start).
    pub fn add_voice(&mut self, audio: Arc<DecodedAudio>, gain: f32) -> VoiceId {
        self.next_id += 1;
        let id = VoiceId(self.next_id);
        self.voices.push(Voice {
            id,
            audio,
            frame: 0,
            gain: GainParam::fixed(gain),
            started: false,
            ended: false,
        });
        id
    }

    /// Starts a voice at `offset` into its buffer.
    pub fn start(&mut self, id: VoiceId, offset: Duration) -> bool {
        let frame = self.duration_to_frames(offset) as usize;
        match self.voice_mut(id) {
            Some(voice) => {
                voice.frame = frame.min(voice.audio.frames());
                voice.started = true;
                true
            }
            None => false,
        }
    }

    /// Removes a voice. Stopping is silent; no ended event is queued.
    pub fn stop(&mut self, id: VoiceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.ended.retain(|e| *e != id);
        self.voices.len() != before
    }

    /// Sets a voice's gain now, cancelling any ramp.
    pub fn set_gain(&mut self, id: VoiceId, value: f32) {
        if let Some(voice) = self.voice_mut(id) {
            voice.gain = GainParam::fixed(value);
        }
    }

    /// Ramps a voice's gain linearly from its current value to `target`,
    /// starting now and lasting `duration` on the audio clock.
    pub fn ramp_gain(&mut self, id: VoiceId, target: f32, duration: Duration) {
        let start = self.clock;
        let end = start + self.duration_to_frames(duration).max(1);
        if let Some(voice) = self.voice_mut(id) {
            let from = voice.gain.at(start);
            voice.gain = GainParam {
                value: from,
                ramp: Some(GainRamp {
                    from,
                    to: target,
                    start,
                    end,
                }),
            };
        }
    }

    /// Gain of a voice at the current clock.
    pub fn gain(&self, id: VoiceId) -> Option<f32> {
        self.voice(id).map(|v| v.gain.at(self.clock))
    }

    /// Playback position of a voice.
    pub fn position(&self, id: VoiceId) -> Option<Duration> {
        self.voice(id)
            .map(|v| self.frames_to_duration(v.frame as u64))
    }

    /// Moves a voice to `position`.
    pub fn seek(&mut self, id: VoiceId, position: Duration) -> bool {
        let frame = self.duration_to_frames(position) as usize;
        match self.voice_mut(id) {
            Some(voice) => {
                voice.frame = frame.min(voice.audio.frames());
                voice.ended = false;
                true
            }
            None => false,
        }
    }

    pub fn is_started(&self, id: VoiceId) -> bool {
        self.voice(id).is_some_and(|v| v.started)
    }

    pub fn has_ended(&self, id: VoiceId) -> bool {
        self.voice(id).is_some_and(|v| v.ended)
    }

    pub fn contains(&self, id: VoiceId) -> bool {
        self.voice(id).is_some()
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn set_master_gain(&mut self, gain: f32) {
        self.master = gain;
    }

    pub fn master_gain(&self) -> f32 {
        self.master
    }

    /// Suspends rendering. The clock stops while suspended.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Voices that reached the end of their buffer since the last call.
    pub fn take_ended(&mut self) -> Vec<VoiceId> {
        std::mem::take(&mut self.ended)
    }

    /// Renders interleaved frames into `out`.
    ///
    /// `out.len()` should be a multiple of the channel count; a trailing
    /// partial frame is left silent.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        if self.suspended {
            return;
        }

        let channels = self.channels as usize;
        for frame_out in out.chunks_exact_mut(channels) {
            let clock = self.clock;
            for voice in self.voices.iter_mut() {
                if !voice.started || voice.ended {
                    continue;
                }
                if voice.frame >= voice.audio.frames() {
                    voice.ended = true;
                    self.ended.push(voice.id);
                    continue;
                }
                let gain = voice.gain.at(clock) * self.master;
                let base = voice.frame * voice.audio.channels as usize;
                for (c, sample) in frame_out.iter_mut().enumerate() {
                    let source_channel = c % voice.audio.channels.max(1) as usize;
                    *sample += voice.audio.samples[base + source_channel] * gain;
                }
                voice.frame += 1;
                if voice.frame >= voice.audio.frames() {
                    voice.ended = true;
                    self.ended.push(voice.id);
                }
            }
            self.clock += 1;
        }

        let clock = self.clock;
        for voice in self.voices.iter_mut() {
            voice.gain.settle(clock);
        }
    }

    /// Renders `duration` worth of audio and discards it.
    pub fn advance(&mut self, duration: Duration) {
        let frames = self.duration_to_frames(duration) as usize;
        let mut scratch = vec![0.0; 1024 * self.channels as usize];
        let mut remaining = frames;
        while remaining > 0 {
            let n = remaining.min(1024);
            self.render(&mut scratch[..n * self.channels as usize]);
            remaining -= n;
        }
    }

    fn voice(&self, id: VoiceId) -> Option<&Voice> {
        self.voices.iter().find(|v| v.id == id)
    }

    fn voice_mut(&mut self, id: VoiceId) -> Option<&mut Voice> {
        self.voices.iter_mut().find(|v| v.id == id)
    }
}
