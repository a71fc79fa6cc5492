//! Gapless playback scheduling for synthesized speech
//!
//! Inbound audio arrives as raw 24 kHz PCM16 chunks. Each chunk is decoded
//! and scheduled immediately after the previous one on the output device
//! clock; there is no materialized queue, only `next_start_time`.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Sample rate of model speech.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Error type for playback operations
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("empty audio payload")]
    Empty,

    #[error("odd payload length {0}, expected whole 16-bit samples")]
    OddLength(usize),

    #[error("output device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, PlaybackError>;

/// A decoded buffer ready for output.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackChunk {
    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decode little-endian PCM16 mono into normalized floats.
pub fn decode_pcm16(payload: &[u8], sample_rate: u32) -> Result<PlaybackChunk> {
    if payload.is_empty() {
        return Err(PlaybackError::Empty);
    }
    if payload.len() % 2 != 0 {
        return Err(PlaybackError::OddLength(payload.len()));
    }
    let samples = payload
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();
    Ok(PlaybackChunk {
        samples,
        sample_rate,
    })
}

/// The speaker side of a session. Times are seconds on the device clock.
pub trait OutputDevice: Send + Sync {
    fn current_time(&self) -> f64;

    fn is_running(&self) -> bool;

    /// Queue `chunk` to start playing at `start`.
    fn play_at(&self, start: f64, chunk: &PlaybackChunk) -> Result<()>;

    /// Drop anything queued. Called when a session generation ends.
    fn reset(&self) {}
}

/// Where a chunk landed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Place a chunk of `duration` seconds given the device time `now`.
    pub fn schedule(&mut self, now: f64, duration: f64) -> ScheduledChunk {
        if self.next_start_time < now {
            self.next_start_time = now;
        }
        let start = self.next_start_time;
        self.next_start_time += duration.max(0.0);
        ScheduledChunk { start, duration }
    }

    /// Decode `payload` and hand it to `device`. Bad chunks are dropped.
    pub fn enqueue(&mut self, payload: &[u8], device: &dyn OutputDevice) -> Option<ScheduledChunk> {
        let chunk = match decode_pcm16(payload, OUTPUT_SAMPLE_RATE) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Dropping audio chunk: {}", e);
                return None;
            }
        };

        let slot = self.schedule(device.current_time(), chunk.duration());
        if let Err(e) = device.play_at(slot.start, &chunk) {
            debug!("Output device rejected chunk at {:.3}s: {}", slot.start, e);
        }
        Some(slot)
    }

    /// Forget the previous timeline; the next chunk starts at device time.
    pub fn reset(&mut self) {
        self.next_start_time = 0.0;
    }

    pub fn is_speaking(&self, device: &dyn OutputDevice) -> bool {
        self.next_start_time > 0.0
            && device.is_running()
            && device.current_time() < self.next_start_time
    }
}

/// Scheduler shared between the session loop and the health monitor.
#[derive(Debug, Clone, Default)]
pub struct SharedPlayback(Arc<Mutex<PlaybackScheduler>>);

impl SharedPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut PlaybackScheduler) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn next_start_time(&self) -> f64 {
        self.with(|s| s.next_start_time())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Output device whose clock only moves when told to.
    #[derive(Debug, Default)]
    pub struct ManualOutput {
        pub now: Mutex<f64>,
        pub running: Mutex<bool>,
        pub played: Mutex<Vec<(f64, f64)>>,
        pub resets: Mutex<usize>,
    }

    impl ManualOutput {
        pub fn running() -> Arc<Self> {
            let out = Self::default();
            *out.running.lock().unwrap() = true;
            Arc::new(out)
        }

        pub fn set_time(&self, t: f64) {
            *self.now.lock().unwrap() = t;
        }
    }

    impl OutputDevice for ManualOutput {
        fn current_time(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn is_running(&self) -> bool {
            *self.running.lock().unwrap()
        }

        fn play_at(&self, start: f64, chunk: &PlaybackChunk) -> Result<()> {
            self.played.lock().unwrap().push((start, chunk.duration()));
            Ok(())
        }

        fn reset(&self) {
            *self.resets.lock().unwrap() += 1;
        }
    }
}
