//! File-backed devices for hosts without live capture hardware
//!
//! A WAV file stands in for the microphone, a still image for the camera and
//! a WAV writer for the speaker. Frames are paced in real time so the rest of
//! the session cannot tell the difference.

use crate::config::CAPTURE_WINDOW;
use crate::media::{AudioFrame, Camera, MediaConstraints, MediaDevices, MediaError, MediaStream};
use crate::playback::{OutputDevice, PlaybackChunk, PlaybackError, OUTPUT_SAMPLE_RATE};
use async_trait::async_trait;
use image::RgbImage;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WavIoError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Read a WAV file as mono floats, averaging channels. Returns samples and rate.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), WavIoError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Write mono PCM16 samples to a WAV file.
pub fn write_wav_pcm16(path: &Path, samples: &[i16], sample_rate: u32) -> Result<(), WavIoError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// A still image served as every camera frame.
pub struct ImageCamera {
    frame: RgbImage,
}

impl ImageCamera {
    pub fn open(path: &Path) -> Result<Self, WavIoError> {
        Ok(Self {
            frame: image::open(path)?.to_rgb8(),
        })
    }
}

impl Camera for ImageCamera {
    fn snapshot(&self) -> Option<RgbImage> {
        Some(self.frame.clone())
    }
}

/// Microphone that replays a WAV file in capture-sized windows.
pub struct WavMicrophone {
    path: PathBuf,
    camera: Option<Arc<dyn Camera>>,
    repeat: bool,
}

impl WavMicrophone {
    pub fn new(path: impl Into<PathBuf>, camera: Option<Arc<dyn Camera>>) -> Self {
        Self {
            path: path.into(),
            camera,
            repeat: false,
        }
    }

    /// Start over from the beginning when the file runs out.
    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }
}

#[async_trait]
impl MediaDevices for WavMicrophone {
    async fn acquire(&self, constraints: &MediaConstraints) -> crate::media::Result<MediaStream> {
        let path = self.path.clone();
        let (samples, rate) = tokio::task::spawn_blocking(move || read_wav_mono(&path))
            .await
            .map_err(|e| MediaError::Unavailable(e.to_string()))?
            .map_err(|e| MediaError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        info!(
            "🎤 Replaying {} ({} samples @ {}Hz, {} camera)",
            self.path.display(),
            samples.len(),
            rate,
            constraints.facing.as_str()
        );

        let (stream, tx) = MediaStream::new(constraints.facing, self.camera.clone());
        let samples: Arc<[f32]> = samples.into();
        let repeat = self.repeat;
        let window = Duration::from_secs_f64(CAPTURE_WINDOW as f64 / rate.max(1) as f64);

        let pump = tokio::spawn(async move {
            let mut ticker = interval(window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut offset = 0;
            loop {
                if offset >= samples.len() {
                    if !repeat || samples.is_empty() {
                        debug!("Microphone file exhausted");
                        break;
                    }
                    offset = 0;
                }
                ticker.tick().await;
                let end = (offset + CAPTURE_WINDOW).min(samples.len());
                let frame = AudioFrame {
                    samples: samples[offset..end].into(),
                    sample_rate: rate,
                };
                offset = end;
                // No subscribers yet is fine; the frame is simply not heard.
                let _ = tx.send(frame);
            }
        });
        stream.on_stop(move || pump.abort());
        Ok(stream)
    }
}

/// Speaker that renders the scheduled timeline into a WAV file.
pub struct WavSpeaker {
    started: Instant,
    writer: Mutex<Option<hound::WavWriter<BufWriter<File>>>>,
    /// Seconds of audio written so far.
    written: Mutex<f64>,
}

impl WavSpeaker {
    pub fn create(path: &Path) -> Result<Self, WavIoError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: OUTPUT_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        info!("🔊 Writing agent speech to {}", path.display());
        Ok(Self {
            started: Instant::now(),
            writer: Mutex::new(Some(hound::WavWriter::create(path, spec)?)),
            written: Mutex::new(0.0),
        })
    }

    /// Flush and close the file. Later chunks are dropped.
    pub fn finalize(&self) -> Result<(), WavIoError> {
        if let Some(writer) = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

impl OutputDevice for WavSpeaker {
    fn current_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn is_running(&self) -> bool {
        true
    }

    fn play_at(&self, start: f64, chunk: &PlaybackChunk) -> crate::playback::Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = guard
            .as_mut()
            .ok_or_else(|| PlaybackError::Device("speaker closed".to_string()))?;
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);

        let device = |e: hound::Error| PlaybackError::Device(e.to_string());
        let gap = ((start - *written) * OUTPUT_SAMPLE_RATE as f64).round() as i64;
        for _ in 0..gap.max(0) {
            writer.write_sample(0i16).map_err(device)?;
        }
        for &sample in &chunk.samples {
            let pcm = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(pcm).map_err(device)?;
        }
        *written = start.max(*written) + chunk.duration();
        Ok(())
    }

    fn reset(&self) {
        if let Some(writer) = self.writer.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush speaker file: {}", e);
            }
        }
    }
}
