//! PulseAudio microphone and speaker
//!
//! Both use the simple API on a dedicated thread, since its reads and writes
//! block. The microphone delivers capture windows at the device rate; the
//! speaker plays scheduled chunks back to back.

use crate::config::CAPTURE_WINDOW;
use crate::media::{AudioFrame, Camera, MediaConstraints, MediaDevices, MediaError, MediaStream};
use crate::playback::{OutputDevice, PlaybackChunk, PlaybackError, OUTPUT_SAMPLE_RATE};
use async_trait::async_trait;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{error, info, warn};

const APP_NAME: &str = "livelink";
const CAPTURE_RATE: u32 = 48_000;

fn open(direction: Direction, rate: u32, description: &str) -> Result<Simple, String> {
    let spec = Spec {
        format: Format::S16le,
        channels: 1,
        rate,
    };
    Simple::new(None, APP_NAME, direction, None, description, &spec, None, None).map_err(|e| ToString::to_string(&e))
}

/// Default PulseAudio source as the microphone.
pub struct PulseMicrophone {
    camera: Option<Arc<dyn Camera>>,
}

impl PulseMicrophone {
    pub fn new(camera: Option<Arc<dyn Camera>>) -> Self {
        Self { camera }
    }
}

#[async_trait]
impl MediaDevices for PulseMicrophone {
    async fn acquire(&self, constraints: &MediaConstraints) -> crate::media::Result<MediaStream> {
        let (stream, tx) = MediaStream::new(constraints.facing, self.camera.clone());
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        let flag = running.clone();
        std::thread::spawn(move || {
            let simple = match open(Direction::Record, CAPTURE_RATE, "record") {
                Ok(simple) => {
                    let _ = ready_tx.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let mut bytes = vec![0u8; CAPTURE_WINDOW * 2];
            while flag.load(Ordering::SeqCst) {
                if let Err(e) = simple.read(&mut bytes) {
                    error!("Microphone read error: {}", e);
                    break;
                }
                let samples: Arc<[f32]> = bytes
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                    .collect();
                let _ = tx.send(AudioFrame {
                    samples,
                    sample_rate: CAPTURE_RATE,
                });
            }
            info!("Microphone capture thread exited");
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(MediaError::Unavailable(e)),
            Err(_) => return Err(MediaError::Unavailable("capture thread died".to_string())),
        }
        stream.on_stop(move || running.store(false, Ordering::SeqCst));
        info!("🎤 PulseAudio microphone open @ {}Hz", CAPTURE_RATE);
        Ok(stream)
    }
}

/// Default PulseAudio sink as the speaker.
pub struct PulseSpeaker {
    started: Instant,
    chunks: Mutex<std_mpsc::Sender<Vec<u8>>>,
}

impl PulseSpeaker {
    pub fn open() -> Result<Self, PlaybackError> {
        let (tx, rx) = std_mpsc::channel::<Vec<u8>>();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        std::thread::spawn(move || {
            let simple = match open(Direction::Playback, OUTPUT_SAMPLE_RATE, "playback") {
                Ok(simple) => {
                    let _ = ready_tx.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            while let Ok(pcm) = rx.recv() {
                if let Err(e) = simple.write(&pcm) {
                    warn!("Speaker write error: {}", e);
                }
            }
            if let Err(e) = simple.drain() {
                warn!("Speaker drain error: {}", e);
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PlaybackError::Device(e)),
            Err(_) => return Err(PlaybackError::Device("playback thread died".to_string())),
        }
        info!("🔊 PulseAudio speaker open @ {}Hz", OUTPUT_SAMPLE_RATE);
        Ok(Self {
            started: Instant::now(),
            chunks: Mutex::new(tx),
        })
    }
}

impl OutputDevice for PulseSpeaker {
    fn current_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn is_running(&self) -> bool {
        true
    }

    fn play_at(&self, _start: f64, chunk: &PlaybackChunk) -> crate::playback::Result<()> {
        let pcm: Vec<u8> = chunk
            .samples
            .iter()
            .flat_map(|&s| ((s * 32768.0).clamp(-32768.0, 32767.0) as i16).to_le_bytes())
            .collect();
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(pcm)
            .map_err(|_| PlaybackError::Device("speaker closed".to_string()))
    }
}
