//! Capture → encoder → outbound pump for one session generation

use crate::audio_encoder::AudioCaptureEncoder;
use crate::media::{AudioFrame, StreamWatch};
use crate::transport::{Outbound, OutboundTx};
use tokio::sync::broadcast::error::RecvError;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Attach the encoder to whatever stream `streams` currently holds, following
/// replacements, until the outbound channel closes or the task is aborted.
pub fn spawn_audio_pump(
    encoder: AudioCaptureEncoder,
    mut streams: StreamWatch,
    outbound: OutboundTx,
    user_speaking: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut audio = subscribe_current(&mut streams);
        info!("Audio pipeline attached");

        loop {
            tokio::select! {
                changed = streams.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    audio = subscribe_current(&mut streams);
                    debug!("Audio pipeline re-attached to replaced stream");
                }
                frame = recv_frame(&mut audio) => {
                    let Some(frame) = frame else {
                        // Stream ended; wait for a replacement.
                        audio = None;
                        continue;
                    };
                    let encoded = encoder.encode(&frame.samples, frame.sample_rate);
                    user_speaking.send_replace(encoded.speaking);
                    if encoded.pcm.is_empty() {
                        continue;
                    }
                    if !outbound.send(Outbound::Audio(encoded.to_le_bytes())) {
                        break;
                    }
                }
            }
        }

        user_speaking.send_replace(false);
        info!("Audio pipeline detached");
    })
}

fn subscribe_current(streams: &mut StreamWatch) -> Option<broadcast::Receiver<AudioFrame>> {
    streams
        .borrow_and_update()
        .as_ref()
        .filter(|s| s.is_active())
        .map(|s| s.subscribe_audio())
}

/// Next frame, skipping over lag. Pends forever without a stream.
async fn recv_frame(audio: &mut Option<broadcast::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    let Some(rx) = audio.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(frame) => return Some(frame),
            Err(RecvError::Lagged(n)) => warn!("Audio pipeline lagged, dropped {} frames", n),
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::FakeDevices;
    use crate::media::{FacingMode, MediaHub};
    use std::time::Duration;

    fn frame(value: f32, len: usize, rate: u32) -> AudioFrame {
        AudioFrame {
            samples: vec![value; len].into(),
            sample_rate: rate,
        }
    }

    #[tokio::test]
    async fn test_pump_encodes_in_capture_order() {
        let devices = Arc::new(FakeDevices::default());
        let hub = MediaHub::new(devices.clone(), FacingMode::User);
        hub.ensure_stream().await.unwrap();

        let (tx, mut rx) = OutboundTx::channel();
        let (speaking_tx, speaking_rx) = watch::channel(false);
        let pump = spawn_audio_pump(AudioCaptureEncoder::default(), hub.subscribe(), tx, Arc::new(speaking_tx));
        tokio::task::yield_now().await;

        let mic = devices.last_sender();
        mic.send(frame(0.5, 4800, 48000)).unwrap();
        mic.send(frame(0.0, 4800, 48000)).unwrap();

        let Some(Outbound::Audio(first)) = rx.recv().await else { panic!("expected audio") };
        let Some(Outbound::Audio(second)) = rx.recv().await else { panic!("expected audio") };
        assert_eq!(first.len(), 3200);
        assert_eq!(&first[..2], &16384i16.to_le_bytes());
        assert!(second.iter().all(|&b| b == 0));
        assert!(!*speaking_rx.borrow());

        pump.abort();
    }

    #[tokio::test]
    async fn test_pump_follows_camera_switch() {
        let devices = Arc::new(FakeDevices::default());
        let hub = MediaHub::new(devices.clone(), FacingMode::User);
        hub.ensure_stream().await.unwrap();

        let (tx, mut rx) = OutboundTx::channel();
        let (speaking_tx, _speaking_rx) = watch::channel(false);
        let pump = spawn_audio_pump(AudioCaptureEncoder::default(), hub.subscribe(), tx, Arc::new(speaking_tx));
        tokio::task::yield_now().await;

        let old_mic = devices.last_sender();
        hub.switch_facing().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Frames from the stopped stream never reach the wire.
        let _ = old_mic.send(frame(0.9, 160, 16000));
        devices.last_sender().send(frame(0.25, 160, 16000)).unwrap();

        let Some(Outbound::Audio(bytes)) = rx.recv().await else { panic!("expected audio") };
        assert_eq!(&bytes[..2], &crate::audio_encoder::quantize(0.25).to_le_bytes());

        pump.abort();
    }
}
