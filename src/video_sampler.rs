//! Periodic camera snapshots for the realtime input stream

use crate::media::StreamWatch;
use crate::transport::{Outbound, OutboundTx};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, RgbImage};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

pub const SNAPSHOT_WIDTH: u32 = 320;
pub const SNAPSHOT_HEIGHT: u32 = 240;
pub const SNAPSHOT_QUALITY: u8 = 50;

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Scale a frame to the snapshot size and encode it as JPEG.
pub fn encode_snapshot(frame: &RgbImage) -> Result<Vec<u8>, SamplerError> {
    let scaled = image::imageops::resize(frame, SNAPSHOT_WIDTH, SNAPSHOT_HEIGHT, FilterType::Triangle);
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, SNAPSHOT_QUALITY);
    encoder.encode(scaled.as_raw(), SNAPSHOT_WIDTH, SNAPSHOT_HEIGHT, ExtendedColorType::Rgb8)?;
    Ok(jpeg)
}

/// Send a snapshot of the current camera every `period` until the outbound
/// channel closes or the task is aborted. The first frame goes out one full
/// period after start.
pub fn spawn_video_sampler(streams: StreamWatch, outbound: OutboundTx, period: Duration) -> JoinHandle<()> {
    info!("Starting video sampler every {}ms", period.as_millis());

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut frames_sent = 0u64;

        loop {
            ticker.tick().await;
            if outbound.is_closed() {
                break;
            }

            // Always read the watch so a switched camera is picked up.
            let stream = streams.borrow().clone();
            let Some(frame) = stream
                .filter(|s| s.is_active())
                .and_then(|s| s.camera().and_then(|c| c.snapshot()))
            else {
                debug!("No camera frame available");
                continue;
            };

            match tokio::task::spawn_blocking(move || encode_snapshot(&frame)).await {
                Ok(Ok(jpeg)) => {
                    frames_sent += 1;
                    debug!("Snapshot #{}: {} KB", frames_sent, jpeg.len() / 1024);
                    if !outbound.send(Outbound::Video(jpeg)) {
                        break;
                    }
                }
                Ok(Err(e)) => error!("Snapshot error: {}", e),
                Err(e) => error!("Snapshot task failed: {}", e),
            }
        }
        info!("Video sampler stopped after {} frames", frames_sent);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::FakeDevices;
    use crate::media::{FacingMode, MediaHub};
    use std::sync::Arc;

    #[test]
    fn test_snapshot_is_small_jpeg() {
        let frame = RgbImage::from_pixel(1280, 720, image::Rgb([10, 200, 30]));
        let jpeg = encode_snapshot(&frame).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (SNAPSHOT_WIDTH, SNAPSHOT_HEIGHT));
    }

    #[tokio::test]
    async fn test_sampler_sends_on_interval_and_stops_with_channel() {
        let devices = Arc::new(FakeDevices::default());
        let hub = MediaHub::new(devices, FacingMode::User);
        hub.ensure_stream().await.unwrap();

        let (tx, mut rx) = OutboundTx::channel();
        let sampler = spawn_video_sampler(hub.subscribe(), tx, Duration::from_millis(20));

        for _ in 0..2 {
            match rx.recv().await {
                Some(Outbound::Video(jpeg)) => assert_eq!(&jpeg[..2], &[0xFF, 0xD8]),
                other => panic!("Unexpected outbound: {:?}", other),
            }
        }

        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), sampler).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sampler_skips_without_stream() {
        let devices = Arc::new(FakeDevices::default());
        let hub = MediaHub::new(devices, FacingMode::User);
        let (tx, mut rx) = OutboundTx::channel();
        let sampler = spawn_video_sampler(hub.subscribe(), tx, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        sampler.abort();
    }
}
