//! Live microphone + camera stream and its single owner
//!
//! A [`MediaStream`] fans captured audio out over a broadcast channel and
//! exposes the camera for snapshots. [`MediaHub`] is the only writer: it
//! acquires, replaces and stops streams, publishing the current one on a
//! watch channel so every reader re-attaches after a switch.

use async_trait::async_trait;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Frames buffered per audio subscriber before it starts lagging.
const AUDIO_FANOUT_CAPACITY: usize = 64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("no active media stream")]
    NoStream,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, MediaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn flipped(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Environment => "environment",
        }
    }
}

/// What is asked of the capture hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaConstraints {
    pub facing: FacingMode,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub ideal_frame_rate: u32,
    pub max_frame_rate: u32,
}

impl MediaConstraints {
    pub fn for_facing(facing: FacingMode) -> Self {
        Self {
            facing,
            channel_count: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            ideal_frame_rate: 15,
            max_frame_rate: 20,
        }
    }
}

/// One window of captured microphone samples at the device rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

/// Hardware zoom capability reported by a camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomRange {
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

pub trait Camera: Send + Sync {
    /// Latest frame, if the camera has produced one.
    fn snapshot(&self) -> Option<RgbImage>;

    fn zoom_range(&self) -> Option<ZoomRange> {
        None
    }

    fn set_zoom(&self, _level: f32) -> Result<()> {
        Err(MediaError::Unsupported("zoom".to_string()))
    }
}

type StopFn = Box<dyn FnOnce() + Send>;

/// A live capture handle.
pub struct MediaStream {
    id: u64,
    facing: FacingMode,
    audio: broadcast::Sender<AudioFrame>,
    camera: Option<Arc<dyn Camera>>,
    stoppers: Mutex<Vec<StopFn>>,
    active: AtomicBool,
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("facing", &self.facing)
            .field("active", &self.is_active())
            .finish()
    }
}

impl MediaStream {
    /// Returns the stream and the sender the capture side pushes frames into.
    pub fn new(facing: FacingMode, camera: Option<Arc<dyn Camera>>) -> (Self, broadcast::Sender<AudioFrame>) {
        let (audio, _) = broadcast::channel(AUDIO_FANOUT_CAPACITY);
        let stream = Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            facing,
            audio: audio.clone(),
            camera,
            stoppers: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
        };
        (stream, audio)
    }

    /// Register a track stop action, run once by [`MediaStream::stop`].
    pub fn on_stop(&self, f: impl FnOnce() + Send + 'static) {
        self.stoppers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn facing(&self) -> FacingMode {
        self.facing
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscribe_audio(&self) -> broadcast::Receiver<AudioFrame> {
        self.audio.subscribe()
    }

    pub fn camera(&self) -> Option<&Arc<dyn Camera>> {
        self.camera.as_ref()
    }

    /// Stop every track. Idempotent.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let stoppers = std::mem::take(&mut *self.stoppers.lock().unwrap_or_else(PoisonError::into_inner));
        for stop in stoppers {
            stop();
        }
        info!("Media stream {} stopped", self.id);
    }
}

/// Acquisition of capture hardware.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream>;
}

pub type StreamWatch = watch::Receiver<Option<Arc<MediaStream>>>;

struct HubInner {
    devices: Arc<dyn MediaDevices>,
    current: watch::Sender<Option<Arc<MediaStream>>>,
    facing: Mutex<FacingMode>,
    // Serializes acquire/replace/stop so two writers never interleave.
    writer: tokio::sync::Mutex<()>,
}

/// Single owner of the current media stream.
#[derive(Clone)]
pub struct MediaHub {
    inner: Arc<HubInner>,
}

impl MediaHub {
    pub fn new(devices: Arc<dyn MediaDevices>, facing: FacingMode) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(HubInner {
                devices,
                current,
                facing: Mutex::new(facing),
                writer: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn subscribe(&self) -> StreamWatch {
        self.inner.current.subscribe()
    }

    pub fn current(&self) -> Option<Arc<MediaStream>> {
        self.inner.current.borrow().clone()
    }

    pub fn facing(&self) -> FacingMode {
        *self.inner.facing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live stream, acquiring one if there is none or it ended.
    pub async fn ensure_stream(&self) -> Result<Arc<MediaStream>> {
        let _guard = self.inner.writer.lock().await;
        if let Some(stream) = self.current().filter(|s| s.is_active()) {
            return Ok(stream);
        }
        let stream = self.acquire(self.facing()).await?;
        self.inner.current.send_replace(Some(stream.clone()));
        Ok(stream)
    }

    /// Stop the current stream and replace it with one from the other camera.
    pub async fn switch_facing(&self) -> Result<FacingMode> {
        let _guard = self.inner.writer.lock().await;
        let next = self.facing().flipped();

        if let Some(old) = self.inner.current.send_replace(None) {
            old.stop();
        }
        *self.inner.facing.lock().unwrap_or_else(PoisonError::into_inner) = next;

        let stream = self.acquire(next).await?;
        self.inner.current.send_replace(Some(stream));
        info!("Camera switched to {}", next.as_str());
        Ok(next)
    }

    /// Stop and forget the current stream.
    pub async fn stop(&self) {
        let _guard = self.inner.writer.lock().await;
        if let Some(old) = self.inner.current.send_replace(None) {
            old.stop();
        }
    }

    async fn acquire(&self, facing: FacingMode) -> Result<Arc<MediaStream>> {
        let constraints = MediaConstraints::for_facing(facing);
        match self.inner.devices.acquire(&constraints).await {
            Ok(stream) => {
                info!("Acquired media stream {} ({})", stream.id(), facing.as_str());
                Ok(Arc::new(stream))
            }
            Err(e) => {
                warn!("Media acquisition failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    pub struct SolidCamera {
        pub color: [u8; 3],
        pub zoom: Option<ZoomRange>,
        pub zoom_level: Mutex<f32>,
    }

    impl SolidCamera {
        pub fn new(color: [u8; 3]) -> Self {
            Self {
                color,
                zoom: None,
                zoom_level: Mutex::new(1.0),
            }
        }
    }

    impl Camera for SolidCamera {
        fn snapshot(&self) -> Option<RgbImage> {
            Some(RgbImage::from_pixel(640, 480, image::Rgb(self.color)))
        }

        fn zoom_range(&self) -> Option<ZoomRange> {
            self.zoom
        }

        fn set_zoom(&self, level: f32) -> Result<()> {
            *self.zoom_level.lock().unwrap() = level;
            Ok(())
        }
    }

    /// Devices that hand out streams and remember what they did.
    #[derive(Default)]
    pub struct FakeDevices {
        pub deny: AtomicBool,
        pub acquired: AtomicUsize,
        pub stopped: Arc<AtomicUsize>,
        pub facings: Mutex<Vec<FacingMode>>,
        pub senders: Mutex<Vec<broadcast::Sender<AudioFrame>>>,
    }

    impl FakeDevices {
        pub fn last_sender(&self) -> broadcast::Sender<AudioFrame> {
            self.senders.lock().unwrap().last().cloned().expect("no stream acquired")
        }
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
            if self.deny.load(Ordering::SeqCst) {
                return Err(MediaError::PermissionDenied("camera".to_string()));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            self.facings.lock().unwrap().push(constraints.facing);
            let camera: Arc<dyn Camera> = Arc::new(SolidCamera::new([200, 10, 10]));
            let (stream, tx) = MediaStream::new(constraints.facing, Some(camera));
            let stopped = self.stopped.clone();
            stream.on_stop(move || {
                stopped.fetch_add(1, Ordering::SeqCst);
            });
            self.senders.lock().unwrap().push(tx);
            Ok(stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeDevices;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_ensure_stream_reuses_live_stream() {
        let devices = Arc::new(FakeDevices::default());
        let hub = MediaHub::new(devices.clone(), FacingMode::User);

        let a = hub.ensure_stream().await.unwrap();
        let b = hub.ensure_stream().await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(devices.acquired.load(Ordering::SeqCst), 1);

        a.stop();
        let c = hub.ensure_stream().await.unwrap();
        assert_ne!(a.id(), c.id());
        assert_eq!(devices.acquired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_switch_replaces_and_notifies_readers() {
        let devices = Arc::new(FakeDevices::default());
        let hub = MediaHub::new(devices.clone(), FacingMode::User);
        let old = hub.ensure_stream().await.unwrap();
        let mut watch = hub.subscribe();
        watch.borrow_and_update();

        assert_eq!(hub.switch_facing().await.unwrap(), FacingMode::Environment);

        assert!(!old.is_active());
        assert_eq!(devices.stopped.load(Ordering::SeqCst), 1);
        assert!(watch.has_changed().unwrap());
        let current = watch.borrow_and_update().clone().unwrap();
        assert_eq!(current.facing(), FacingMode::Environment);
        assert_ne!(current.id(), old.id());
        assert_eq!(*devices.facings.lock().unwrap(), vec![FacingMode::User, FacingMode::Environment]);
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces() {
        let devices = Arc::new(FakeDevices::default());
        devices.deny.store(true, Ordering::SeqCst);
        let hub = MediaHub::new(devices, FacingMode::User);
        assert!(matches!(hub.ensure_stream().await, Err(MediaError::PermissionDenied(_))));
        assert!(hub.current().is_none());
    }

    #[tokio::test]
    async fn test_stop_runs_track_stoppers_once() {
        let devices = Arc::new(FakeDevices::default());
        let hub = MediaHub::new(devices.clone(), FacingMode::User);
        let stream = hub.ensure_stream().await.unwrap();
        hub.stop().await;
        stream.stop();
        assert_eq!(devices.stopped.load(Ordering::SeqCst), 1);
        assert!(hub.current().is_none());
    }
}
