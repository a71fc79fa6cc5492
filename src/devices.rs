//! Device-side collaborators: hardware controls, wake lock and the persisted
//! lock flag.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("not supported on this device: {0}")]
    Unsupported(&'static str),

    #[error("device request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    Lock,
    VolumeUp,
    VolumeDown,
    Brightness,
    Home,
    Flashlight,
}

impl DeviceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::VolumeUp => "volume_up",
            Self::VolumeDown => "volume_down",
            Self::Brightness => "brightness",
            Self::Home => "home",
            Self::Flashlight => "flashlight",
        }
    }
}

/// Hardware surfaces the session pokes. Each call is best-effort.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn acquire_wake_lock(&self) -> Result<(), DeviceError>;

    async fn release_wake_lock(&self);

    /// `torch` carries the desired flashlight state for [`DeviceAction::Flashlight`].
    async fn apply(&self, action: DeviceAction, torch: bool) -> Result<(), DeviceError>;
}

/// Device control for hosts without the hardware; every call is logged.
#[derive(Debug, Default)]
pub struct LoggingDevice {
    wake_lock: AtomicBool,
}

impl LoggingDevice {
    pub fn wake_lock_held(&self) -> bool {
        self.wake_lock.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceControl for LoggingDevice {
    async fn acquire_wake_lock(&self) -> Result<(), DeviceError> {
        self.wake_lock.store(true, Ordering::SeqCst);
        info!("Wake lock acquired");
        Ok(())
    }

    async fn release_wake_lock(&self) {
        if self.wake_lock.swap(false, Ordering::SeqCst) {
            info!("Wake lock released");
        }
    }

    async fn apply(&self, action: DeviceAction, torch: bool) -> Result<(), DeviceError> {
        match action {
            DeviceAction::Flashlight => info!("Flashlight {}", if torch { "on" } else { "off" }),
            other => info!("Device action: {}", other.as_str()),
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted "device locked" flag.
pub trait LockStore: Send + Sync {
    /// Locked unless a previous session stored otherwise.
    fn is_locked(&self) -> bool;

    fn set_locked(&self, locked: bool) -> Result<(), LockStoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    locked: bool,
}

/// Lock flag kept in a small JSON file.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    path: PathBuf,
}

impl FileLockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LockStore for FileLockStore {
    fn is_locked(&self) -> bool {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return true;
        };
        match serde_json::from_str::<LockFile>(&text) {
            Ok(file) => file.locked,
            Err(e) => {
                debug!("Unreadable lock file {}: {}", self.path.display(), e);
                true
            }
        }
    }

    fn set_locked(&self, locked: bool) -> Result<(), LockStoreError> {
        let json = serde_json::to_string(&LockFile { locked })?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// In-memory lock flag.
#[derive(Debug)]
pub struct MemoryLockStore(AtomicBool);

impl MemoryLockStore {
    pub fn new(locked: bool) -> Self {
        Self(AtomicBool::new(locked))
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LockStore for MemoryLockStore {
    fn is_locked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set_locked(&self, locked: bool) -> Result<(), LockStoreError> {
        self.0.store(locked, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_lock_store_round_trip() {
        let path = std::env::temp_dir().join(format!("livelink_lock_{}.json", rand::random::<u32>()));
        let store = FileLockStore::new(&path);
        assert!(store.is_locked());

        store.set_locked(false).unwrap();
        assert!(!store.is_locked());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"locked":false}"#);

        std::fs::write(&path, "garbage").unwrap();
        assert!(store.is_locked());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_logging_device_wake_lock() {
        let device = LoggingDevice::default();
        device.acquire_wake_lock().await.unwrap();
        assert!(device.wake_lock_held());
        device.release_wake_lock().await;
        assert!(!device.wake_lock_held());
    }
}
