//! Connection health monitor
//!
//! Two observers, neither holding authoritative state: a speaking indicator
//! derived from the playback clock, and a connectivity probe that feeds
//! online/offline edges into the session.

use crate::playback::{OutputDevice, SharedPlayback};
use crate::session::SessionHandle;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Publish whether model speech is still queued, every `period`.
pub fn spawn_speaking_monitor(
    playback: SharedPlayback,
    output: Arc<dyn OutputDevice>,
    period: Duration,
) -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let speaking = playback.with(|p| p.is_speaking(output.as_ref()));
            tx.send_if_modified(|current| {
                if *current == speaking {
                    return false;
                }
                *current = speaking;
                true
            });
            if tx.is_closed() {
                break;
            }
        }
    });
    (rx, handle)
}

/// Whether the remote service is reachable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Online when a TCP connection to `host` opens within `timeout`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub host: String,
    pub timeout: Duration,
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn is_online(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.host)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe to {} failed: {}", self.host, e);
                false
            }
            Err(_) => {
                debug!("Probe to {} timed out", self.host);
                false
            }
        }
    }
}

/// Poll `probe` every `period` and report only transitions to the session.
/// Connectivity is assumed up at start.
pub fn spawn_network_monitor(
    probe: Arc<dyn ConnectivityProbe>,
    period: Duration,
    session: SessionHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut online = true;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let now_online = probe.is_online().await;
            if now_online == online {
                continue;
            }
            online = now_online;
            if online {
                info!("🌐 Network back online");
            } else {
                warn!("🌐 Network offline");
            }
            if !session.network(online) {
                break;
            }
        }
    })
}

/// Both observers for one session; stops them on drop.
pub struct ConnectionHealthMonitor {
    speaking: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionHealthMonitor {
    pub fn start(
        playback: SharedPlayback,
        output: Arc<dyn OutputDevice>,
        speaking_poll: Duration,
        network: Option<(Arc<dyn ConnectivityProbe>, Duration, SessionHandle)>,
    ) -> Self {
        let (speaking, speaking_task) = spawn_speaking_monitor(playback, output, speaking_poll);
        let mut tasks = vec![speaking_task];
        if let Some((probe, period, session)) = network {
            tasks.push(spawn_network_monitor(probe, period, session));
        }
        Self { speaking, tasks }
    }

    /// Whether the agent is currently speaking.
    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.speaking.clone()
    }
}

impl Drop for ConnectionHealthMonitor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::testing::ManualOutput;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProbe(Mutex<VecDeque<bool>>);

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn is_online(&self) -> bool {
            self.0.lock().unwrap().pop_front().unwrap_or(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_follows_playback_clock() {
        let playback = SharedPlayback::new();
        let output = ManualOutput::running();
        let (mut speaking, task) = spawn_speaking_monitor(playback.clone(), output.clone(), Duration::from_millis(50));
        assert!(!*speaking.borrow());

        // Half a second of speech queued at device time 0.
        playback.with(|p| p.enqueue(&[0u8; 24000], output.as_ref()));
        speaking.changed().await.unwrap();
        assert!(*speaking.borrow_and_update());

        output.set_time(0.6);
        speaking.changed().await.unwrap();
        assert!(!*speaking.borrow());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_monitor_reports_edges_only() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let session = SessionHandle::from_sender(tx);
        let probe = Arc::new(ScriptedProbe(Mutex::new(VecDeque::from([true, false, false, true, true]))));
        let task = spawn_network_monitor(probe, Duration::from_secs(5), session);

        tokio::time::sleep(Duration::from_secs(26)).await;
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::session::SessionEvent::Network { online } = event {
                seen.push(online);
            }
        }
        assert_eq!(seen, vec![false, true]);
        task.abort();
    }

    #[tokio::test]
    async fn test_tcp_probe_offline_for_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = TcpProbe {
            host: addr.to_string(),
            timeout: Duration::from_secs(3),
        };
        assert!(probe.is_online().await);

        drop(listener);
        assert!(!probe.is_online().await);
    }
}
