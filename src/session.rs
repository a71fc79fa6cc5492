//! Session runner
//!
//! One task owns the whole session: the lifecycle machine, the media hub,
//! the playback timeline, the dispatcher and every live handle (connect task,
//! writer, pipelines, reconnect timer). Commands, connect results and
//! transport callbacks all arrive as events on channels consumed by
//! [`SessionRunner::run`], so nothing mutates the session concurrently.

use crate::audio_encoder::{AudioCaptureEncoder, WIRE_SAMPLE_RATE};
use crate::audio_pipeline::spawn_audio_pump;
use crate::config::{SessionConfig, INPUT_GAIN};
use crate::devices::{DeviceControl, LockStore};
use crate::dispatcher::{DispatcherDeps, ToolCallDispatcher, MANUAL_TRIGGER_ID};
use crate::gemini::{ApiResponse, ToolCallRequest};
use crate::media::{MediaError, MediaHub};
use crate::playback::{OutputDevice, SharedPlayback};
use crate::scenario::ScenarioEngine;
use crate::session_fsm::{Action, ConnectFailure, LifecycleEvent, SessionMachine, SessionState};
use crate::tools::ToolRegistry;
use crate::transport::{spawn_writer, AttemptId, Connector, Outbound, OutboundTx, Transport, TransportEvent};
use crate::video_sampler::spawn_video_sampler;
use crate::view::{Emotion, LineKind, SessionView, SharedView};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LIBRARY_ONLINE_DELAY: Duration = Duration::from_secs(2);

pub(crate) enum SessionEvent {
    Start,
    Abort,
    Network { online: bool },
    ManualTool(ToolCallRequest),
    Shutdown,
    Connected {
        attempt: AttemptId,
        transport: Box<dyn Transport>,
    },
    ConnectFailed {
        attempt: AttemptId,
        failure: ConnectFailure,
        reason: String,
    },
    ReconnectTimerFired {
        generation: u64,
    },
}

/// Cheap handle for driving a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn start(&self) -> bool {
        self.tx.send(SessionEvent::Start).is_ok()
    }

    /// User-initiated, terminal disconnect.
    pub fn abort(&self) -> bool {
        self.tx.send(SessionEvent::Abort).is_ok()
    }

    pub fn network(&self, online: bool) -> bool {
        self.tx.send(SessionEvent::Network { online }).is_ok()
    }

    /// Run a tool locally, as if the model had called it, without sending a response.
    pub fn trigger_tool(&self, name: &str, args: serde_json::Value) -> bool {
        let call = ToolCallRequest::new(MANUAL_TRIGGER_ID, name, args);
        self.tx.send(SessionEvent::ManualTool(call)).is_ok()
    }

    /// Abort if needed and end [`SessionRunner::run`].
    pub fn shutdown(&self) -> bool {
        self.tx.send(SessionEvent::Shutdown).is_ok()
    }
}

/// Collaborators a session is built from.
pub struct SessionParts {
    pub connector: Arc<dyn Connector>,
    pub media: MediaHub,
    pub devices: Arc<dyn DeviceControl>,
    pub output: Arc<dyn OutputDevice>,
    pub lock_store: Arc<dyn LockStore>,
    pub scenario: Arc<dyn ScenarioEngine>,
    pub registry: ToolRegistry,
}

/// Every live handle of the current session generation.
struct SessionContext {
    view: SharedView,
    media: MediaHub,
    devices: Arc<dyn DeviceControl>,
    output: Arc<dyn OutputDevice>,
    playback: SharedPlayback,
    dispatcher: ToolCallDispatcher,
    user_speaking: Arc<watch::Sender<bool>>,
    outbound: Option<OutboundTx>,
    writer: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    audio_pump: Option<JoinHandle<()>>,
    video_sampler: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    boot_lines: Option<JoinHandle<()>>,
    active: bool,
}

impl SessionContext {
    /// Drop the transport generation. The media stream stays acquired.
    fn tear_down_transport(&mut self) {
        for task in [
            self.connect_task.take(),
            self.audio_pump.take(),
            self.video_sampler.take(),
            self.boot_lines.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }

        self.dispatcher.cancel_all();
        self.dispatcher.detach();
        // The writer closes the transport once the last sender is gone.
        self.outbound = None;
        self.writer = None;

        self.playback.with(|p| p.reset());
        self.output.reset();
        self.user_speaking.send_replace(false);
        self.active = false;
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
            debug!("Reconnect timer cancelled");
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.cancel_reconnect();
        self.tear_down_transport();
    }
}

pub struct SessionRunner {
    config: SessionConfig,
    machine: SessionMachine,
    ctx: SessionContext,
    connector: Arc<dyn Connector>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    transport_tx: mpsc::UnboundedSender<(AttemptId, TransportEvent)>,
    transport_rx: mpsc::UnboundedReceiver<(AttemptId, TransportEvent)>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionRunner {
    pub fn new(config: SessionConfig, parts: SessionParts) -> Self {
        let view = SharedView::new(SessionView {
            locked_overlay: parts.lock_store.is_locked(),
            ..SessionView::default()
        });
        let dispatcher = ToolCallDispatcher::new(
            parts.registry,
            DispatcherDeps {
                view: view.clone(),
                media: Some(parts.media.clone()),
                devices: parts.devices.clone(),
                scenario: parts.scenario,
                lock_store: parts.lock_store,
            },
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (user_speaking, _) = watch::channel(false);

        Self {
            config,
            machine: SessionMachine::new(),
            ctx: SessionContext {
                view,
                media: parts.media,
                devices: parts.devices,
                output: parts.output,
                playback: SharedPlayback::new(),
                dispatcher,
                user_speaking: Arc::new(user_speaking),
                outbound: None,
                writer: None,
                connect_task: None,
                audio_pump: None,
                video_sampler: None,
                reconnect_timer: None,
                boot_lines: None,
                active: false,
            },
            connector: parts.connector,
            events_tx,
            events_rx,
            transport_tx,
            transport_rx,
            state_tx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.events_tx.clone(),
        }
    }

    pub fn view(&self) -> SharedView {
        self.ctx.view.clone()
    }

    pub fn playback(&self) -> SharedPlayback {
        self.ctx.playback.clone()
    }

    pub fn output(&self) -> Arc<dyn OutputDevice> {
        self.ctx.output.clone()
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn user_speaking(&self) -> watch::Receiver<bool> {
        self.ctx.user_speaking.subscribe()
    }

    pub fn dispatcher(&self) -> &ToolCallDispatcher {
        &self.ctx.dispatcher
    }

    pub fn is_active(&self) -> bool {
        self.ctx.active
    }

    /// Process events until [`SessionHandle::shutdown`].
    pub async fn run(mut self) -> Self {
        info!("Session runner started");
        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(SessionEvent::Shutdown) | None => break,
                    Some(event) => self.on_event(event).await,
                },
                Some((attempt, event)) = self.transport_rx.recv() => {
                    self.on_transport(attempt, event).await;
                }
            }
        }

        if self.machine.state() != SessionState::Disconnected {
            self.lifecycle(LifecycleEvent::AbortRequested, None).await;
        }
        info!("Session runner stopped");
        self
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Start => self.lifecycle(LifecycleEvent::StartRequested, None).await,
            SessionEvent::Abort => self.lifecycle(LifecycleEvent::AbortRequested, None).await,
            SessionEvent::Network { online: true } => {
                info!("Network online");
                self.lifecycle(LifecycleEvent::NetworkOnline, None).await
            }
            SessionEvent::Network { online: false } => {
                warn!("Network offline");
                self.lifecycle(LifecycleEvent::NetworkOffline, None).await
            }
            SessionEvent::ManualTool(call) => self.ctx.dispatcher.dispatch(call),
            SessionEvent::Connected { attempt, transport } => {
                self.lifecycle(LifecycleEvent::Opened { attempt }, Some(transport)).await
            }
            SessionEvent::ConnectFailed {
                attempt,
                failure,
                reason,
            } => {
                if !self.machine.is_current(attempt) {
                    debug!("Ignoring failure of superseded attempt {}", attempt);
                    return;
                }
                match failure {
                    ConnectFailure::Permission => {
                        warn!("Media acquisition failed on attempt {}: {}", attempt, reason);
                        self.ctx.view.log(LineKind::Error, "CAMERA ACCESS DENIED. RETRYING...");
                    }
                    ConnectFailure::Transport => {
                        warn!("Connect attempt {} failed: {}", attempt, reason);
                    }
                    ConnectFailure::Fatal => {
                        error!("Connect attempt {} abandoned: {}", attempt, reason);
                        self.ctx.view.log(LineKind::Error, "ERROR: API KEY NOT FOUND");
                    }
                }
                self.lifecycle(LifecycleEvent::ConnectFailed { attempt, failure }, None).await
            }
            SessionEvent::ReconnectTimerFired { generation } => {
                self.lifecycle(LifecycleEvent::ReconnectTimerFired { generation }, None).await
            }
            SessionEvent::Shutdown => {}
        }
    }

    async fn on_transport(&mut self, attempt: AttemptId, event: TransportEvent) {
        if !self.machine.is_current(attempt) {
            debug!("Dropping event from stale attempt {}", attempt);
            return;
        }
        match event {
            TransportEvent::Message(message) => self.on_message(message),
            TransportEvent::Error(e) => {
                warn!("Transport error on attempt {}: {}", attempt, e);
                self.lifecycle(LifecycleEvent::TransportError { attempt }, None).await
            }
            TransportEvent::Closed => {
                info!("Transport closed on attempt {}", attempt);
                self.lifecycle(LifecycleEvent::TransportClosed { attempt }, None).await
            }
        }
    }

    fn on_message(&mut self, message: ApiResponse) {
        match message {
            ApiResponse::AudioResponse(payload) => {
                let output = self.ctx.output.clone();
                self.ctx.playback.with(|p| p.enqueue(&payload, output.as_ref()));
            }
            ApiResponse::ToolCall(calls) => {
                for call in calls {
                    self.ctx.dispatcher.dispatch(call);
                }
            }
            ApiResponse::TextResponse(text) => debug!("Model text: {}", text),
            ApiResponse::ToolCallCancellation(ids) => info!("Tool calls cancelled by server: {:?}", ids),
            ApiResponse::GoAway => warn!("Server announced disconnect"),
            ApiResponse::SetupComplete => {}
        }
    }

    async fn lifecycle(&mut self, event: LifecycleEvent, mut transport: Option<Box<dyn Transport>>) {
        let actions = self.machine.handle(event);
        for action in actions {
            self.apply(action, &mut transport).await;
        }

        if let Some(mut stale) = transport {
            debug!("Closing transport of a superseded attempt");
            tokio::spawn(async move {
                let _ = stale.close().await;
            });
        }

        let state = self.machine.state();
        self.ctx.view.update(|v| v.banner = state.banner());
        self.state_tx.send_replace(state);
    }

    async fn apply(&mut self, action: Action, transport: &mut Option<Box<dyn Transport>>) {
        match action {
            Action::BeginConnect { attempt, reconnect } => self.begin_connect(attempt, reconnect),
            Action::Activate { attempt, reconnect } => match transport.take() {
                Some(transport) => self.activate(attempt, reconnect, transport).await,
                None => error!("Attempt {} opened without a transport", attempt),
            },
            Action::TearDownTransport => self.ctx.tear_down_transport(),
            Action::ScheduleReconnect { generation } => self.schedule_reconnect(generation),
            Action::CancelReconnect => self.ctx.cancel_reconnect(),
            Action::TearDownAll => self.tear_down_all().await,
        }
    }

    fn begin_connect(&mut self, attempt: AttemptId, reconnect: bool) {
        self.ctx.tear_down_transport();
        info!(
            "🔌 Connect attempt {} ({})",
            attempt,
            if reconnect { "reconnect" } else { "fresh" }
        );

        if let Err(e) = self.connector.ready() {
            let _ = self.events_tx.send(SessionEvent::ConnectFailed {
                attempt,
                failure: ConnectFailure::Fatal,
                reason: e.to_string(),
            });
            return;
        }

        let media = self.ctx.media.clone();
        let connector = self.connector.clone();
        let setup = self.config.setup(self.ctx.dispatcher.registry().declarations());
        let events = self.events_tx.clone();
        let transport_events = self.transport_tx.clone();

        self.ctx.connect_task = Some(tokio::spawn(async move {
            let event = match media.ensure_stream().await {
                Err(e) => SessionEvent::ConnectFailed {
                    attempt,
                    failure: match e {
                        MediaError::PermissionDenied(_) | MediaError::Unavailable(_) => ConnectFailure::Permission,
                        _ => ConnectFailure::Transport,
                    },
                    reason: e.to_string(),
                },
                Ok(_) => match connector.connect(setup, attempt, transport_events).await {
                    Ok(transport) => SessionEvent::Connected { attempt, transport },
                    Err(e) => SessionEvent::ConnectFailed {
                        attempt,
                        failure: ConnectFailure::Transport,
                        reason: e.to_string(),
                    },
                },
            };
            let _ = events.send(event);
        }));
    }

    async fn activate(&mut self, attempt: AttemptId, reconnect: bool, transport: Box<dyn Transport>) {
        self.ctx.connect_task = None;
        let (outbound, writer) = spawn_writer(transport, attempt, self.transport_tx.clone());
        self.ctx.active = true;

        if let Err(e) = self.ctx.devices.acquire_wake_lock().await {
            warn!("Wake lock unavailable: {}", e);
        }

        self.ctx.playback.with(|p| p.reset());
        self.ctx.dispatcher.attach(outbound.clone());
        self.ctx.audio_pump = Some(spawn_audio_pump(
            AudioCaptureEncoder::new(WIRE_SAMPLE_RATE, INPUT_GAIN),
            self.ctx.media.subscribe(),
            outbound.clone(),
            self.ctx.user_speaking.clone(),
        ));
        self.ctx.video_sampler = Some(spawn_video_sampler(
            self.ctx.media.subscribe(),
            outbound.clone(),
            self.config.video_interval,
        ));

        outbound.send(Outbound::Text(SessionConfig::greeting(reconnect).to_string()));

        if reconnect {
            self.ctx.view.log(LineKind::Success, "UPLINK RESTORED.");
        } else {
            self.ctx.view.update(|v| {
                v.log(LineKind::Success, "BIOMETRIC_DATA: INSTALLED");
                v.log(LineKind::Warning, "SYSTEM: LOCKED. WAITING FOR CODE.");
                v.log(LineKind::System, "DOWNLOADING UNIVERSAL KNOWLEDGE DB...");
            });
            let view = self.ctx.view.clone();
            self.ctx.boot_lines = Some(tokio::spawn(async move {
                tokio::time::sleep(LIBRARY_ONLINE_DELAY).await;
                view.log(LineKind::Success, "LIBRARY DATABASE: ONLINE");
            }));
        }

        self.ctx.outbound = Some(outbound);
        self.ctx.writer = Some(writer);
        info!("✅ Session live on attempt {}", attempt);
    }

    fn schedule_reconnect(&mut self, generation: u64) {
        self.ctx.cancel_reconnect();
        let delay = self.config.reconnect_delay;
        info!("🔄 Reconnecting in {}ms", delay.as_millis());
        self.ctx.view.log(
            LineKind::Warning,
            format!("CONNECTION LOST. RETRYING IN {}s...", delay.as_secs()),
        );

        let events = self.events_tx.clone();
        self.ctx.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::ReconnectTimerFired { generation });
        }));
    }

    async fn tear_down_all(&mut self) {
        self.ctx.tear_down_transport();
        self.ctx.cancel_reconnect();
        self.ctx.media.stop().await;
        self.ctx.dispatcher.reset_authorization();
        self.ctx.devices.release_wake_lock().await;
        self.ctx.view.update(|v| {
            v.reset_for_abort();
            v.emotion = Emotion::Neutral;
            v.log(LineKind::System, "SESSION TERMINATED.");
        });
        info!("Session aborted by user");
    }
}
