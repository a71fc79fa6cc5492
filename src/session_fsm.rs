//! Session lifecycle state machine
//!
//! Pure transition table: events in, actions out. The runner in
//! [`crate::session`] performs the actions, which keeps every transition
//! testable without sockets or timers.
//!
//! ```text
//! Disconnected --start--> Connecting --opened--> Connected
//!      ^                   ^     |                  |
//!      |          timer/online   +-- fail/close --> Reconnecting
//!      +---------------- abort (from any state) ----------+
//! ```

use crate::transport::AttemptId;
use crate::view::Banner;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl SessionState {
    pub fn banner(&self) -> Banner {
        match self {
            Self::Disconnected => Banner::Disconnected,
            Self::Connecting => Banner::Connecting,
            Self::Connected => Banner::Connected,
            Self::Reconnecting => Banner::Reconnecting,
        }
    }
}

/// Why a connect attempt did not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Camera or microphone denied; retried like a transport failure.
    Permission,
    Transport,
    /// Nothing a retry can fix (no API key).
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    StartRequested,
    AbortRequested,
    Opened { attempt: AttemptId },
    ConnectFailed { attempt: AttemptId, failure: ConnectFailure },
    TransportError { attempt: AttemptId },
    TransportClosed { attempt: AttemptId },
    NetworkOnline,
    NetworkOffline,
    ReconnectTimerFired { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Tear down any stale transport (media kept) and open `attempt`.
    BeginConnect { attempt: AttemptId, reconnect: bool },
    /// The attempt opened: wake lock, pipelines, greeting.
    Activate { attempt: AttemptId, reconnect: bool },
    /// Drop the transport, writer and pipelines. Media stays acquired.
    TearDownTransport,
    ScheduleReconnect { generation: u64 },
    CancelReconnect,
    /// User abort: stop media, reset authorization and view.
    TearDownAll,
}

pub type Actions = SmallVec<[Action; 4]>;

#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    /// Attempt whose callbacks are still honoured.
    current_attempt: Option<AttemptId>,
    next_attempt: AttemptId,
    /// Generation of the single pending reconnect timer.
    timer: Option<u64>,
    next_timer: u64,
    user_initiated_disconnect: bool,
    has_connected: bool,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            current_attempt: None,
            next_attempt: 1,
            timer: None,
            next_timer: 1,
            user_initiated_disconnect: false,
            has_connected: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_attempt(&self) -> Option<AttemptId> {
        self.current_attempt
    }

    pub fn pending_timer(&self) -> Option<u64> {
        self.timer
    }

    pub fn is_user_initiated_disconnect(&self) -> bool {
        self.user_initiated_disconnect
    }

    /// True for callbacks from the attempt currently in flight or open.
    pub fn is_current(&self, attempt: AttemptId) -> bool {
        self.current_attempt == Some(attempt)
    }

    pub fn handle(&mut self, event: LifecycleEvent) -> Actions {
        let before = self.state;
        let actions = self.transition(event);
        if self.state != before {
            info!("🔄 Session {:?} -> {:?} ({:?})", before, self.state, event);
        }
        actions
    }

    fn transition(&mut self, event: LifecycleEvent) -> Actions {
        use LifecycleEvent::*;
        use SessionState::*;

        match (self.state, event) {
            (Disconnected, StartRequested) => {
                self.user_initiated_disconnect = false;
                self.begin_connect()
            }
            (_, StartRequested) => {
                debug!("Start ignored while {:?}", self.state);
                smallvec![]
            }

            (_, AbortRequested) => {
                self.user_initiated_disconnect = true;
                self.state = Disconnected;
                self.current_attempt = None;
                self.has_connected = false;
                let mut actions = Actions::new();
                if self.timer.take().is_some() {
                    actions.push(Action::CancelReconnect);
                }
                actions.push(Action::TearDownAll);
                actions
            }

            (Connecting, Opened { attempt }) if self.is_current(attempt) => {
                self.state = Connected;
                let reconnect = self.has_connected;
                self.has_connected = true;
                smallvec![Action::Activate { attempt, reconnect }]
            }

            (Connecting, ConnectFailed { attempt, failure }) if self.is_current(attempt) => match failure {
                ConnectFailure::Fatal => {
                    warn!("Connect attempt {} failed permanently", attempt);
                    self.state = Disconnected;
                    self.current_attempt = None;
                    smallvec![Action::TearDownTransport]
                }
                ConnectFailure::Permission | ConnectFailure::Transport => self.enter_reconnecting(),
            },

            (Connecting | Connected, TransportError { attempt } | TransportClosed { attempt })
                if self.is_current(attempt) && !self.user_initiated_disconnect =>
            {
                self.enter_reconnecting()
            }

            (Connecting | Connected, NetworkOffline) => self.enter_reconnecting(),

            (Reconnecting, NetworkOnline) => {
                let mut actions = Actions::new();
                if self.timer.take().is_some() {
                    actions.push(Action::CancelReconnect);
                }
                actions.extend(self.begin_connect());
                actions
            }

            (Reconnecting, ReconnectTimerFired { generation }) if self.timer == Some(generation) => {
                self.timer = None;
                self.begin_connect()
            }

            (state, event) => {
                debug!("Ignoring {:?} in {:?}", event, state);
                smallvec![]
            }
        }
    }

    fn begin_connect(&mut self) -> Actions {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.current_attempt = Some(attempt);
        self.state = SessionState::Connecting;
        smallvec![Action::BeginConnect {
            attempt,
            reconnect: self.has_connected,
        }]
    }

    fn enter_reconnecting(&mut self) -> Actions {
        self.state = SessionState::Reconnecting;
        self.current_attempt = None;
        let mut actions: Actions = smallvec![Action::TearDownTransport];
        if self.timer.is_none() {
            let generation = self.next_timer;
            self.next_timer += 1;
            self.timer = Some(generation);
            actions.push(Action::ScheduleReconnect { generation });
        }
        actions
    }
}
