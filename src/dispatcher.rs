//! Tool call dispatcher
//!
//! Routes every incoming call through the registered command table, enforcing
//! the authorization gate and the busy flag, and sends exactly one response
//! per call (manual triggers excepted). Handlers run as spawned tasks so a
//! panic or error is reported as `execution_failed` and the busy flag is
//! always released.

use crate::devices::{DeviceControl, LockStore};
use crate::gemini::{ToolCallRequest, ToolCallResponse};
use crate::media::MediaHub;
use crate::scenario::ScenarioEngine;
use crate::tools::{
    Gate, ToolContext, ToolEntry, ToolError, ToolOutcome, ToolRegistry, ViewChange, RESULT_FAILED, RESULT_LOCKED,
};
use crate::transport::{Outbound, OutboundTx};
use crate::view::{Emotion, LineKind, SharedView};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Calls with this id come from the local UI, not the model; they get no response.
pub const MANUAL_TRIGGER_ID: &str = "manual_trigger";

/// How long an unregistered tool keeps the busy flag.
pub const DEFAULT_ACK_DELAY: Duration = Duration::from_millis(200);

/// Collaborators handed to tool handlers.
#[derive(Clone)]
pub struct DispatcherDeps {
    pub view: SharedView,
    pub media: Option<MediaHub>,
    pub devices: Arc<dyn DeviceControl>,
    pub scenario: Arc<dyn ScenarioEngine>,
    pub lock_store: Arc<dyn LockStore>,
}

/// State shared with in-flight handler tasks.
struct Shared {
    deps: DispatcherDeps,
    authorized: AtomicBool,
    busy: AtomicBool,
    /// Bumped by every gated model call; older follow-up sequences stop at their next step.
    sequence: AtomicU64,
}

impl Shared {
    fn context(&self) -> ToolContext {
        ToolContext {
            view: self.deps.view.clone(),
            media: self.deps.media.clone(),
            devices: self.deps.devices.clone(),
            scenario: self.deps.scenario.clone(),
        }
    }

    fn is_current(&self, sequence: u64) -> bool {
        self.sequence.load(Ordering::SeqCst) == sequence
    }

    fn grant(&self) {
        if self.authorized.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🔓 Session authorized");
        if let Err(e) = self.deps.lock_store.set_locked(false) {
            warn!("Failed to persist lock flag: {}", e);
        }
        self.deps.view.update(|v| {
            v.locked_overlay = false;
            v.emotion = Emotion::Love;
            v.log(LineKind::Success, "ACCESS GRANTED. WELCOME.");
        });
    }
}

pub struct ToolCallDispatcher {
    registry: Arc<ToolRegistry>,
    shared: Arc<Shared>,
    outbound: Option<OutboundTx>,
    tasks: Vec<JoinHandle<()>>,
    ack_delay: Duration,
}

impl ToolCallDispatcher {
    pub fn new(registry: ToolRegistry, deps: DispatcherDeps) -> Self {
        Self {
            registry: Arc::new(registry),
            shared: Arc::new(Shared {
                deps,
                authorized: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
            }),
            outbound: None,
            tasks: Vec::new(),
            ack_delay: DEFAULT_ACK_DELAY,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Route responses to a freshly opened connection.
    pub fn attach(&mut self, outbound: OutboundTx) {
        self.outbound = Some(outbound);
    }

    pub fn detach(&mut self) {
        self.outbound = None;
    }

    pub fn is_authorized(&self) -> bool {
        self.shared.authorized.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Lock the session again. Only the user's abort does this.
    pub fn reset_authorization(&mut self) {
        if self.shared.authorized.swap(false, Ordering::SeqCst) {
            info!("🔒 Session authorization reset");
        }
        self.shared.deps.view.update(|v| v.locked_overlay = true);
    }

    /// Abort every in-flight handler and follow-up sequence.
    pub fn cancel_all(&mut self) {
        let pending = self.tasks.len();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.sequence.fetch_add(1, Ordering::SeqCst);
        self.shared.busy.store(false, Ordering::SeqCst);
        if pending > 0 {
            debug!("Cancelled {} tool tasks", pending);
        }
    }

    pub fn dispatch(&mut self, call: ToolCallRequest) {
        self.tasks.retain(|t| !t.is_finished());

        let entry = self.registry.get(&call.name).cloned();
        let gate = entry.as_ref().map(|e| e.gate).unwrap_or(Gate::Authorized);
        let respond = call.id != MANUAL_TRIGGER_ID;
        let outbound = if respond { self.outbound.clone() } else { None };
        info!("🔧 Tool call: {} ({})", call.name, call.id);

        if gate == Gate::Open {
            let shared = self.shared.clone();
            self.tasks.push(tokio::spawn(async move {
                let result = match entry {
                    Some(entry) => match run_guarded(&entry, &call, &shared).await {
                        Ok(outcome) => outcome.result,
                        Err(_) => RESULT_FAILED.to_string(),
                    },
                    None => RESULT_FAILED.to_string(),
                };
                send_response(outbound.as_ref(), &call, result);
            }));
            return;
        }

        if gate == Gate::Authorized && !self.is_authorized() {
            warn!("Rejected {} while locked", call.name);
            self.shared.deps.view.update(|v| {
                v.emotion = Emotion::Angry;
                v.log(LineKind::Error, "SYSTEM LOCKED. ACCESS CODE REQUIRED.");
            });
            send_response(outbound.as_ref(), &call, RESULT_LOCKED.to_string());
            return;
        }

        // Manual triggers stay outside the gate: they neither take busy nor
        // supersede the sequence that holds it.
        let holds_busy = respond;
        let sequence = if holds_busy {
            self.shared.busy.store(true, Ordering::SeqCst);
            self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.shared.sequence.load(Ordering::SeqCst)
        };

        if let Some(entry) = &entry {
            match entry.handler.target_view(&call) {
                ViewChange::Keep => {}
                ViewChange::Show(view) => self.shared.deps.view.update(|v| v.active_view = Some(view)),
                ViewChange::Dashboard => self.shared.deps.view.update(|v| v.active_view = None),
            }
        }

        let shared = self.shared.clone();
        let ack_delay = self.ack_delay;
        self.tasks.push(tokio::spawn(async move {
            let release = |shared: &Shared| {
                if holds_busy && shared.is_current(sequence) {
                    shared.busy.store(false, Ordering::SeqCst);
                }
            };

            let outcome = match &entry {
                Some(entry) => run_guarded(entry, &call, &shared).await,
                None => Ok(ToolOutcome::success()),
            };

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Tool {} failed: {}", call.name, e);
                    shared.deps.view.log(LineKind::Error, format!("[ERROR] {} FAILED", call.name.to_uppercase()));
                    release(&shared);
                    send_response(outbound.as_ref(), &call, RESULT_FAILED.to_string());
                    return;
                }
            };

            if outcome.authorize {
                shared.grant();
            }
            send_response(outbound.as_ref(), &call, outcome.result);

            if entry.is_none() {
                tokio::time::sleep(ack_delay).await;
            }
            for step in outcome.steps {
                if !step.delay.is_zero() {
                    tokio::time::sleep(step.delay).await;
                }
                if !shared.is_current(sequence) {
                    debug!("Sequence for {} superseded", call.name);
                    return;
                }
                shared.deps.view.log(step.kind, step.text);
            }
            release(&shared);
        }));
    }

    /// Wait for every in-flight task.
    #[cfg(test)]
    pub(crate) async fn settle(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for ToolCallDispatcher {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Run a handler on its own task so a panic surfaces as an error.
async fn run_guarded(entry: &ToolEntry, call: &ToolCallRequest, shared: &Shared) -> Result<ToolOutcome, ToolError> {
    let handler = entry.handler.clone();
    let call = call.clone();
    let ctx = shared.context();
    match tokio::spawn(async move { handler.call(&call, &ctx).await }).await {
        Ok(result) => result,
        Err(e) => {
            error!("Tool handler task failed: {}", e);
            Err(ToolError::Panicked)
        }
    }
}

fn send_response(outbound: Option<&OutboundTx>, call: &ToolCallRequest, result: String) {
    let Some(outbound) = outbound else {
        return;
    };
    let response = ToolCallResponse {
        id: call.id.clone(),
        name: call.name.clone(),
        result,
    };
    if !outbound.send(Outbound::ToolResponse(response)) {
        debug!("Dropped response for {}: connection gone", call.id);
    }
}
