//! Transport seam and the per-generation outbound writer
//!
//! A [`Connector`] opens one transport per connect attempt. Every producer
//! (audio pump, video sampler, dispatcher, greeting) pushes [`Outbound`]
//! messages into that generation's channel; the writer task is the single
//! point where they reach the socket, so frames leave in capture order.

use crate::gemini::{ApiResponse, BidiGenerateContentSetup, ClientMessage, Result};
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Monotonic id of a connect attempt. Callbacks from older attempts are stale.
pub type AttemptId = u64;

/// Asynchronous callbacks from an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ApiResponse),
    Error(String),
    Closed,
}

/// Sink for transport callbacks, tagged with the attempt that produced them.
pub type TransportEvents = UnboundedSender<(AttemptId, TransportEvent)>;

/// An open session with the remote agent.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: ClientMessage) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens transports. `connect` resolves once the remote side accepted setup.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Checked before any media is acquired; an error here is not retried.
    fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(
        &self,
        setup: BidiGenerateContentSetup,
        attempt: AttemptId,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>>;
}

/// Something producers can push onto the wire.
#[derive(Debug, Clone)]
pub enum Outbound {
    Audio(Vec<u8>),
    Video(Vec<u8>),
    Text(String),
    ToolResponse(crate::gemini::ToolCallResponse),
}

impl Outbound {
    fn into_message(self) -> ClientMessage {
        match self {
            Self::Audio(pcm) => ClientMessage::media(crate::audio_encoder::WIRE_MIME_TYPE, &pcm),
            Self::Video(jpeg) => ClientMessage::media("image/jpeg", &jpeg),
            Self::Text(text) => ClientMessage::user_text(&text),
            Self::ToolResponse(response) => ClientMessage::ToolResponse(response),
        }
    }
}

/// Sending half of one generation's outbound channel.
#[derive(Debug, Clone)]
pub struct OutboundTx(UnboundedSender<Outbound>);

impl OutboundTx {
    /// Returns false once the generation is gone.
    pub fn send(&self, msg: Outbound) -> bool {
        self.0.send(msg).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn channel() -> (Self, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

/// Start the writer task for a freshly opened transport.
pub fn spawn_writer(
    transport: Box<dyn Transport>,
    attempt: AttemptId,
    events: TransportEvents,
) -> (OutboundTx, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_writer(transport, rx, attempt, events));
    (OutboundTx(tx), handle)
}

/// Drain the outbound channel into the transport until every sender is dropped.
async fn run_writer(
    mut transport: Box<dyn Transport>,
    mut outgoing_rx: UnboundedReceiver<Outbound>,
    attempt: AttemptId,
    events: TransportEvents,
) {
    info!("Outbound writer started for attempt {}", attempt);

    while let Some(msg) = outgoing_rx.recv().await {
        match &msg {
            Outbound::Audio(pcm) => debug!("🎤 Sending audio chunk ({} bytes)", pcm.len()),
            Outbound::Video(jpeg) => debug!("📹 Sending video frame ({} KB)", jpeg.len() / 1024),
            Outbound::Text(_) => info!("📤 Sending client text turn"),
            Outbound::ToolResponse(r) => info!("📤 Sending tool response {} -> {}", r.name, r.result),
        }

        if let Err(e) = transport.send(msg.into_message()).await {
            warn!("Outbound send failed on attempt {}: {}", attempt, e);
            let _ = events.send((attempt, TransportEvent::Error(e.to_string())));
            break;
        }
    }

    if let Err(e) = transport.close().await {
        debug!("Transport close on attempt {}: {}", attempt, e);
    }
    info!("Outbound writer for attempt {} shut down", attempt);
}
