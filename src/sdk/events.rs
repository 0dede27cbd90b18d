use tokio::sync::mpsc;

use crate::messages::InboundMessage;
use crate::session::DisconnectionReason;

/// Callbacks raised by a session's background worker.
///
/// All three run on the worker task, one at a time, in protocol order. A
/// callback that blocks stalls the session, so hand heavy work off elsewhere.
pub trait QueryEvents: Send + Sync + 'static {
    fn on_connected_to_server(&self) {}

    fn on_message_received(&self, _message: &InboundMessage) {}

    fn on_disconnected_from_server(&self, _reason: DisconnectionReason) {}
}

/// Ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl QueryEvents for NoopEvents {}

/// Event as delivered through [`ChannelEvents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Message(InboundMessage),
    Disconnected(DisconnectionReason),
}

/// Forwards events into an unbounded channel for consumers that prefer to
/// `recv().await` over implementing [`QueryEvents`].
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl QueryEvents for ChannelEvents {
    fn on_connected_to_server(&self) {
        let _ = self.tx.send(ClientEvent::Connected);
    }

    fn on_message_received(&self, message: &InboundMessage) {
        let _ = self.tx.send(ClientEvent::Message(message.clone()));
    }

    fn on_disconnected_from_server(&self, reason: DisconnectionReason) {
        let _ = self.tx.send(ClientEvent::Disconnected(reason));
    }
}
