//! The embedder-facing handler contract and the send handle.

use crate::error::BridgeError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Why an established connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The embedder cancelled the supervisor.
    Cancelled,
    ReadError(String),
    WriteError(String),
    /// No pong arrived within the read deadline.
    PingTimeout,
    /// The server sent a close frame (or dropped the stream without one).
    ServerClose(Option<u16>),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Cancelled => write!(f, "cancelled"),
            DisconnectReason::ReadError(e) => write!(f, "read error: {}", e),
            DisconnectReason::WriteError(e) => write!(f, "write error: {}", e),
            DisconnectReason::PingTimeout => write!(f, "ping timeout"),
            DisconnectReason::ServerClose(Some(code)) => {
                write!(f, "server close (code {})", code)
            }
            DisconnectReason::ServerClose(None) => write!(f, "server close"),
        }
    }
}

/// Callbacks driven by the connection loop.
///
/// `on_connect` hands over a [`MessageSender`] for the new connection.
/// That handle dies with the connection: after `on_disconnect` fires it
/// only returns [`BridgeError::Closed`], and implementations must not
/// retain it across reconnects; each reconnect delivers a fresh one.
pub trait ConnectionHandler: Send + Sync {
    /// A connection was established; `sender` writes to it.
    fn on_connect(&self, _sender: MessageSender) {}

    /// An inbound text or binary frame arrived.
    fn on_message(&self, message: Message);

    /// The connection ended. Fires exactly once per established
    /// connection, before any reconnection attempt.
    fn on_disconnect(&self, reason: &DisconnectReason);

    /// Veto reconnection for failures the embedder knows to be fatal,
    /// e.g. an application-level rejection received before the drop.
    /// Consulted after `on_disconnect` for reasons the loop itself
    /// classified as transient.
    fn is_fatal(&self, _reason: &DisconnectReason) -> bool {
        false
    }
}

/// Cloneable, task-safe handle into the bounded outbound queue.
///
/// `send` never blocks: it enqueues or reports why it cannot.
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<Message>,
}

impl MessageSender {
    pub(crate) fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: Message) -> Result<(), BridgeError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => BridgeError::Closed,
            mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull,
        })
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), BridgeError> {
        self.send(Message::Text(text.into().into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_enqueues_until_the_queue_is_full() {
        let (tx, mut rx) = mpsc::channel(2);
        let sender = MessageSender::new(tx);

        sender.send_text("one").unwrap();
        sender.send_text("two").unwrap();
        assert!(matches!(
            sender.send_text("three"),
            Err(BridgeError::QueueFull)
        ));

        assert_eq!(rx.recv().await.unwrap().into_text().unwrap().as_str(), "one");
    }

    #[tokio::test]
    async fn send_reports_closed_after_the_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(2);
        let sender = MessageSender::new(tx);
        drop(rx);

        assert!(sender.is_closed());
        assert!(matches!(sender.send_text("late"), Err(BridgeError::Closed)));
    }
}
