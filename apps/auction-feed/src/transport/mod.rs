use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::session::ConnectionId;

pub mod mock;
pub mod websocket;

pub use mock::{MockTransport, OpenBehavior};
pub use websocket::WebSocketTransport;

/// Connection lifecycle and inbound traffic, as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Error(String),
    /// Terminal for the connection. Failed opens report an abnormal close.
    Closed { code: u16, reason: String },
}

/// Every event is tagged with the connection that produced it.
pub type EventSender = mpsc::UnboundedSender<(ConnectionId, TransportEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,
    #[error("transport error: {0}")]
    Other(String),
}

/// Opens duplex text connections to the stream endpoint.
///
/// `open` must not block: connecting happens in the background and its
/// outcome is reported through `events` as `Opened` or `Closed`.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, id: ConnectionId, url: Url, events: EventSender) -> Box<dyn Connection>;
}

/// A live (or pending) connection owned by the session task.
pub trait Connection: Send {
    fn send(&self, text: String) -> Result<(), TransportError>;
    fn close(&mut self, code: u16, reason: &str);
}
