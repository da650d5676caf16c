//! Scripted in-memory transport for tests and offline demos.

use std::sync::Arc;

use auction_feed_proto::{ClientFrame, CLOSE_ABNORMAL};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use super::{Connection, EventSender, Transport, TransportError, TransportEvent};
use crate::session::ConnectionId;

/// What happens when the session opens a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Nothing until the test calls [`MockTransport::accept`].
    Manual,
    /// Report `Opened` immediately.
    Accept,
    /// Report an error followed by an abnormal close.
    Refuse,
}

#[derive(Debug, Clone)]
pub struct OpenedConnection {
    pub id: ConnectionId,
    pub url: Url,
    pub at: Instant,
}

struct ConnectionRecord {
    id: ConnectionId,
    events: EventSender,
    sent: Vec<String>,
    closed: Option<(u16, String)>,
}

struct MockState {
    behavior: OpenBehavior,
    opened: Vec<OpenedConnection>,
    connections: Vec<ConnectionRecord>,
}

/// A transport whose connections are driven by the test. Clones share state,
/// so a test keeps one clone and hands the other to the session.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(OpenBehavior::Accept)
    }
}

impl MockTransport {
    pub fn new(behavior: OpenBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                behavior,
                opened: Vec::new(),
                connections: Vec::new(),
            })),
        }
    }

    pub fn set_behavior(&self, behavior: OpenBehavior) {
        self.state.lock().behavior = behavior;
    }

    /// Every connection attempt so far, oldest first.
    pub fn opened(&self) -> Vec<OpenedConnection> {
        self.state.lock().opened.clone()
    }

    pub fn latest(&self) -> Option<ConnectionId> {
        self.state.lock().opened.last().map(|opened| opened.id)
    }

    pub fn accept(&self, id: ConnectionId) {
        self.emit(id, TransportEvent::Opened);
    }

    pub fn push_text(&self, id: ConnectionId, text: impl Into<String>) {
        self.emit(id, TransportEvent::Frame(text.into()));
    }

    pub fn push_json(&self, id: ConnectionId, frame: Value) {
        self.push_text(id, frame.to_string());
    }

    pub fn push_error(&self, id: ConnectionId, message: impl Into<String>) {
        self.emit(id, TransportEvent::Error(message.into()));
    }

    /// Server-side close with `code`.
    pub fn close_from_server(&self, id: ConnectionId, code: u16) {
        self.emit(
            id,
            TransportEvent::Closed {
                code,
                reason: String::new(),
            },
        );
    }

    /// Drops the connection without a close handshake.
    pub fn drop_connection(&self, id: ConnectionId) {
        self.close_from_server(id, CLOSE_ABNORMAL);
    }

    /// Frames the client sent on `id`, decoded.
    pub fn sent(&self, id: ConnectionId) -> Vec<ClientFrame> {
        let state = self.state.lock();
        state
            .connections
            .iter()
            .filter(|record| record.id == id)
            .flat_map(|record| record.sent.iter())
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Frames the client sent on any connection, in connection order.
    pub fn all_sent(&self) -> Vec<ClientFrame> {
        let state = self.state.lock();
        state
            .connections
            .iter()
            .flat_map(|record| record.sent.iter())
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Close code the client used for `id`, if it closed it.
    pub fn closed_with(&self, id: ConnectionId) -> Option<u16> {
        let state = self.state.lock();
        state
            .connections
            .iter()
            .find(|record| record.id == id)
            .and_then(|record| record.closed.as_ref().map(|(code, _)| *code))
    }

    fn emit(&self, id: ConnectionId, event: TransportEvent) {
        let state = self.state.lock();
        if let Some(record) = state.connections.iter().find(|record| record.id == id) {
            let _ = record.events.send((id, event));
        }
    }
}

impl Transport for MockTransport {
    fn open(&self, id: ConnectionId, url: Url, events: EventSender) -> Box<dyn Connection> {
        let mut state = self.state.lock();
        state.opened.push(OpenedConnection {
            id,
            url,
            at: Instant::now(),
        });
        match state.behavior {
            OpenBehavior::Manual => {}
            OpenBehavior::Accept => {
                let _ = events.send((id, TransportEvent::Opened));
            }
            OpenBehavior::Refuse => {
                let _ = events.send((id, TransportEvent::Error("connection refused".into())));
                let _ = events.send((
                    id,
                    TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "connection refused".into(),
                    },
                ));
            }
        }
        state.connections.push(ConnectionRecord {
            id,
            events,
            sent: Vec::new(),
            closed: None,
        });
        Box::new(MockConnection {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

struct MockConnection {
    id: ConnectionId,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    fn with_record<R>(&self, f: impl FnOnce(&mut ConnectionRecord) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state
            .connections
            .iter_mut()
            .find(|record| record.id == self.id)
            .map(f)
    }
}

impl Connection for MockConnection {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.with_record(|record| {
            if record.closed.is_some() {
                return Err(TransportError::Closed);
            }
            record.sent.push(text);
            Ok(())
        })
        .unwrap_or(Err(TransportError::Closed))
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.with_record(|record| {
            if record.closed.is_none() {
                record.closed = Some((code, reason.to_string()));
                let _ = record.events.send((
                    record.id,
                    TransportEvent::Closed {
                        code,
                        reason: reason.to_string(),
                    },
                ));
            }
        });
    }
}
