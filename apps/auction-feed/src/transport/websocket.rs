use auction_feed_proto::{CLOSE_ABNORMAL, CLOSE_NORMAL};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use super::{Connection, EventSender, Transport, TransportError, TransportEvent};
use crate::session::ConnectionId;

/// Close code reported when the peer closes without a status.
const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, id: ConnectionId, url: Url, events: EventSender) -> Box<dyn Connection> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            run_connection(id, url, rx, events).await;
        });
        Box::new(WebSocketConnection { tx })
    }
}

struct WebSocketConnection {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection for WebSocketConnection {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Drives one websocket until either side closes it.
async fn run_connection(
    id: ConnectionId,
    url: Url,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    events: EventSender,
) {
    debug!(target = "auction_feed.transport", %id, %url, "connecting");
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            warn!(target = "auction_feed.transport", %id, error = %err, "connection failed");
            let _ = events.send((id, TransportEvent::Error(err.to_string())));
            let _ = events.send((
                id,
                TransportEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "connection failed".into(),
                },
            ));
            return;
        }
    };
    let _ = events.send((id, TransportEvent::Opened));

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (code, reason) = loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    trace!(target = "auction_feed.transport", %id, bytes = text.len(), "send");
                    if let Err(err) = ws_sender.send(Message::Text(text)).await {
                        let _ = events.send((id, TransportEvent::Error(err.to_string())));
                        break (CLOSE_ABNORMAL, err.to_string());
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break (code, reason);
                }
                None => break (CLOSE_NORMAL, "connection dropped".to_string()),
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if events.send((id, TransportEvent::Frame(text))).is_err() {
                        break (CLOSE_NORMAL, "session gone".to_string());
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = events.send((id, TransportEvent::Frame(text)));
                    }
                    Err(err) => {
                        warn!(target = "auction_feed.transport", %id, error = %err, "dropping non-utf8 binary frame");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = events.send((id, TransportEvent::Error(err.to_string())));
                    break (CLOSE_ABNORMAL, err.to_string());
                }
                None => break (CLOSE_ABNORMAL, "stream ended".to_string()),
            },
        }
    };
    // Completes the close handshake, or flushes our reply to the peer's.
    let _ = ws_sender.close().await;

    debug!(target = "auction_feed.transport", %id, code, %reason, "connection closed");
    let _ = events.send((id, TransportEvent::Closed { code, reason }));
}
