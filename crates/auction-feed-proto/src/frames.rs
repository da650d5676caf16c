use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{BidAmount, BidEvent, SequenceNumber};

/// Frames pushed by the auction server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Snapshot of the auction as of `sequence`.
    InitialState {
        sequence: SequenceNumber,
        #[serde(default)]
        data: Option<Value>,
    },
    /// Batched catch-up reply to a `sync_request` or a resumed connection.
    ReconnectSync {
        #[serde(default)]
        missed_count: u64,
        #[serde(default)]
        truncated: bool,
        #[serde(default)]
        messages: Vec<BidEvent>,
    },
    #[serde(rename = "bid_update", alias = "update")]
    BidUpdate(BidEvent),
    /// Liveness probe carrying the server's current head sequence.
    Ping { sequence: SequenceNumber },
    Error { message: String },
    HealthWarning { message: String },
}

const KNOWN_KINDS: &[&str] = &[
    "initial_state",
    "reconnect_sync",
    "bid_update",
    "update",
    "ping",
    "error",
    "health_warning",
];

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::InitialState { .. } => "initial_state",
            ServerFrame::ReconnectSync { .. } => "reconnect_sync",
            ServerFrame::BidUpdate(_) => "bid_update",
            ServerFrame::Ping { .. } => "ping",
            ServerFrame::Error { .. } => "error",
            ServerFrame::HealthWarning { .. } => "health_warning",
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Pong { sequence: SequenceNumber },
    Ack { sequence: SequenceNumber },
    SyncRequest { from_sequence: SequenceNumber },
    Bid { amount: BidAmount },
}

impl ClientFrame {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Encode(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    Malformed(String),
    #[error("frame has no `type` field")]
    MissingKind,
    #[error("unknown frame kind {0:?}")]
    UnknownKind(String),
    #[error("invalid {kind} frame: {reason}")]
    InvalidFrame { kind: String, reason: String },
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Unknown kinds are a diagnostic, not a sign of a broken stream.
    pub fn is_unknown_kind(&self) -> bool {
        matches!(self, ProtocolError::UnknownKind(_))
    }
}

/// Decodes one inbound text frame.
///
/// Unknown kinds are reported separately from malformed frames so callers
/// can log them at a lower severity.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingKind)?
        .to_owned();
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownKind(kind));
    }
    serde_json::from_value(value).map_err(|err| ProtocolError::InvalidFrame {
        kind,
        reason: err.to_string(),
    })
}
