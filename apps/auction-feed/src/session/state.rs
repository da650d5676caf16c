use auction_feed_proto::SequenceNumber;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

impl ConnectionStatus {
    /// A transport exists for this status and must be closed to replace it.
    pub fn has_connection(self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Open)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Identifies one transport connection. Every (re)open gets a new id, and
/// events tagged with an old id are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next(self) -> Self {
        ConnectionId(self.0 + 1)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counters and positions reported through [`crate::SessionHandle::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub expected_sequence: SequenceNumber,
    pub last_accepted_sequence: SequenceNumber,
    pub buffered: usize,
    pub accepted: u64,
    pub duplicates: u64,
    pub last_acked_sequence: Option<SequenceNumber>,
    pub acks_sent: u64,
    pub resync_requests: u64,
    pub resync_replies: u64,
    pub reconnect_attempts: u32,
    pub connections_opened: u64,
    pub malformed_frames: u64,
}
