use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::SequenceNumber;

/// A single accepted bid as broadcast by the server.
///
/// Events are immutable once received; the session layer only ever moves them
/// between the reorder buffer and the observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidEvent {
    pub sequence: SequenceNumber,
    pub amount: i64,
    pub username: String,
    pub bid_count: u64,
    pub timestamp: ServerTimestamp,
}

impl BidEvent {
    /// Server time of the bid, if the timestamp is representable.
    pub fn server_time(&self) -> Option<OffsetDateTime> {
        self.timestamp.to_offset_datetime()
    }
}

/// Servers emit either RFC 3339 text or epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerTimestamp {
    Millis(i64),
    Text(String),
}

impl ServerTimestamp {
    pub fn to_offset_datetime(&self) -> Option<OffsetDateTime> {
        match self {
            ServerTimestamp::Millis(ms) => {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(*ms) * 1_000_000).ok()
            }
            ServerTimestamp::Text(text) => OffsetDateTime::parse(text, &Rfc3339).ok(),
        }
    }
}

impl std::fmt::Display for ServerTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_offset_datetime() {
            Some(at) => match at.format(&Rfc3339) {
                Ok(text) => f.write_str(&text),
                Err(_) => write!(f, "{at}"),
            },
            None => match self {
                ServerTimestamp::Millis(ms) => write!(f, "{ms}"),
                ServerTimestamp::Text(text) => f.write_str(text),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_millis_timestamps() {
        let text = ServerTimestamp::Text("2024-03-01T12:00:00Z".into());
        let millis = ServerTimestamp::Millis(1_709_294_400_000);
        assert_eq!(text.to_offset_datetime(), millis.to_offset_datetime());
        assert!(text.to_offset_datetime().is_some());
    }

    #[test]
    fn unparseable_text_timestamp_is_kept_verbatim() {
        let ts = ServerTimestamp::Text("yesterday".into());
        assert!(ts.to_offset_datetime().is_none());
        assert_eq!(ts.to_string(), "yesterday");
    }
}
