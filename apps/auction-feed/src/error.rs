use auction_feed_proto::BidValidationError;
use thiserror::Error;

/// Conditions surfaced to the observer through `on_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Error notification pushed by the server. No local state changes.
    #[error("server error: {0}")]
    Server(String),
    /// The connection reported an error; a close usually follows.
    #[error("connection error: {0}")]
    Transport(String),
    /// Fatal for this session until the caller asks for a reconnect.
    #[error("failed to reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::ReconnectExhausted { .. })
    }
}

/// Errors returned to callers of [`crate::SessionHandle`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("invalid bid: {0}")]
    Validation(#[from] BidValidationError),
    #[error("not connected to the auction stream")]
    NotConnected,
    #[error("session has been closed")]
    SessionClosed,
}
