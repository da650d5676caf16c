//! Wire vocabulary for the live auction bid stream.
//!
//! The server pushes JSON text frames tagged by a `type` field; the client
//! answers with acknowledgements, probe replies, resync requests and bids.
//! This crate only describes those frames. Ordering, acknowledgement policy
//! and reconnection live in the `auction-feed` client.

mod bid;
mod event;
mod frames;

pub use bid::{BidAmount, BidValidationError};
pub use event::{BidEvent, ServerTimestamp};
pub use frames::{decode_server_frame, ClientFrame, ProtocolError, ServerFrame};

/// Server-assigned, strictly increasing position of an event in the stream.
pub type SequenceNumber = u64;

/// Close code used for every client-initiated close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when a connection drops without a close handshake,
/// including failed connection attempts.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Returns true when a close code must not trigger reconnection.
pub fn is_normal_close(code: u16) -> bool {
    code == CLOSE_NORMAL
}
