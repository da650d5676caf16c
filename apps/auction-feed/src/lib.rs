//! Ordered-delivery session layer for live auction bid streams.
//!
//! A session keeps one WebSocket subscription to an auction, hands accepted
//! bid events to a [`SessionObserver`] in strict sequence order, acknowledges
//! them, catches up after gaps and reconnects with bounded backoff.

pub mod ack;
pub mod config;
pub mod error;
pub mod logging;
pub mod reconnect;
pub mod resync;
pub mod sequencer;
pub mod session;
pub mod transport;

pub use auction_feed_proto as proto;
pub use config::FeedConfig;
pub use error::{ClientError, SessionError};
pub use session::{
    spawn, ConnectionStatus, Degraded, ObserverFns, SessionHandle, SessionObserver, SessionStats,
};
