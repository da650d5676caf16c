use auction_feed_proto::{BidEvent, SequenceNumber};
use serde_json::Value;

use crate::error::SessionError;

/// Non-fatal conditions the presentation layer may want to react to, for
/// example by offering the user a manual reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degraded {
    /// The server could not replay the whole gap.
    TruncatedResync { missed_count: u64, supplied: usize },
    /// Advisory pushed by the server. The session does not reconnect on its own.
    HealthWarning(String),
    /// A snapshot older than the stream position was ignored.
    StaleSnapshot {
        sequence: SequenceNumber,
        last_accepted: SequenceNumber,
    },
}

impl std::fmt::Display for Degraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Degraded::TruncatedResync {
                missed_count,
                supplied,
            } => write!(
                f,
                "history truncated: {supplied} of {missed_count} missed events replayed"
            ),
            Degraded::HealthWarning(message) => write!(f, "connection health: {message}"),
            Degraded::StaleSnapshot {
                sequence,
                last_accepted,
            } => write!(
                f,
                "ignored snapshot at {sequence}; already past {last_accepted}"
            ),
        }
    }
}

/// Callbacks into the presentation layer.
///
/// All methods run on the session task, one at a time, in the order the
/// session produced them. Accepted events arrive in strictly increasing
/// sequence order with no gaps and no repeats. Implementations should return
/// quickly; anything slow belongs on another task.
pub trait SessionObserver: Send + 'static {
    fn on_snapshot(&mut self, _sequence: SequenceNumber, _data: Option<&Value>) {}
    fn on_event_accepted(&mut self, _event: &BidEvent) {}
    fn on_error(&mut self, _error: &SessionError) {}
    fn on_connected(&mut self) {}
    fn on_disconnected(&mut self) {}
    fn on_degraded(&mut self, _reason: &Degraded) {}
}

impl SessionObserver for () {}

type SnapshotFn = Box<dyn FnMut(SequenceNumber, Option<&Value>) + Send>;
type EventFn = Box<dyn FnMut(&BidEvent) + Send>;
type ErrorFn = Box<dyn FnMut(&SessionError) + Send>;
type SignalFn = Box<dyn FnMut() + Send>;
type DegradedFn = Box<dyn FnMut(&Degraded) + Send>;

/// Closure-set observer. Unset callbacks are no-ops.
#[derive(Default)]
pub struct ObserverFns {
    snapshot: Option<SnapshotFn>,
    event_accepted: Option<EventFn>,
    error: Option<ErrorFn>,
    connected: Option<SignalFn>,
    disconnected: Option<SignalFn>,
    degraded: Option<DegradedFn>,
}

impl ObserverFns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_snapshot(
        mut self,
        f: impl FnMut(SequenceNumber, Option<&Value>) + Send + 'static,
    ) -> Self {
        self.snapshot = Some(Box::new(f));
        self
    }

    pub fn on_event_accepted(mut self, f: impl FnMut(&BidEvent) + Send + 'static) -> Self {
        self.event_accepted = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&SessionError) + Send + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_connected(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.connected = Some(Box::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.disconnected = Some(Box::new(f));
        self
    }

    pub fn on_degraded(mut self, f: impl FnMut(&Degraded) + Send + 'static) -> Self {
        self.degraded = Some(Box::new(f));
        self
    }
}

impl SessionObserver for ObserverFns {
    fn on_snapshot(&mut self, sequence: SequenceNumber, data: Option<&Value>) {
        if let Some(f) = self.snapshot.as_mut() {
            f(sequence, data);
        }
    }

    fn on_event_accepted(&mut self, event: &BidEvent) {
        if let Some(f) = self.event_accepted.as_mut() {
            f(event);
        }
    }

    fn on_error(&mut self, error: &SessionError) {
        if let Some(f) = self.error.as_mut() {
            f(error);
        }
    }

    fn on_connected(&mut self) {
        if let Some(f) = self.connected.as_mut() {
            f();
        }
    }

    fn on_disconnected(&mut self) {
        if let Some(f) = self.disconnected.as_mut() {
            f();
        }
    }

    fn on_degraded(&mut self, reason: &Degraded) {
        if let Some(f) = self.degraded.as_mut() {
            f(reason);
        }
    }
}

/// An observer notification produced by the session core.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Snapshot {
        sequence: SequenceNumber,
        data: Option<Value>,
    },
    EventAccepted(BidEvent),
    Error(SessionError),
    Connected,
    Disconnected,
    Degraded(Degraded),
}

impl Notification {
    pub fn deliver(&self, observer: &mut dyn SessionObserver) {
        match self {
            Notification::Snapshot { sequence, data } => {
                observer.on_snapshot(*sequence, data.as_ref())
            }
            Notification::EventAccepted(event) => observer.on_event_accepted(event),
            Notification::Error(error) => observer.on_error(error),
            Notification::Connected => observer.on_connected(),
            Notification::Disconnected => observer.on_disconnected(),
            Notification::Degraded(reason) => observer.on_degraded(reason),
        }
    }
}
