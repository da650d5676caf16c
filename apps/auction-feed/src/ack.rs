//! Acknowledgement of accepted events.
//!
//! Acks are fire-and-forget. The server owns redelivery of anything left
//! unacknowledged; the client only guarantees one ack per accepted sequence,
//! in increasing order.

use auction_feed_proto::{ClientFrame, SequenceNumber};
use tracing::{trace, warn};

#[derive(Debug, Default)]
pub struct Acknowledger {
    last_acked: Option<SequenceNumber>,
    sent: u64,
}

impl Acknowledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces the ack frame for a newly accepted sequence. Returns `None`
    /// for a sequence that is not past the last ack.
    pub fn on_accepted(&mut self, sequence: SequenceNumber) -> Option<ClientFrame> {
        if let Some(last) = self.last_acked {
            if sequence <= last {
                warn!(
                    target = "auction_feed.ack",
                    sequence,
                    last_acked = last,
                    "refusing to ack a sequence out of order"
                );
                return None;
            }
        }
        self.last_acked = Some(sequence);
        self.sent += 1;
        trace!(target = "auction_feed.ack", sequence, "ack queued");
        Some(ClientFrame::Ack { sequence })
    }

    /// Raises the floor after the server re-declares the stream base. The
    /// floor never drops, so nothing already acknowledged is acked again.
    pub fn rebase(&mut self, last_accepted: SequenceNumber) {
        let floor = self.last_acked.map_or(last_accepted, |acked| acked.max(last_accepted));
        self.last_acked = Some(floor);
    }

    pub fn last_acked(&self) -> Option<SequenceNumber> {
        self.last_acked
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acks_each_sequence_once_in_order() {
        let mut acks = Acknowledger::new();
        assert_eq!(acks.on_accepted(1), Some(ClientFrame::Ack { sequence: 1 }));
        assert_eq!(acks.on_accepted(2), Some(ClientFrame::Ack { sequence: 2 }));
        assert_eq!(acks.on_accepted(2), None);
        assert_eq!(acks.on_accepted(1), None);
        assert_eq!(acks.sent(), 2);
    }

    #[test]
    fn rebase_moves_the_floor() {
        let mut acks = Acknowledger::new();
        acks.on_accepted(3);
        acks.rebase(10);
        assert_eq!(acks.on_accepted(10), None);
        assert_eq!(acks.on_accepted(11), Some(ClientFrame::Ack { sequence: 11 }));
    }

    #[test]
    fn rebase_never_lowers_the_floor() {
        let mut acks = Acknowledger::new();
        for sequence in 1..=5 {
            acks.on_accepted(sequence);
        }
        acks.rebase(2);
        assert_eq!(acks.last_acked(), Some(5));
        assert_eq!(acks.on_accepted(3), None);
        assert_eq!(acks.sent(), 5);
    }
}
