//! Explicit catch-up protocol.
//!
//! A resync asks the server to replay everything after the last accepted
//! sequence. Replies are merged through [`Sequencer::admit`] like any other
//! delivery, so overlapping replies cannot double-apply an event.

use auction_feed_proto::{BidEvent, ClientFrame, SequenceNumber};
use tracing::{debug, info, warn};

use crate::sequencer::{Admission, PendingGap, Sequencer};
use crate::session::Degraded;

/// Why a resync was requested. Carried into logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncTrigger {
    GapTimeout { sequence: SequenceNumber },
    ProbeLag { server: SequenceNumber },
    Requested,
}

/// Result of merging a `reconnect_sync` reply.
#[derive(Debug, Default)]
pub struct ResyncOutcome {
    /// Newly accepted events, ascending.
    pub accepted: Vec<BidEvent>,
    /// Gap records created by reply messages that are still ahead of the stream.
    pub gaps: Vec<PendingGap>,
    pub duplicates: usize,
    /// Messages dropped for carrying an out-of-range sequence.
    pub rejected: usize,
    pub degraded: Option<Degraded>,
}

#[derive(Debug, Default)]
pub struct ResyncController {
    in_flight: Option<SequenceNumber>,
    requested: u64,
    replies: u64,
}

impl ResyncController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a `sync_request` from `from_sequence`, or `None` when an
    /// identical request is still unanswered.
    pub fn request(
        &mut self,
        from_sequence: SequenceNumber,
        trigger: ResyncTrigger,
    ) -> Option<ClientFrame> {
        if self.in_flight == Some(from_sequence) {
            debug!(
                target = "auction_feed.resync",
                from_sequence,
                ?trigger,
                "resync already in flight"
            );
            return None;
        }
        info!(
            target = "auction_feed.resync",
            from_sequence,
            ?trigger,
            "requesting resync"
        );
        self.in_flight = Some(from_sequence);
        self.requested += 1;
        Some(ClientFrame::SyncRequest { from_sequence })
    }

    /// Feeds a catch-up reply through the sequencer in server order.
    ///
    /// A truncated reply whose oldest message is past the expected sequence
    /// can never be backfilled, so the base is moved to just before that
    /// message first.
    pub fn apply_reply(
        &mut self,
        sequencer: &mut Sequencer,
        missed_count: u64,
        truncated: bool,
        messages: Vec<BidEvent>,
    ) -> ResyncOutcome {
        self.in_flight = None;
        self.replies += 1;

        let mut outcome = ResyncOutcome::default();
        if truncated {
            warn!(
                target = "auction_feed.resync",
                missed_count,
                supplied = messages.len(),
                "resync history truncated; some events were lost"
            );
            outcome.degraded = Some(Degraded::TruncatedResync {
                missed_count,
                supplied: messages.len(),
            });
        } else {
            debug!(
                target = "auction_feed.resync",
                missed_count,
                supplied = messages.len(),
                "applying resync reply"
            );
        }

        let oldest = messages
            .iter()
            .map(|message| message.sequence)
            .min()
            .filter(|oldest| truncated && *oldest > sequencer.expected());
        if let Some(oldest) = oldest {
            let base = oldest - 1;
            let from = sequencer.last_accepted();
            match sequencer.rebase(base) {
                Ok(drained) => {
                    warn!(
                        target = "auction_feed.resync",
                        from,
                        base,
                        "skipping events missing from truncated resync"
                    );
                    outcome.accepted.extend(drained);
                }
                Err(err) => {
                    warn!(
                        target = "auction_feed.resync",
                        error = %err,
                        "cannot skip truncated history"
                    );
                }
            }
        }

        for message in messages {
            match sequencer.admit(message) {
                Admission::Duplicate => outcome.duplicates += 1,
                Admission::OutOfRange => outcome.rejected += 1,
                Admission::Buffered { gap } => outcome.gaps.extend(gap),
                accepted => outcome.accepted.extend(accepted.into_accepted()),
            }
        }
        outcome
    }

    /// Clears the in-flight marker once the stream has moved past it, so a
    /// later gap can ask again from the new position.
    pub fn on_progress(&mut self, last_accepted: SequenceNumber) {
        if matches!(self.in_flight, Some(from) if from != last_accepted) {
            self.in_flight = None;
        }
    }

    /// A fresh connection invalidates any unanswered request.
    pub fn reset(&mut self) {
        self.in_flight = None;
    }

    pub fn in_flight(&self) -> Option<SequenceNumber> {
        self.in_flight
    }

    pub fn requested(&self) -> u64 {
        self.requested
    }

    pub fn replies(&self) -> u64 {
        self.replies
    }
}

/// True when a liveness probe shows the server further ahead than
/// `threshold` events.
pub fn probe_lagging(
    server_sequence: SequenceNumber,
    last_accepted: SequenceNumber,
    threshold: u64,
) -> bool {
    server_sequence > last_accepted.saturating_add(threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::bid;

    #[test]
    fn truncated_reply_backfills_and_reports_once() {
        let mut sequencer = Sequencer::after(8);
        let mut resync = ResyncController::new();
        resync.request(8, ResyncTrigger::Requested);

        let outcome = resync.apply_reply(&mut sequencer, 5, true, vec![bid(9), bid(10)]);

        let order: Vec<_> = outcome.accepted.iter().map(|e| e.sequence).collect();
        assert_eq!(order, vec![9, 10]);
        assert_eq!(sequencer.expected(), 11);
        assert_eq!(
            outcome.degraded,
            Some(Degraded::TruncatedResync {
                missed_count: 5,
                supplied: 2
            })
        );
        assert_eq!(resync.in_flight(), None);
    }

    #[test]
    fn truncated_reply_past_the_stream_skips_ahead() {
        let mut sequencer = Sequencer::new();
        let mut resync = ResyncController::new();
        sequencer.admit(bid(103));
        resync.request(0, ResyncTrigger::GapTimeout { sequence: 103 });

        let messages = (101..=105).map(bid).collect();
        let outcome = resync.apply_reply(&mut sequencer, 105, true, messages);

        let order: Vec<_> = outcome.accepted.iter().map(|e| e.sequence).collect();
        assert_eq!(order, vec![101, 102, 103, 104, 105]);
        // 103 was already buffered and left the buffer with 102.
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(sequencer.expected(), 106);
        assert_eq!(sequencer.buffered_len(), 0);

        // A complete reply never skips, even when it starts ahead.
        let mut sequencer = Sequencer::new();
        let outcome = resync.apply_reply(&mut sequencer, 2, false, vec![bid(3), bid(4)]);
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.gaps.len(), 2);
        assert_eq!(sequencer.expected(), 1);
    }

    #[test]
    fn overlapping_replies_do_not_double_apply() {
        let mut sequencer = Sequencer::new();
        let mut resync = ResyncController::new();

        let first = resync.apply_reply(&mut sequencer, 2, false, vec![bid(1), bid(2)]);
        let second = resync.apply_reply(&mut sequencer, 3, false, vec![bid(2), bid(3), bid(5)]);

        assert_eq!(first.accepted.len(), 2);
        let order: Vec<_> = second.accepted.iter().map(|e| e.sequence).collect();
        assert_eq!(order, vec![3]);
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.gaps.len(), 1);
        assert!(second.degraded.is_none());
    }

    #[test]
    fn suppresses_identical_requests_until_progress() {
        let mut resync = ResyncController::new();
        assert!(resync
            .request(4, ResyncTrigger::GapTimeout { sequence: 6 })
            .is_some());
        assert!(resync
            .request(4, ResyncTrigger::GapTimeout { sequence: 7 })
            .is_none());
        resync.on_progress(4);
        assert!(resync.request(4, ResyncTrigger::Requested).is_none());
        resync.on_progress(5);
        assert_eq!(
            resync.request(5, ResyncTrigger::Requested),
            Some(ClientFrame::SyncRequest { from_sequence: 5 })
        );
        assert_eq!(resync.requested(), 2);
    }

    #[test]
    fn probe_lag_threshold_is_exclusive() {
        assert!(!probe_lagging(20, 10, 10));
        assert!(probe_lagging(21, 10, 10));
    }
}
