//! Admission of stream events into a gap-free, strictly increasing order.
//!
//! The [`Sequencer`] owns the next expected sequence number, the reorder
//! buffer of events that arrived ahead of their turn, and one [`PendingGap`]
//! record per buffered event. It never touches the network; callers act on
//! the returned [`Admission`] (acknowledge, deliver, arm a gap timer).

use std::collections::BTreeMap;
use std::time::Duration;

use auction_feed_proto::{BidEvent, SequenceNumber};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Largest sequence that can be accepted. `SequenceNumber::MAX` itself would
/// leave no successor for the expected position.
pub const MAX_ACCEPTED_SEQUENCE: SequenceNumber = SequenceNumber::MAX - 1;

/// An out-of-order event waiting for its predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingGap {
    pub sequence: SequenceNumber,
    pub first_seen_at: Instant,
}

impl PendingGap {
    pub fn waited(&self) -> Duration {
        self.first_seen_at.elapsed()
    }
}

/// Outcome of [`Sequencer::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The event was next in line and nothing buffered followed it.
    Accepted(BidEvent),
    /// The event was next in line and unblocked buffered successors.
    /// Ascending by sequence, starting with the admitted event.
    AcceptedBatch(Vec<BidEvent>),
    /// Already accepted or already buffered; dropped without side effects.
    Duplicate,
    /// Held in the reorder buffer. `gap` is set when a new gap record was
    /// created and a timer should be armed for it.
    Buffered { gap: Option<PendingGap> },
    /// Sequence beyond [`MAX_ACCEPTED_SEQUENCE`]; dropped without side effects.
    OutOfRange,
}

/// Why [`Sequencer::rebase`] left the stream position unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RebaseError {
    #[error("base {requested} is behind last accepted sequence {last_accepted}")]
    Behind {
        requested: SequenceNumber,
        last_accepted: SequenceNumber,
    },
    #[error("base {0} leaves no room for a following sequence")]
    OutOfRange(SequenceNumber),
}

impl Admission {
    pub fn accepted(&self) -> &[BidEvent] {
        match self {
            Admission::Accepted(event) => std::slice::from_ref(event),
            Admission::AcceptedBatch(events) => events,
            Admission::Duplicate | Admission::Buffered { .. } | Admission::OutOfRange => &[],
        }
    }

    pub fn into_accepted(self) -> Vec<BidEvent> {
        match self {
            Admission::Accepted(event) => vec![event],
            Admission::AcceptedBatch(events) => events,
            Admission::Duplicate | Admission::Buffered { .. } | Admission::OutOfRange => {
                Vec::new()
            }
        }
    }
}

#[derive(Debug)]
pub struct Sequencer {
    expected: SequenceNumber,
    last_accepted: SequenceNumber,
    buffer: BTreeMap<SequenceNumber, BidEvent>,
    gaps: BTreeMap<SequenceNumber, PendingGap>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    /// A sequencer for a fresh stream whose first event is sequence 1.
    pub fn new() -> Self {
        Self::after(0)
    }

    /// A sequencer that has already accepted everything up to `last_accepted`,
    /// clamped to [`MAX_ACCEPTED_SEQUENCE`].
    pub fn after(last_accepted: SequenceNumber) -> Self {
        let last_accepted = last_accepted.min(MAX_ACCEPTED_SEQUENCE);
        Self {
            expected: last_accepted + 1,
            last_accepted,
            buffer: BTreeMap::new(),
            gaps: BTreeMap::new(),
        }
    }

    pub fn expected(&self) -> SequenceNumber {
        self.expected
    }

    pub fn last_accepted(&self) -> SequenceNumber {
        self.last_accepted
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_sequences(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        self.buffer.keys().copied()
    }

    pub fn has_pending_gap(&self, sequence: SequenceNumber) -> bool {
        self.gaps.contains_key(&sequence)
    }

    pub fn admit(&mut self, event: BidEvent) -> Admission {
        let sequence = event.sequence;
        if sequence > MAX_ACCEPTED_SEQUENCE {
            warn!(
                target = "auction_feed.sequencer",
                sequence,
                "event sequence out of range; dropped"
            );
            return Admission::OutOfRange;
        }
        if sequence < self.expected {
            trace!(
                target = "auction_feed.sequencer",
                sequence,
                expected = self.expected,
                "duplicate event"
            );
            return Admission::Duplicate;
        }

        if sequence > self.expected {
            if self.buffer.contains_key(&sequence) {
                trace!(
                    target = "auction_feed.sequencer",
                    sequence,
                    "event already buffered"
                );
                return Admission::Duplicate;
            }
            debug!(
                target = "auction_feed.sequencer",
                sequence,
                expected = self.expected,
                buffered = self.buffer.len() + 1,
                "out of order event buffered"
            );
            self.buffer.insert(sequence, event);
            let gap = if self.gaps.contains_key(&sequence) {
                None
            } else {
                let gap = PendingGap {
                    sequence,
                    first_seen_at: Instant::now(),
                };
                self.gaps.insert(sequence, gap);
                Some(gap)
            };
            return Admission::Buffered { gap };
        }

        self.accept(&event);
        let drained = self.drain();
        if drained.is_empty() {
            Admission::Accepted(event)
        } else {
            let mut batch = Vec::with_capacity(drained.len() + 1);
            batch.push(event);
            batch.extend(drained);
            Admission::AcceptedBatch(batch)
        }
    }

    /// Moves the stream base forward to `last_accepted`, as declared by a
    /// server snapshot. Buffered events at or below the base are discarded;
    /// any buffered run that becomes contiguous is returned in order.
    ///
    /// The base never moves backwards: a base behind the last accepted
    /// sequence is refused and nothing changes.
    pub fn rebase(
        &mut self,
        last_accepted: SequenceNumber,
    ) -> Result<Vec<BidEvent>, RebaseError> {
        if last_accepted < self.last_accepted {
            return Err(RebaseError::Behind {
                requested: last_accepted,
                last_accepted: self.last_accepted,
            });
        }
        let expected = last_accepted
            .checked_add(1)
            .ok_or(RebaseError::OutOfRange(last_accepted))?;
        self.last_accepted = last_accepted;
        self.expected = expected;
        let stale: Vec<_> = self.buffer.range(..=last_accepted).map(|(s, _)| *s).collect();
        for sequence in &stale {
            self.buffer.remove(sequence);
        }
        if !stale.is_empty() {
            debug!(
                target = "auction_feed.sequencer",
                discarded = stale.len(),
                base = last_accepted,
                "discarded buffered events covered by new base"
            );
        }
        Ok(self.drain())
    }

    /// Removes and returns gap records that are no longer open because the
    /// expected sequence has moved past them.
    pub fn settle_gaps(&mut self) -> Vec<SequenceNumber> {
        let resolved: Vec<_> = self
            .gaps
            .range(..self.expected)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in &resolved {
            self.gaps.remove(sequence);
        }
        resolved
    }

    /// Drops every gap record, returning their sequences so the timers can
    /// be cancelled. Buffered events are kept.
    pub fn settle_all_gaps(&mut self) -> Vec<SequenceNumber> {
        let all: Vec<_> = self.gaps.keys().copied().collect();
        self.gaps.clear();
        all
    }

    /// Opens a gap record for every buffered event that lacks one, returning
    /// the new records so timers can be armed for them.
    pub fn track_buffered_gaps(&mut self) -> Vec<PendingGap> {
        let now = Instant::now();
        let mut opened = Vec::new();
        for &sequence in self.buffer.keys() {
            if self.gaps.contains_key(&sequence) {
                continue;
            }
            let gap = PendingGap {
                sequence,
                first_seen_at: now,
            };
            self.gaps.insert(sequence, gap);
            opened.push(gap);
        }
        opened
    }

    /// Called when the gap timer for `sequence` fires. Returns the gap when
    /// it is still open, meaning a resync is warranted. A timer that fires
    /// after its gap was settled is a no-op.
    pub fn gap_expired(&mut self, sequence: SequenceNumber) -> Option<PendingGap> {
        let gap = self.gaps.remove(&sequence)?;
        if sequence < self.expected {
            return None;
        }
        Some(gap)
    }

    // Only reached for sequences that passed the range check in `admit`.
    fn accept(&mut self, event: &BidEvent) {
        debug_assert_eq!(event.sequence, self.expected);
        self.last_accepted = event.sequence;
        self.expected = event.sequence.saturating_add(1);
    }

    fn drain(&mut self) -> Vec<BidEvent> {
        let mut drained = Vec::new();
        while let Some(entry) = self.buffer.first_entry() {
            if *entry.key() != self.expected {
                break;
            }
            let event = entry.remove();
            self.accept(&event);
            drained.push(event);
        }
        drained
    }
}

#[cfg(test)]
pub(crate) fn bid(sequence: SequenceNumber) -> BidEvent {
    use auction_feed_proto::ServerTimestamp;
    BidEvent {
        sequence,
        amount: 1_000 + sequence as i64,
        username: format!("bidder-{sequence}"),
        bid_count: sequence,
        timestamp: ServerTimestamp::Millis(1_700_000_000_000 + sequence as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(admission: &Admission) -> Vec<SequenceNumber> {
        admission.accepted().iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn drains_buffer_when_gap_closes() {
        let mut sequencer = Sequencer::after(4);
        assert_eq!(sequencer.expected(), 5);

        let batches: Vec<_> = [7, 6, 5, 8]
            .into_iter()
            .map(|s| seqs(&sequencer.admit(bid(s))))
            .collect();

        assert_eq!(
            batches,
            vec![vec![], vec![], vec![5, 6, 7], vec![8]]
        );
        assert_eq!(sequencer.expected(), 9);
        assert_eq!(sequencer.last_accepted(), 8);
        assert_eq!(sequencer.buffered_len(), 0);
    }

    #[test]
    fn in_order_event_with_empty_buffer_is_single_accept() {
        let mut sequencer = Sequencer::new();
        match sequencer.admit(bid(1)) {
            Admission::Accepted(event) => assert_eq!(event.sequence, 1),
            other => panic!("unexpected admission {other:?}"),
        }
        assert_eq!(sequencer.expected(), 2);
    }

    #[test]
    fn replays_are_dropped_without_mutation() {
        let mut sequencer = Sequencer::new();
        sequencer.admit(bid(1));
        sequencer.admit(bid(2));
        sequencer.admit(bid(5));

        assert_eq!(sequencer.admit(bid(1)), Admission::Duplicate);
        assert_eq!(sequencer.admit(bid(2)), Admission::Duplicate);
        assert_eq!(sequencer.admit(bid(5)), Admission::Duplicate);
        assert_eq!(sequencer.expected(), 3);
        assert_eq!(sequencer.buffered_len(), 1);
    }

    #[test]
    fn arms_one_gap_per_buffered_event() {
        let mut sequencer = Sequencer::new();
        let first = sequencer.admit(bid(3));
        assert!(matches!(first, Admission::Buffered { gap: Some(g) } if g.sequence == 3));
        assert!(sequencer.has_pending_gap(3));

        let second = sequencer.admit(bid(4));
        assert!(matches!(second, Admission::Buffered { gap: Some(g) } if g.sequence == 4));

        sequencer.admit(bid(1));
        sequencer.admit(bid(2));
        let mut resolved = sequencer.settle_gaps();
        resolved.sort_unstable();
        assert_eq!(resolved, vec![3, 4]);
        assert_eq!(sequencer.gap_expired(3), None);
    }

    #[test]
    fn expired_gap_reports_once() {
        let mut sequencer = Sequencer::new();
        sequencer.admit(bid(2));
        assert!(sequencer.gap_expired(2).is_some());
        assert!(sequencer.gap_expired(2).is_none());
        // The buffered event itself survives the timer.
        assert_eq!(sequencer.buffered_len(), 1);
        assert_eq!(seqs(&sequencer.admit(bid(1))), vec![1, 2]);
    }

    #[test]
    fn rebase_discards_covered_events_and_drains() {
        let mut sequencer = Sequencer::new();
        for s in [3, 4, 6, 7] {
            sequencer.admit(bid(s));
        }
        let drained = sequencer.rebase(5).unwrap();
        let order: Vec<_> = drained.iter().map(|e| e.sequence).collect();
        assert_eq!(order, vec![6, 7]);
        assert_eq!(sequencer.expected(), 8);
        assert_eq!(sequencer.buffered_len(), 0);
        let mut settled = sequencer.settle_gaps();
        settled.sort_unstable();
        assert_eq!(settled, vec![3, 4, 6, 7]);
    }

    #[test]
    fn rebase_never_moves_backwards() {
        let mut sequencer = Sequencer::new();
        for s in 1..=5 {
            sequencer.admit(bid(s));
        }
        sequencer.admit(bid(7));

        assert_eq!(
            sequencer.rebase(2),
            Err(RebaseError::Behind {
                requested: 2,
                last_accepted: 5
            })
        );
        assert_eq!(sequencer.expected(), 6);
        assert_eq!(sequencer.buffered_len(), 1);
        for s in 3..=5 {
            assert_eq!(sequencer.admit(bid(s)), Admission::Duplicate);
        }
        assert_eq!(sequencer.rebase(5).unwrap(), Vec::new());
    }

    #[test]
    fn top_of_range_sequences_are_refused() {
        let mut sequencer = Sequencer::after(SequenceNumber::MAX);
        assert_eq!(sequencer.last_accepted(), MAX_ACCEPTED_SEQUENCE);
        assert_eq!(sequencer.expected(), SequenceNumber::MAX);
        assert_eq!(sequencer.admit(bid(SequenceNumber::MAX)), Admission::OutOfRange);
        assert_eq!(sequencer.expected(), SequenceNumber::MAX);

        let mut sequencer = Sequencer::after(MAX_ACCEPTED_SEQUENCE - 1);
        assert_eq!(sequencer.admit(bid(SequenceNumber::MAX)), Admission::OutOfRange);
        assert_eq!(sequencer.buffered_len(), 0);
        assert_eq!(
            seqs(&sequencer.admit(bid(MAX_ACCEPTED_SEQUENCE))),
            vec![MAX_ACCEPTED_SEQUENCE]
        );
        assert_eq!(
            sequencer.rebase(SequenceNumber::MAX),
            Err(RebaseError::OutOfRange(SequenceNumber::MAX))
        );
        assert_eq!(sequencer.last_accepted(), MAX_ACCEPTED_SEQUENCE);
    }

    #[test]
    fn buffered_events_regain_gap_records() {
        let mut sequencer = Sequencer::new();
        sequencer.admit(bid(3));
        sequencer.admit(bid(4));
        assert_eq!(sequencer.settle_all_gaps(), vec![3, 4]);
        assert!(!sequencer.has_pending_gap(3));

        let reopened: Vec<_> = sequencer
            .track_buffered_gaps()
            .iter()
            .map(|gap| gap.sequence)
            .collect();
        assert_eq!(reopened, vec![3, 4]);
        assert!(sequencer.track_buffered_gaps().is_empty());
        assert!(sequencer.has_pending_gap(4));
    }
}
