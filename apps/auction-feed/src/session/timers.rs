use std::collections::HashMap;
use std::time::Duration;

use auction_feed_proto::SequenceNumber;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    GapTimeout(SequenceNumber),
    ReconnectDue(u64),
}

/// One-shot timers owned by the session task. Each timer is a sleeping task
/// that posts a [`TimerEvent`] back into the session loop; cancelling aborts
/// the task. Fired events are still checked against session state, so a
/// timer that loses the race with its cancellation is harmless.
pub struct Timers {
    tx: mpsc::UnboundedSender<TimerEvent>,
    gaps: HashMap<SequenceNumber, JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Timers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = Self {
            tx,
            gaps: HashMap::new(),
            reconnect: None,
        };
        (timers, rx)
    }

    pub fn arm_gap(&mut self, sequence: SequenceNumber, after: Duration) {
        let handle = self.spawn(TimerEvent::GapTimeout(sequence), after);
        if let Some(previous) = self.gaps.insert(sequence, handle) {
            previous.abort();
        }
    }

    pub fn cancel_gap(&mut self, sequence: SequenceNumber) {
        if let Some(handle) = self.gaps.remove(&sequence) {
            trace!(target = "auction_feed.timers", sequence, "gap timer cancelled");
            handle.abort();
        }
    }

    pub fn arm_reconnect(&mut self, token: u64, after: Duration) {
        self.cancel_reconnect();
        self.reconnect = Some(self.spawn(TimerEvent::ReconnectDue(token), after));
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
    }

    /// Forgets the handle of a timer whose event has been received.
    pub fn fired(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::GapTimeout(sequence) => {
                self.gaps.remove(&sequence);
            }
            TimerEvent::ReconnectDue(_) => {
                self.reconnect = None;
            }
        }
    }

    pub fn armed_gaps(&self) -> usize {
        self.gaps.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.gaps.drain() {
            handle.abort();
        }
        self.cancel_reconnect();
    }

    fn spawn(&self, event: TimerEvent, after: Duration) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        })
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
