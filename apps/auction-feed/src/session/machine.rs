//! Deterministic core of a feed session.
//!
//! [`SessionMachine`] owns every piece of ordering and lifecycle state and
//! never performs I/O. Each input returns the [`Effect`]s the runner must
//! execute, in order: an ack always precedes the notification for the event
//! it acknowledges, and a close precedes the open that replaces it.

use std::time::Duration;

use auction_feed_proto::{
    decode_server_frame, is_normal_close, BidAmount, BidEvent, ClientFrame, SequenceNumber,
    ServerFrame, CLOSE_NORMAL,
};
use serde_json::Value;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::observer::{Degraded, Notification};
use super::state::{ConnectionId, ConnectionStatus, SessionStats};
use crate::ack::Acknowledger;
use crate::config::FeedConfig;
use crate::error::{ClientError, SessionError};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::resync::{probe_lagging, ResyncController, ResyncTrigger};
use crate::sequencer::{Admission, RebaseError, Sequencer};
use crate::transport::TransportEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open connection `id`. The runner first drops any previous connection.
    Open { id: ConnectionId, url: Url },
    Send(ClientFrame),
    Close { code: u16, reason: &'static str },
    ArmGapTimer { sequence: SequenceNumber, after: Duration },
    CancelGapTimer { sequence: SequenceNumber },
    ArmReconnectTimer { token: u64, after: Duration },
    CancelReconnectTimer,
    Notify(Notification),
}

pub struct SessionMachine {
    config: FeedConfig,
    status: ConnectionStatus,
    connection: ConnectionId,
    sequencer: Sequencer,
    acks: Acknowledger,
    resync: ResyncController,
    reconnect: ReconnectPolicy,
    reconnect_token: u64,
    pending_reconnect: Option<u64>,
    terminated: bool,
    accepted: u64,
    duplicates: u64,
    connections_opened: u64,
    malformed_frames: u64,
    effects: Vec<Effect>,
}

impl SessionMachine {
    pub fn new(config: FeedConfig) -> Self {
        let reconnect =
            ReconnectPolicy::new(config.max_reconnect_attempts, config.reconnect_base_delay);
        Self {
            config,
            status: ConnectionStatus::Closed,
            connection: ConnectionId(0),
            sequencer: Sequencer::new(),
            acks: Acknowledger::new(),
            resync: ResyncController::new(),
            reconnect,
            reconnect_token: 0,
            pending_reconnect: None,
            terminated: false,
            accepted: 0,
            duplicates: 0,
            connections_opened: 0,
            malformed_frames: 0,
            effects: Vec::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Connection whose events are currently honoured.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// True once [`close`](Self::close) has run. Nothing reopens the session.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn last_accepted(&self) -> SequenceNumber {
        self.sequencer.last_accepted()
    }

    pub fn expected(&self) -> SequenceNumber {
        self.sequencer.expected()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            expected_sequence: self.sequencer.expected(),
            last_accepted_sequence: self.sequencer.last_accepted(),
            buffered: self.sequencer.buffered_len(),
            accepted: self.accepted,
            duplicates: self.duplicates,
            last_acked_sequence: self.acks.last_acked(),
            acks_sent: self.acks.sent(),
            resync_requests: self.resync.requested(),
            resync_replies: self.resync.replies(),
            reconnect_attempts: self.reconnect.attempts(),
            connections_opened: self.connections_opened,
            malformed_frames: self.malformed_frames,
        }
    }

    /// Opens the first connection.
    pub fn start(&mut self) -> Vec<Effect> {
        if !self.terminated && self.status == ConnectionStatus::Closed {
            self.open_connection();
        }
        self.take_effects()
    }

    pub fn on_transport_event(&mut self, id: ConnectionId, event: TransportEvent) -> Vec<Effect> {
        if id != self.connection || self.status == ConnectionStatus::Closed {
            trace!(
                target = "auction_feed.session",
                %id,
                current = %self.connection,
                ?event,
                "ignoring event from stale connection"
            );
            return Vec::new();
        }
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Frame(text) => self.on_text(&text),
            TransportEvent::Error(message) => {
                warn!(target = "auction_feed.session", %id, %message, "transport error");
                self.notify(Notification::Error(SessionError::Transport(message)));
            }
            TransportEvent::Closed { code, reason } => self.on_closed(code, &reason),
        }
        self.take_effects()
    }

    pub fn on_gap_timeout(&mut self, sequence: SequenceNumber) -> Vec<Effect> {
        if self.terminated {
            return Vec::new();
        }
        if self.status != ConnectionStatus::Open {
            // Still waiting; the resumed connection is likely to fill it.
            // A closed session keeps no gap records, so nothing re-arms.
            let resuming = matches!(
                self.status,
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
            );
            if resuming && self.sequencer.has_pending_gap(sequence) {
                debug!(
                    target = "auction_feed.session",
                    sequence,
                    status = %self.status,
                    "gap timer deferred until reconnected"
                );
                self.effects.push(Effect::ArmGapTimer {
                    sequence,
                    after: self.config.gap_timeout,
                });
            }
            return self.take_effects();
        }
        if let Some(gap) = self.sequencer.gap_expired(sequence) {
            info!(
                target = "auction_feed.session",
                sequence,
                expected = self.sequencer.expected(),
                waited_ms = gap.waited().as_millis() as u64,
                "gap timed out"
            );
            self.request_resync(ResyncTrigger::GapTimeout { sequence });
        }
        self.take_effects()
    }

    pub fn on_reconnect_due(&mut self, token: u64) -> Vec<Effect> {
        if self.pending_reconnect != Some(token) || self.status != ConnectionStatus::Reconnecting {
            trace!(target = "auction_feed.session", token, "stale reconnect timer");
            return Vec::new();
        }
        self.pending_reconnect = None;
        self.open_connection();
        self.take_effects()
    }

    /// Validates a bid and produces its frame. Rejected bids produce nothing.
    pub fn submit_bid(&mut self, amount: i64) -> Result<Vec<Effect>, ClientError> {
        let amount = BidAmount::new(amount)?;
        self.submit_validated(amount)
    }

    /// Same as [`submit_bid`](Self::submit_bid) for raw user input.
    pub fn submit_bid_text(&mut self, input: &str) -> Result<Vec<Effect>, ClientError> {
        let amount = BidAmount::parse(input)?;
        self.submit_validated(amount)
    }

    fn submit_validated(&mut self, amount: BidAmount) -> Result<Vec<Effect>, ClientError> {
        if self.terminated {
            return Err(ClientError::SessionClosed);
        }
        if self.status != ConnectionStatus::Open {
            return Err(ClientError::NotConnected);
        }
        debug!(target = "auction_feed.session", amount = amount.get(), "submitting bid");
        Ok(vec![Effect::Send(ClientFrame::Bid { amount })])
    }

    /// Explicit catch-up request from the caller.
    pub fn request_manual_resync(&mut self) -> Vec<Effect> {
        if !self.terminated {
            self.request_resync(ResyncTrigger::Requested);
        }
        self.take_effects()
    }

    /// Drops the current connection and opens a new one immediately, with
    /// the backoff budget restored.
    pub fn reconnect(&mut self) -> Vec<Effect> {
        if self.terminated {
            return Vec::new();
        }
        info!(target = "auction_feed.session", status = %self.status, "manual reconnect");
        self.cancel_pending_reconnect();
        self.drop_connection("Reconnecting");
        self.reconnect.reset();
        self.open_connection();
        self.take_effects()
    }

    /// Closes the session for good. Safe to call more than once.
    pub fn close(&mut self) -> Vec<Effect> {
        if self.terminated {
            return Vec::new();
        }
        info!(target = "auction_feed.session", status = %self.status, "closing session");
        self.terminated = true;
        self.cancel_pending_reconnect();
        for sequence in self.sequencer.settle_all_gaps() {
            self.effects.push(Effect::CancelGapTimer { sequence });
        }
        self.drop_connection("Client closed");
        self.status = ConnectionStatus::Closed;
        self.take_effects()
    }

    fn open_connection(&mut self) {
        self.connection = self.connection.next();
        self.status = ConnectionStatus::Connecting;
        let url = self.config.stream_url(self.sequencer.last_accepted());
        info!(
            target = "auction_feed.session",
            id = %self.connection,
            %url,
            "opening connection"
        );
        self.effects.push(Effect::Open {
            id: self.connection,
            url,
        });
    }

    /// Client-side close of whatever connection exists. Bumps the connection
    /// id so late events from it are ignored.
    fn drop_connection(&mut self, reason: &'static str) {
        if !self.status.has_connection() {
            return;
        }
        let was_open = self.status == ConnectionStatus::Open;
        self.effects.push(Effect::Close {
            code: CLOSE_NORMAL,
            reason,
        });
        self.connection = self.connection.next();
        self.status = ConnectionStatus::Closed;
        if was_open {
            self.notify(Notification::Disconnected);
        }
    }

    fn cancel_pending_reconnect(&mut self) {
        if self.pending_reconnect.take().is_some() {
            self.effects.push(Effect::CancelReconnectTimer);
        }
    }

    fn on_opened(&mut self) {
        if self.status != ConnectionStatus::Connecting {
            return;
        }
        info!(target = "auction_feed.session", id = %self.connection, "connected");
        self.status = ConnectionStatus::Open;
        self.connections_opened += 1;
        self.reconnect.reset();
        self.resync.reset();
        self.notify(Notification::Connected);
        for gap in self.sequencer.track_buffered_gaps() {
            self.effects.push(Effect::ArmGapTimer {
                sequence: gap.sequence,
                after: self.config.gap_timeout,
            });
        }
    }

    fn on_closed(&mut self, code: u16, reason: &str) {
        let was_open = self.status == ConnectionStatus::Open;
        if was_open {
            self.notify(Notification::Disconnected);
        }
        if is_normal_close(code) {
            info!(target = "auction_feed.session", code, %reason, "connection closed normally");
            self.status = ConnectionStatus::Closed;
            self.park_gaps();
            return;
        }

        warn!(target = "auction_feed.session", code, %reason, "connection lost");
        self.status = ConnectionStatus::Reconnecting;
        match self.reconnect.on_abnormal_close() {
            ReconnectDecision::Retry { delay, .. } => {
                self.reconnect_token += 1;
                self.pending_reconnect = Some(self.reconnect_token);
                self.effects.push(Effect::ArmReconnectTimer {
                    token: self.reconnect_token,
                    after: delay,
                });
            }
            ReconnectDecision::Exhausted { attempts } => {
                self.status = ConnectionStatus::Closed;
                self.park_gaps();
                self.notify(Notification::Error(SessionError::ReconnectExhausted {
                    attempts,
                }));
            }
        }
    }

    /// Drops gap records and their timers while no connection is coming.
    /// Buffered events stay; the next open tracks them again.
    fn park_gaps(&mut self) {
        for sequence in self.sequencer.settle_all_gaps() {
            self.effects.push(Effect::CancelGapTimer { sequence });
        }
    }

    fn on_text(&mut self, text: &str) {
        if self.status != ConnectionStatus::Open {
            debug!(target = "auction_feed.session", "frame before open ignored");
            return;
        }
        match decode_server_frame(text) {
            Ok(frame) => self.on_frame(frame),
            Err(err) if err.is_unknown_kind() => {
                debug!(target = "auction_feed.session", error = %err, "ignoring unknown frame kind");
            }
            Err(err) => {
                self.malformed_frames += 1;
                warn!(target = "auction_feed.session", error = %err, "dropping malformed frame");
            }
        }
    }

    fn on_frame(&mut self, frame: ServerFrame) {
        trace!(target = "auction_feed.session", kind = frame.kind(), "frame");
        match frame {
            ServerFrame::InitialState { sequence, data } => self.on_snapshot(sequence, data),
            ServerFrame::ReconnectSync {
                missed_count,
                truncated,
                messages,
            } => self.on_resync_reply(missed_count, truncated, messages),
            ServerFrame::BidUpdate(event) => self.on_bid(event),
            ServerFrame::Ping { sequence } => {
                self.effects
                    .push(Effect::Send(ClientFrame::Pong { sequence }));
                let last = self.sequencer.last_accepted();
                if probe_lagging(sequence, last, self.config.probe_lag_threshold) {
                    self.request_resync(ResyncTrigger::ProbeLag { server: sequence });
                }
            }
            ServerFrame::Error { message } => {
                warn!(target = "auction_feed.session", %message, "server error");
                self.notify(Notification::Error(SessionError::Server(message)));
            }
            ServerFrame::HealthWarning { message } => {
                warn!(target = "auction_feed.session", %message, "server health warning");
                self.notify(Notification::Degraded(Degraded::HealthWarning(message)));
            }
        }
    }

    fn on_snapshot(&mut self, sequence: SequenceNumber, data: Option<Value>) {
        info!(target = "auction_feed.session", sequence, "snapshot received");
        match self.sequencer.rebase(sequence) {
            Ok(drained) => {
                self.acks.rebase(sequence);
                self.notify(Notification::Snapshot { sequence, data });
                self.deliver(drained);
            }
            Err(RebaseError::Behind { last_accepted, .. }) => {
                warn!(
                    target = "auction_feed.session",
                    sequence,
                    last_accepted,
                    "ignoring snapshot behind the stream"
                );
                self.notify(Notification::Degraded(Degraded::StaleSnapshot {
                    sequence,
                    last_accepted,
                }));
            }
            Err(err @ RebaseError::OutOfRange(_)) => {
                self.malformed_frames += 1;
                warn!(target = "auction_feed.session", error = %err, "dropping snapshot");
            }
        }
    }

    fn on_resync_reply(&mut self, missed_count: u64, truncated: bool, messages: Vec<BidEvent>) {
        let outcome = self
            .resync
            .apply_reply(&mut self.sequencer, missed_count, truncated, messages);
        self.duplicates += outcome.duplicates as u64;
        self.malformed_frames += outcome.rejected as u64;
        if let Some(reason) = outcome.degraded {
            self.notify(Notification::Degraded(reason));
        }
        for gap in outcome.gaps {
            self.effects.push(Effect::ArmGapTimer {
                sequence: gap.sequence,
                after: self.config.gap_timeout,
            });
        }
        self.deliver(outcome.accepted);
    }

    fn on_bid(&mut self, event: BidEvent) {
        match self.sequencer.admit(event) {
            Admission::Duplicate => self.duplicates += 1,
            Admission::OutOfRange => self.malformed_frames += 1,
            Admission::Buffered { gap: Some(gap) } => {
                self.effects.push(Effect::ArmGapTimer {
                    sequence: gap.sequence,
                    after: self.config.gap_timeout,
                });
            }
            Admission::Buffered { gap: None } => {}
            accepted => self.deliver(accepted.into_accepted()),
        }
    }

    /// Acks and announces accepted events, then settles the gaps they closed.
    fn deliver(&mut self, events: Vec<BidEvent>) {
        for event in events {
            if let Some(ack) = self.acks.on_accepted(event.sequence) {
                self.effects.push(Effect::Send(ack));
            }
            self.accepted += 1;
            self.notify(Notification::EventAccepted(event));
        }
        for sequence in self.sequencer.settle_gaps() {
            self.effects.push(Effect::CancelGapTimer { sequence });
        }
        self.resync.on_progress(self.sequencer.last_accepted());
    }

    fn request_resync(&mut self, trigger: ResyncTrigger) {
        if self.status != ConnectionStatus::Open {
            warn!(
                target = "auction_feed.session",
                ?trigger,
                status = %self.status,
                "resync skipped while not connected"
            );
            return;
        }
        if let Some(frame) = self.resync.request(self.sequencer.last_accepted(), trigger) {
            self.effects.push(Effect::Send(frame));
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.effects.push(Effect::Notify(notification));
    }

    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}
