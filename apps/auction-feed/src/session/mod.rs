//! Feed session: the ordering core plus the task that drives it.
//!
//! [`spawn`] starts one task per auction stream. The task owns the
//! [`SessionMachine`], the live connection and all timers; callers talk to it
//! through a cloneable [`SessionHandle`]. Transport events, timer expiries
//! and caller commands are serialized through a single loop, so the core
//! never sees concurrent mutation.

pub mod machine;
pub mod observer;
pub mod state;
pub mod timers;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::ClientError;
use crate::transport::{Connection, EventReceiver, EventSender, Transport, TransportEvent};

pub use machine::{Effect, SessionMachine};
pub use observer::{Degraded, Notification, ObserverFns, SessionObserver};
pub use state::{ConnectionId, ConnectionStatus, SessionStats};
use timers::{TimerEvent, Timers};

enum Command {
    SubmitBid {
        amount: BidInput,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    RequestResync,
    Reconnect,
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum BidInput {
    Amount(i64),
    Text(String),
}

/// Caller side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

/// Starts a session task and opens the first connection.
///
/// The task runs until [`SessionHandle::close`] is called or every handle is
/// dropped. Must be called from within a tokio runtime.
pub fn spawn<T, O>(config: FeedConfig, transport: T, observer: O) -> (SessionHandle, JoinHandle<()>)
where
    T: Transport,
    O: SessionObserver,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Closed);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (timers, timer_rx) = Timers::new();

    info!(
        target = "auction_feed.session",
        auction_id = %config.auction_id,
        endpoint = %config.endpoint,
        "starting session"
    );
    let task = SessionTask {
        machine: SessionMachine::new(config),
        transport: Box::new(transport),
        observer: Box::new(observer),
        connection: None,
        timers,
        events_tx,
        status: status_tx,
    };
    let join = tokio::spawn(task.run(commands_rx, events_rx, timer_rx));
    let handle = SessionHandle {
        commands: commands_tx,
        status: status_rx,
    };
    (handle, join)
}

impl SessionHandle {
    /// Validates and sends a bid. Invalid amounts never reach the network.
    pub async fn submit_bid(&self, amount: i64) -> Result<(), ClientError> {
        self.submit(BidInput::Amount(amount)).await
    }

    /// Same as [`submit_bid`](Self::submit_bid) for unparsed user input.
    pub async fn submit_bid_text(&self, input: impl Into<String>) -> Result<(), ClientError> {
        self.submit(BidInput::Text(input.into())).await
    }

    async fn submit(&self, amount: BidInput) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SubmitBid { amount, reply })?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// Asks the server to replay everything after the last accepted event.
    pub fn request_resync(&self) -> Result<(), ClientError> {
        self.send(Command::RequestResync)
    }

    /// Replaces the current connection and restores the reconnect budget.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.send(Command::Reconnect)
    }

    pub async fn stats(&self) -> Result<SessionStats, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| ClientError::SessionClosed)
    }

    /// Closes the session and waits for the task to release its connection.
    /// Closing an already closed session is a no-op.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Waits until the session reports `wanted`.
    pub async fn wait_for_status(&self, wanted: ConnectionStatus) -> Result<(), ClientError> {
        let mut status = self.status.clone();
        status
            .wait_for(|current| *current == wanted)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::SessionClosed)
    }
}

enum Flow {
    Continue,
    Stop,
}

struct SessionTask {
    machine: SessionMachine,
    transport: Box<dyn Transport>,
    observer: Box<dyn SessionObserver>,
    connection: Option<(ConnectionId, Box<dyn Connection>)>,
    timers: Timers,
    events_tx: EventSender,
    status: watch::Sender<ConnectionStatus>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: EventReceiver,
        mut timer_events: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        let effects = self.machine.start();
        self.apply(effects);
        self.publish_status();

        loop {
            // Transport events first: anything the server sent before a
            // command was issued is processed before that command.
            let flow = tokio::select! {
                biased;
                Some((id, event)) = events.recv() => {
                    self.on_transport_event(id, event);
                    Flow::Continue
                }
                Some(fired) = timer_events.recv() => {
                    self.on_timer(fired);
                    Flow::Continue
                }
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!(target = "auction_feed.session", "all handles dropped");
                        let effects = self.machine.close();
                        self.apply(effects);
                        Flow::Stop
                    }
                },
            };
            self.publish_status();
            if matches!(flow, Flow::Stop) {
                break;
            }
        }

        self.timers.cancel_all();
        info!(target = "auction_feed.session", "session task exiting");
    }

    fn on_transport_event(&mut self, id: ConnectionId, event: TransportEvent) {
        let terminal = matches!(event, TransportEvent::Closed { .. });
        let effects = self.machine.on_transport_event(id, event);
        if terminal && matches!(self.connection, Some((current, _)) if current == id) {
            self.connection = None;
        }
        self.apply(effects);
    }

    fn on_timer(&mut self, fired: TimerEvent) {
        self.timers.fired(fired);
        let effects = match fired {
            TimerEvent::GapTimeout(sequence) => self.machine.on_gap_timeout(sequence),
            TimerEvent::ReconnectDue(token) => self.machine.on_reconnect_due(token),
        };
        self.apply(effects);
    }

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::SubmitBid { amount, reply } => {
                let result = match amount {
                    BidInput::Amount(amount) => self.machine.submit_bid(amount),
                    BidInput::Text(text) => self.machine.submit_bid_text(&text),
                };
                let outcome = result.map(|effects| self.apply(effects));
                if let Err(err) = &outcome {
                    debug!(target = "auction_feed.session", error = %err, "bid rejected");
                }
                let _ = reply.send(outcome);
            }
            Command::RequestResync => {
                let effects = self.machine.request_manual_resync();
                self.apply(effects);
            }
            Command::Reconnect => {
                let effects = self.machine.reconnect();
                self.apply(effects);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.machine.stats());
            }
            Command::Close { reply } => {
                let effects = self.machine.close();
                self.apply(effects);
                self.connection = None;
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Open { id, url } => {
                    if let Some((previous, mut connection)) = self.connection.take() {
                        debug!(target = "auction_feed.session", %previous, "superseding connection");
                        connection.close(auction_feed_proto::CLOSE_NORMAL, "Superseded");
                    }
                    let connection = self.transport.open(id, url, self.events_tx.clone());
                    self.connection = Some((id, connection));
                }
                Effect::Send(frame) => {
                    let text = match frame.to_text() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(target = "auction_feed.session", error = %err, "failed to encode frame");
                            continue;
                        }
                    };
                    match self.connection.as_ref() {
                        Some((id, connection)) => {
                            if let Err(err) = connection.send(text) {
                                warn!(target = "auction_feed.session", %id, error = %err, "dropping outbound frame");
                            }
                        }
                        None => {
                            warn!(target = "auction_feed.session", ?frame, "not connected; dropping outbound frame");
                        }
                    }
                }
                Effect::Close { code, reason } => {
                    if let Some((_, mut connection)) = self.connection.take() {
                        connection.close(code, reason);
                    }
                }
                Effect::ArmGapTimer { sequence, after } => self.timers.arm_gap(sequence, after),
                Effect::CancelGapTimer { sequence } => self.timers.cancel_gap(sequence),
                Effect::ArmReconnectTimer { token, after } => {
                    self.timers.arm_reconnect(token, after)
                }
                Effect::CancelReconnectTimer => self.timers.cancel_reconnect(),
                Effect::Notify(notification) => notification.deliver(self.observer.as_mut()),
            }
        }
    }

    fn publish_status(&self) {
        let current = self.machine.status();
        self.status.send_if_modified(|status| {
            if *status == current {
                false
            } else {
                *status = current;
                true
            }
        });
    }
}
