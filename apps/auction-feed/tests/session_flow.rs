use std::sync::Arc;
use std::time::Duration;

use auction_feed_client::proto::{BidAmount, BidEvent, ClientFrame, SequenceNumber};
use auction_feed_client::session::ConnectionId;
use auction_feed_client::transport::{MockTransport, OpenBehavior};
use auction_feed_client::{
    ClientError, ConnectionStatus, Degraded, FeedConfig, SessionError, SessionHandle,
    SessionObserver,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Log {
    snapshots: Vec<SequenceNumber>,
    accepted: Vec<SequenceNumber>,
    errors: Vec<SessionError>,
    degraded: Vec<Degraded>,
    connected: usize,
    disconnected: usize,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Log>>);

impl Recorder {
    fn accepted(&self) -> Vec<SequenceNumber> {
        self.0.lock().accepted.clone()
    }

    fn exhausted_errors(&self) -> usize {
        self.0
            .lock()
            .errors
            .iter()
            .filter(|err| err.is_fatal())
            .count()
    }
}

impl SessionObserver for Recorder {
    fn on_snapshot(&mut self, sequence: SequenceNumber, _data: Option<&Value>) {
        self.0.lock().snapshots.push(sequence);
    }

    fn on_event_accepted(&mut self, event: &BidEvent) {
        self.0.lock().accepted.push(event.sequence);
    }

    fn on_error(&mut self, error: &SessionError) {
        self.0.lock().errors.push(error.clone());
    }

    fn on_connected(&mut self) {
        self.0.lock().connected += 1;
    }

    fn on_disconnected(&mut self) {
        self.0.lock().disconnected += 1;
    }

    fn on_degraded(&mut self, reason: &Degraded) {
        self.0.lock().degraded.push(reason.clone());
    }
}

struct Harness {
    mock: MockTransport,
    recorder: Recorder,
    session: SessionHandle,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(behavior: OpenBehavior) -> Self {
        let config = FeedConfig::new("ws://127.0.0.1:8000", "lot-1").unwrap();
        let mock = MockTransport::new(behavior);
        let recorder = Recorder::default();
        let (session, task) = auction_feed_client::spawn(config, mock.clone(), recorder.clone());
        Self {
            mock,
            recorder,
            session,
            task,
        }
    }

    async fn open_at(base: SequenceNumber) -> (Self, ConnectionId) {
        let harness = Self::start(OpenBehavior::Accept);
        harness
            .session
            .wait_for_status(ConnectionStatus::Open)
            .await
            .unwrap();
        let id = harness.mock.latest().unwrap();
        harness
            .mock
            .push_json(id, json!({"type": "initial_state", "sequence": base}));
        (harness, id)
    }

    /// Round-trips a command through the session task so every transport
    /// event pushed before this call has been processed.
    async fn settle(&self) {
        self.session.stats().await.unwrap();
    }
}

fn bid_update(sequence: SequenceNumber) -> Value {
    json!({
        "type": "bid_update",
        "sequence": sequence,
        "amount": 100 * sequence,
        "username": format!("bidder-{sequence}"),
        "bid_count": sequence,
        "timestamp": "2024-05-01T12:00:00Z",
    })
}

fn bid_payload(sequence: SequenceNumber) -> Value {
    let mut value = bid_update(sequence);
    if let Some(object) = value.as_object_mut() {
        object.remove("type");
    }
    value
}

fn acks(frames: &[ClientFrame]) -> Vec<SequenceNumber> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            ClientFrame::Ack { sequence } => Some(*sequence),
            _ => None,
        })
        .collect()
}

fn sync_requests(frames: &[ClientFrame]) -> Vec<SequenceNumber> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            ClientFrame::SyncRequest { from_sequence } => Some(*from_sequence),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn out_of_order_events_are_delivered_and_acked_in_sequence() {
    let (harness, id) = Harness::open_at(4).await;
    for sequence in [7, 6, 5, 8] {
        harness.mock.push_json(id, bid_update(sequence));
    }
    harness.settle().await;

    assert_eq!(harness.recorder.accepted(), vec![5, 6, 7, 8]);
    assert_eq!(acks(&harness.mock.sent(id)), vec![5, 6, 7, 8]);
    let stats = harness.session.stats().await.unwrap();
    assert_eq!(stats.expected_sequence, 9);
    assert_eq!(stats.buffered, 0);
}

#[tokio::test(start_paused = true)]
async fn gap_timeout_requests_one_resync_and_reply_fills_the_gap() {
    let (harness, id) = Harness::open_at(4).await;
    harness.mock.push_json(id, bid_update(7));
    harness.settle().await;
    assert!(sync_requests(&harness.mock.sent(id)).is_empty());

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    harness.settle().await;
    assert_eq!(sync_requests(&harness.mock.sent(id)), vec![4]);

    harness.mock.push_json(
        id,
        json!({
            "type": "reconnect_sync",
            "missed_count": 2,
            "truncated": false,
            "messages": [bid_payload(5), bid_payload(6)],
        }),
    );
    harness.settle().await;
    assert_eq!(harness.recorder.accepted(), vec![5, 6, 7]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    harness.settle().await;
    assert_eq!(sync_requests(&harness.mock.sent(id)), vec![4]);
}

#[tokio::test(start_paused = true)]
async fn truncated_resync_reports_degraded_once() {
    let (harness, id) = Harness::open_at(8).await;
    harness.mock.push_json(
        id,
        json!({
            "type": "reconnect_sync",
            "missed_count": 5,
            "truncated": true,
            "messages": [bid_payload(9), bid_payload(10)],
        }),
    );
    harness.settle().await;

    assert_eq!(harness.recorder.accepted(), vec![9, 10]);
    assert_eq!(
        harness.recorder.0.lock().degraded,
        vec![Degraded::TruncatedResync {
            missed_count: 5,
            supplied: 2
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn truncated_resync_past_the_stream_resumes_from_supplied_history() {
    let (harness, id) = Harness::open_at(0).await;
    harness.mock.push_json(id, bid_update(103));
    harness.settle().await;
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    harness.settle().await;
    assert_eq!(sync_requests(&harness.mock.sent(id)), vec![0]);

    let reply = json!({
        "type": "reconnect_sync",
        "missed_count": 105,
        "truncated": true,
        "messages": (101..=105).map(bid_payload).collect::<Vec<_>>(),
    });
    for _ in 0..3 {
        harness.mock.push_json(id, reply.clone());
        harness.settle().await;
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        harness.settle().await;
    }
    for sequence in 106..=110 {
        harness.mock.push_json(id, bid_update(sequence));
    }
    harness.settle().await;

    let expected: Vec<SequenceNumber> = (101..=110).collect();
    assert_eq!(harness.recorder.accepted(), expected);
    assert_eq!(acks(&harness.mock.sent(id)), expected);
    assert_eq!(sync_requests(&harness.mock.sent(id)), vec![0]);
    let stats = harness.session.stats().await.unwrap();
    assert_eq!(stats.expected_sequence, 111);
    assert_eq!(stats.buffered, 0);
}

#[tokio::test(start_paused = true)]
async fn stale_snapshot_does_not_replay_accepted_events() {
    let (harness, id) = Harness::open_at(0).await;
    for sequence in 1..=5 {
        harness.mock.push_json(id, bid_update(sequence));
    }
    harness
        .mock
        .push_json(id, json!({"type": "initial_state", "sequence": 2}));
    for sequence in 3..=5 {
        harness.mock.push_json(id, bid_update(sequence));
    }
    harness.settle().await;

    assert_eq!(harness.recorder.accepted(), vec![1, 2, 3, 4, 5]);
    assert_eq!(acks(&harness.mock.sent(id)), vec![1, 2, 3, 4, 5]);
    let log = harness.recorder.0.lock();
    assert_eq!(log.snapshots, vec![0]);
    assert_eq!(
        log.degraded,
        vec![Degraded::StaleSnapshot {
            sequence: 2,
            last_accepted: 5
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_and_gives_up_after_five_attempts() {
    let harness = Harness::start(OpenBehavior::Refuse);
    tokio::time::sleep(Duration::from_secs(120)).await;
    harness.settle().await;

    let opened = harness.mock.opened();
    assert_eq!(opened.len(), 6, "initial attempt plus five retries");
    let gaps: Vec<u128> = opened
        .windows(2)
        .map(|pair| pair[1].at.duration_since(pair[0].at).as_millis())
        .collect();
    for (gap, expected) in gaps.iter().zip([1_000u128, 2_000, 4_000, 8_000, 16_000]) {
        assert!(
            gap.abs_diff(expected) <= 5,
            "reconnect delay {gap}ms, expected {expected}ms"
        );
    }

    assert_eq!(harness.recorder.exhausted_errors(), 1);
    assert!(harness
        .recorder
        .0
        .lock()
        .errors
        .contains(&SessionError::ReconnectExhausted { attempts: 5 }));
    assert_eq!(harness.session.status(), ConnectionStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_recovers_after_exhaustion() {
    let harness = Harness::start(OpenBehavior::Refuse);
    tokio::time::sleep(Duration::from_secs(120)).await;
    harness.settle().await;
    assert_eq!(harness.session.status(), ConnectionStatus::Closed);

    harness.mock.set_behavior(OpenBehavior::Accept);
    harness.session.reconnect().unwrap();
    harness
        .session
        .wait_for_status(ConnectionStatus::Open)
        .await
        .unwrap();
    assert_eq!(harness.mock.opened().len(), 7);
    assert_eq!(harness.session.stats().await.unwrap().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_from_last_accepted_and_ignores_old_connection() {
    let (harness, first) = Harness::open_at(0).await;
    harness.mock.push_json(first, bid_update(1));
    harness.mock.push_json(first, bid_update(2));
    harness.mock.drop_connection(first);
    harness.settle().await;
    assert_eq!(harness.session.status(), ConnectionStatus::Reconnecting);

    harness
        .session
        .wait_for_status(ConnectionStatus::Open)
        .await
        .unwrap();
    let opened = harness.mock.opened();
    assert_eq!(opened.len(), 2);
    assert_eq!(opened[1].url.query(), Some("last_seq=2"));
    let second = opened[1].id;

    harness.mock.push_json(
        second,
        json!({
            "type": "reconnect_sync",
            "missed_count": 1,
            "messages": [bid_payload(2), bid_payload(3)],
        }),
    );
    harness.mock.push_json(first, bid_update(4));
    harness.settle().await;

    assert_eq!(harness.recorder.accepted(), vec![1, 2, 3]);
    assert_eq!(acks(&harness.mock.sent(second)), vec![3]);
    let log = harness.recorder.0.lock();
    assert_eq!(log.connected, 2);
    assert_eq!(log.disconnected, 1);
}

#[tokio::test(start_paused = true)]
async fn normal_server_close_does_not_reconnect() {
    let (harness, id) = Harness::open_at(0).await;
    harness.mock.close_from_server(id, 1000);
    tokio::time::sleep(Duration::from_secs(60)).await;
    harness.settle().await;

    assert_eq!(harness.mock.opened().len(), 1);
    assert_eq!(harness.session.status(), ConnectionStatus::Closed);
    assert_eq!(harness.recorder.0.lock().disconnected, 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_bids_never_reach_the_wire() {
    let (harness, id) = Harness::open_at(0).await;

    for amount in [0, -5] {
        assert!(matches!(
            harness.session.submit_bid(amount).await,
            Err(ClientError::Validation(_))
        ));
    }
    assert!(matches!(
        harness.session.submit_bid_text("twelve").await,
        Err(ClientError::Validation(_))
    ));
    harness.session.submit_bid(100).await.unwrap();

    let bids: Vec<_> = harness
        .mock
        .sent(id)
        .into_iter()
        .filter(|frame| matches!(frame, ClientFrame::Bid { .. }))
        .collect();
    assert_eq!(
        bids,
        vec![ClientFrame::Bid {
            amount: BidAmount::new(100).unwrap()
        }]
    );
    assert!(harness.recorder.0.lock().errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn bids_are_rejected_until_connected() {
    let harness = Harness::start(OpenBehavior::Manual);
    harness.settle().await;
    assert_eq!(harness.session.status(), ConnectionStatus::Connecting);
    assert_eq!(
        harness.session.submit_bid(100).await,
        Err(ClientError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn ping_is_answered_and_lag_triggers_resync() {
    let (harness, id) = Harness::open_at(10).await;
    harness.mock.push_json(id, json!({"type": "ping", "sequence": 25}));
    harness.settle().await;

    let sent = harness.mock.sent(id);
    assert!(sent.contains(&ClientFrame::Pong { sequence: 25 }));
    assert_eq!(sync_requests(&sent), vec![10]);
}

#[tokio::test(start_paused = true)]
async fn close_is_terminal_and_cancels_pending_work() {
    let (harness, id) = Harness::open_at(0).await;
    harness.mock.push_json(id, bid_update(3));
    harness.settle().await;

    harness.session.close().await;
    assert_eq!(harness.mock.closed_with(id), Some(1000));
    assert_eq!(
        harness.session.submit_bid(100).await,
        Err(ClientError::SessionClosed)
    );
    harness.task.await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(sync_requests(&harness.mock.sent(id)).is_empty());
    assert_eq!(harness.mock.opened().len(), 1);
    assert_eq!(harness.recorder.0.lock().disconnected, 1);
}
