use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use url::Url;

use super::*;
use crate::protocol::{DraftId, DraftSnapshot, EventId};
use crate::subscription::Subscriber;

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

type Journal = Arc<Mutex<Vec<String>>>;

/// Server side of one accepted mock connection.
struct MockPeer {
    frames: mpsc::UnboundedSender<Inbound>,
}

impl MockPeer {
    fn send(&self, text: String) {
        let _ = self.frames.send(Inbound::Text(text));
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.frames.send(Inbound::Closed {
            code,
            reason: reason.to_string(),
        });
    }
}

struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    journal: Journal,
    refuse: AtomicU32,
    /// Sockets opened while set never finish closing.
    ignore_close: AtomicBool,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        self.journal.lock().unwrap().push(format!("connect {url}"));

        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("refused".into()));
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(MockPeer { frames: frames_tx });
        Ok(Box::new(MockSocket {
            url: url.clone(),
            frames: frames_rx,
            journal: self.journal.clone(),
            ignore_close: self.ignore_close.load(Ordering::SeqCst),
        }))
    }
}

struct MockSocket {
    url: Url,
    frames: mpsc::UnboundedReceiver<Inbound>,
    journal: Journal,
    ignore_close: bool,
}

#[async_trait]
impl Socket for MockSocket {
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        self.frames.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("close {} {code} {reason}", self.url));
        if self.ignore_close {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

struct Harness {
    sync: DraftSync,
    peers: mpsc::UnboundedReceiver<MockPeer>,
    journal: Journal,
    connector: Arc<MockConnector>,
}

fn harness(options: SyncOptions) -> Harness {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let journal = Journal::default();
    let connector = Arc::new(MockConnector {
        peers: peers_tx,
        journal: journal.clone(),
        refuse: AtomicU32::new(0),
        ignore_close: AtomicBool::new(false),
    });
    let endpoint = Endpoint::team_draft("http://draft.test").unwrap();
    let sync = DraftSync::new(endpoint, connector.clone(), options);
    Harness {
        sync,
        peers,
        journal,
        connector,
    }
}

fn fast_options() -> SyncOptions {
    SyncOptions {
        reconnect: ReconnectPolicy::flat(Duration::from_secs(3)),
        ..SyncOptions::default()
    }
}

const URL_ONE: &str = "ws://draft.test/ws/draft/1/";
const URL_TWO: &str = "ws://draft.test/ws/draft/2/";

impl Harness {
    async fn next_peer(&mut self) -> MockPeer {
        timeout(Duration::from_secs(120), self.peers.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped")
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn connects(&self) -> usize {
        self.journal()
            .iter()
            .filter(|line| line.starts_with("connect"))
            .count()
    }

    async fn state_until(&self, f: impl FnMut(&ConnectionState) -> bool) -> ConnectionState {
        until(self.sync.watch_connection(), f).await
    }

    async fn view_until(&self, f: impl FnMut(&DraftView) -> bool) -> DraftView {
        until(self.sync.watch_view(), f).await
    }
}

async fn until<T: Clone>(mut rx: watch::Receiver<T>, f: impl FnMut(&T) -> bool) -> T {
    let value = timeout(Duration::from_secs(300), rx.wait_for(f))
        .await
        .expect("condition not reached")
        .expect("manager dropped");
    T::clone(&value)
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

fn picked(id: i64) -> Value {
    json!({
        "id": id,
        "event_type": "player_picked",
        "payload": {
            "round": 1,
            "captain_id": 11,
            "captain_name": "Puppey",
            "picked_id": 30 + id,
            "picked_name": format!("player{id}"),
            "team_id": 5
        },
        "actor": {"pk": 11, "username": "puppey"},
        "created_at": "2025-03-01T18:30:00Z"
    })
}

fn assigned(id: i64) -> Value {
    json!({
        "id": id,
        "event_type": "captain_assigned",
        "payload": {
            "round": 2,
            "captain_id": 12,
            "captain_name": "N0tail",
            "team_id": 6,
            "was_tie": false
        },
        "created_at": "2025-03-01T18:31:00Z"
    })
}

fn backfill(events: Vec<Value>) -> String {
    json!({"type": "initial_events", "events": events}).to_string()
}

fn live(event: Value) -> String {
    json!({"type": "draft_event", "event": event}).to_string()
}

fn live_with_state(event: Value, remaining: usize) -> String {
    let users: Vec<Value> = (0..remaining).map(|pk| json!({"pk": pk})).collect();
    json!({
        "type": "draft_event",
        "event": event,
        "draft_state": {"users_remaining": users, "latest_round": 3}
    })
    .to_string()
}

fn ids(view: &DraftView) -> Vec<i64> {
    view.events.iter().map(|e| e.id.0).collect()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = count.clone();
    (count, move || {
        handle.fetch_add(1, Ordering::SeqCst);
    })
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent_for_the_same_draft() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    h.sync.connect(DraftId(1));
    let _peer = h.next_peer().await;

    let state = h
        .state_until(|s| s.status == ConnectionStatus::Connected)
        .await;
    assert_eq!(state.draft_id, Some(DraftId(1)));

    h.sync.connect(DraftId(1));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(h.peers.try_recv().is_err());
    assert_eq!(h.journal(), vec![format!("connect {URL_ONE}")]);
}

#[tokio::test(start_paused = true)]
async fn switching_drafts_closes_the_old_socket_first() {
    let mut h = harness(fast_options());
    let (a_events, bump_a) = counter();
    let sub_a = h
        .sync
        .subscribe(DraftId(1), Subscriber::new().on_event(move |_| bump_a()));

    h.sync.connect(DraftId(1));
    let peer_a = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;
    peer_a.send(backfill(vec![picked(1)]));
    h.view_until(|v| v.events.len() == 1).await;

    h.sync.connect(DraftId(2));
    let peer_b = h.next_peer().await;
    h.state_until(|s| s.draft_id == Some(DraftId(2)) && s.status == ConnectionStatus::Connected)
        .await;

    assert_eq!(
        h.journal(),
        vec![
            format!("connect {URL_ONE}"),
            format!("close {URL_ONE} 1000 switching drafts"),
            format!("connect {URL_TWO}"),
        ]
    );

    // Late traffic on the old socket goes nowhere.
    peer_a.send(live(picked(2)));
    peer_b.send(live(assigned(9)));
    let view = h.view_until(|v| !v.events.is_empty()).await;
    assert_eq!(view.draft_id, Some(DraftId(2)));
    assert_eq!(ids(&view), vec![9]);
    assert_eq!(a_events.load(Ordering::SeqCst), 0);
    assert!(!sub_a.is_active());
}

#[tokio::test(start_paused = true)]
async fn switching_drafts_waits_out_a_socket_that_will_not_close() {
    let mut h = harness(fast_options());
    h.connector.ignore_close.store(true, Ordering::SeqCst);
    h.sync.connect(DraftId(1));
    let peer_a = h.next_peer().await;
    h.connector.ignore_close.store(false, Ordering::SeqCst);
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;
    peer_a.send(live(picked(7)));
    h.view_until(|v| v.events.len() == 1).await;

    let started = tokio::time::Instant::now();
    h.sync.connect(DraftId(2));
    let peer_b = h.next_peer().await;
    assert!(started.elapsed() >= SyncOptions::default().close_timeout);
    assert_eq!(
        h.journal(),
        vec![
            format!("connect {URL_ONE}"),
            format!("close {URL_ONE} 1000 switching drafts"),
            format!("connect {URL_TWO}"),
        ]
    );

    h.state_until(|s| s.draft_id == Some(DraftId(2)) && s.status == ConnectionStatus::Connected)
        .await;
    peer_b.send(live(assigned(9)));
    let view = h.view_until(|v| !v.events.is_empty()).await;
    assert_eq!(ids(&view), vec![9]);
}

#[tokio::test]
async fn events_from_a_replaced_connection_are_discarded() {
    let (peers_tx, _peers) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        peers: peers_tx,
        journal: Journal::default(),
        refuse: AtomicU32::new(0),
        ignore_close: AtomicBool::new(false),
    });
    let (transport_tx, _transport_rx) = mpsc::unbounded_channel();
    let registry = SubscriberRegistry::new();
    let (mut engine, connection, view) = Engine::new(
        Endpoint::team_draft("http://draft.test").unwrap(),
        connector,
        fast_options(),
        registry.clone(),
        transport_tx,
    );
    let (events, bump) = counter();
    let _sub = registry.subscribe(DraftId(2), Subscriber::new().on_event(move |_| bump()));

    engine.draft_id = Some(DraftId(2));
    engine.generation = 5;

    engine.on_transport(TransportEvent {
        generation: 4,
        kind: TransportEventKind::Frame(live(picked(7))),
    });
    assert_eq!(*view.borrow(), DraftView::default());
    assert_eq!(events.load(Ordering::SeqCst), 0);

    engine.on_transport(TransportEvent {
        generation: 4,
        kind: TransportEventKind::Closed {
            code: 1011,
            reason: "old server".into(),
        },
    });
    assert!(engine.reconnect_timer.is_none());
    assert_eq!(*connection.borrow(), ConnectionState::default());

    engine.on_transport(TransportEvent {
        generation: 5,
        kind: TransportEventKind::Frame(live(assigned(9))),
    });
    assert_eq!(ids(&view.borrow()), vec![9]);
    assert_eq!(events.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_cancels_a_pending_reconnect() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    let peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    peer.close(1011, "server restart");
    h.state_until(|s| s.status == ConnectionStatus::Reconnecting)
        .await;

    let Harness {
        sync,
        mut peers,
        journal,
        connector: _connector,
    } = h;
    drop(sync);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(peers.try_recv().is_err());
    assert_eq!(journal.lock().unwrap().as_slice(), [format!("connect {URL_ONE}")]);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_closes_the_socket_normally() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    let _peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    let journal = h.journal.clone();
    drop(h.sync);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        journal.lock().unwrap().last().cloned(),
        Some(format!("close {URL_ONE} 1000 client dropped"))
    );
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_reconnects_once_and_takes_a_fresh_backfill() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    let peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;
    peer.send(backfill(vec![picked(2), picked(1)]));
    h.view_until(|v| v.events.len() == 2).await;

    peer.close(1011, "server restart");
    let state = h
        .state_until(|s| s.status == ConnectionStatus::Reconnecting)
        .await;
    assert_eq!(state.reconnect_attempts, 1);

    let peer = h.next_peer().await;
    let state = h
        .state_until(|s| s.status == ConnectionStatus::Connected)
        .await;
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(h.connects(), 2);

    peer.send(backfill(vec![picked(3), picked(2), picked(1)]));
    let view = h.view_until(|v| v.events.len() == 3).await;
    assert_eq!(ids(&view), vec![3, 2, 1]);
    assert!(!view.has_new_event);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_reconnect() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    let peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    // Dropping the peer ends the stream without a close frame.
    drop(peer);
    h.state_until(|s| s.status == ConnectionStatus::Reconnecting)
        .await;

    h.sync.disconnect(DraftId(1), "left draft page");
    let state = h
        .state_until(|s| s.status == ConnectionStatus::Disconnected)
        .await;
    assert_eq!(state, ConnectionState::default());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.peers.try_recv().is_err());
    assert_eq!(h.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_normally_and_clears_subscribers() {
    let mut h = harness(fast_options());
    let sub = h.sync.subscribe(DraftId(1), Subscriber::new());
    let other = h.sync.subscribe(DraftId(7), Subscriber::new());

    h.sync.connect(DraftId(1));
    let _peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    h.sync.disconnect(DraftId(1), "left draft page");
    h.state_until(|s| s.status == ConnectionStatus::Disconnected)
        .await;

    assert_eq!(
        h.journal().last().map(String::as_str),
        Some(format!("close {URL_ONE} 1000 left draft page").as_str())
    );
    assert!(!sub.is_active());
    assert!(other.is_active());
    assert_eq!(h.sync.view(), DraftView::default());
}

#[tokio::test(start_paused = true)]
async fn disconnect_for_another_draft_is_ignored() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    let _peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    h.sync.disconnect(DraftId(2), "stale page");
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.sync.connection_state().status, ConnectionStatus::Connected);
    assert_eq!(h.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_normal_close_does_not_retry() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    let peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    peer.close(NORMAL_CLOSURE, "draft closed");
    let state = h
        .state_until(|s| s.status == ConnectionStatus::Disconnected)
        .await;
    assert_eq!(state.draft_id, Some(DraftId(1)));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connects(), 1);

    // An explicit connect to the same draft opens it again.
    h.sync.connect(DraftId(1));
    let _peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;
    assert_eq!(h.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn refused_connects_give_up_after_the_cap() {
    let h = harness(SyncOptions {
        reconnect: ReconnectPolicy {
            max_attempts: Some(2),
            ..ReconnectPolicy::flat(Duration::from_secs(3))
        },
        ..SyncOptions::default()
    });
    h.connector.refuse.store(u32::MAX, Ordering::SeqCst);

    h.sync.connect(DraftId(1));
    let state = h
        .state_until(|s| s.error.as_deref().is_some_and(|e| e.starts_with("gave up")))
        .await;

    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(state.error.as_deref(), Some("gave up after 2 reconnect attempts"));
    assert_eq!(h.connects(), 3);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn connect_error_is_reported_then_cleared() {
    let mut h = harness(fast_options());
    h.connector.refuse.store(1, Ordering::SeqCst);

    h.sync.connect(DraftId(1));
    let state = h
        .state_until(|s| s.status == ConnectionStatus::Reconnecting)
        .await;
    assert_eq!(state.error.as_deref(), Some("connection failed: refused"));

    let _peer = h.next_peer().await;
    let state = h
        .state_until(|s| s.status == ConnectionStatus::Connected)
        .await;
    assert_eq!(state.error, None);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_socket_normally() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    let _peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    let journal = h.journal.clone();
    h.sync.shutdown().await;

    assert_eq!(
        journal.lock().unwrap().last().cloned(),
        Some(format!("close {URL_ONE} 1000 client shutdown"))
    );
}

// ---------------------------------------------------------------------------
// Events and reconciliation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn backfill_then_live_events_with_duplicates() {
    let mut h = harness(fast_options());
    let (events, bump_events) = counter();
    let (refreshes, bump_refreshes) = counter();
    let (snapshots, bump_snapshots) = counter();
    let toasts: Arc<Mutex<Vec<String>>> = Arc::default();
    let toast_sink = toasts.clone();
    let _sub = h.sync.subscribe(
        DraftId(1),
        Subscriber::new()
            .on_event(move |_| bump_events())
            .on_refresh_needed(move |_| bump_refreshes())
            .on_snapshot(move |_| bump_snapshots())
            .on_notification(move |text| toast_sink.lock().unwrap().push(text.to_string())),
    );

    h.sync.connect(DraftId(1));
    let peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    peer.send(backfill(vec![picked(3), picked(2), picked(1)]));
    let view = h.view_until(|v| v.events.len() == 3).await;
    assert!(!view.has_new_event);
    assert_eq!(events.load(Ordering::SeqCst), 0);

    peer.send(live(picked(4)));
    let view = h.view_until(|v| v.events.len() == 4).await;
    assert_eq!(ids(&view), vec![4, 3, 2, 1]);
    assert!(view.has_new_event);

    // Redelivery of an event already in the log is a no-op.
    peer.send(live(picked(4)));
    peer.send(live(picked(2)));
    peer.send(live_with_state(assigned(5), 6));
    let view = h.view_until(|v| v.events.len() == 5).await;
    assert_eq!(ids(&view), vec![5, 4, 3, 2, 1]);
    assert_eq!(view.users_remaining_count, 6);
    assert!(!view.is_draft_completed);

    assert_eq!(events.load(Ordering::SeqCst), 2);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(snapshots.load(Ordering::SeqCst), 1);
    assert_eq!(
        *toasts.lock().unwrap(),
        vec!["Puppey picked player4 (round 1)".to_string()]
    );

    h.sync.mark_viewed();
    let view = h.view_until(|v| !v.has_new_event).await;
    assert_eq!(view.events.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn empty_pool_marks_the_draft_completed() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    let peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    peer.send(live_with_state(picked(10), 0));
    let view = h.view_until(|v| v.events.len() == 1).await;
    assert!(view.is_draft_completed);
    assert_eq!(view.users_remaining_count, 0);
    assert_eq!(
        view.snapshot.as_ref().and_then(|s| s.get("latest_round")),
        Some(&json!(3))
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped() {
    let mut h = harness(fast_options());
    h.sync.connect(DraftId(1));
    let peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    peer.send("not json".into());
    peer.send(r#"{"type":"chat_message","text":"gl hf"}"#.into());
    peer.send(r#"{"type":"draft_event","event":{"id":1}}"#.into());
    peer.send(live(assigned(2)));

    let view = h.view_until(|v| !v.events.is_empty()).await;
    assert_eq!(ids(&view), vec![2]);
    assert_eq!(h.sync.connection_state().status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn applied_snapshot_reaches_view_and_subscribers() {
    let mut h = harness(fast_options());
    let (snapshots, bump) = counter();
    let _sub = h
        .sync
        .subscribe(DraftId(1), Subscriber::new().on_snapshot(move |_| bump()));

    h.sync.connect(DraftId(1));
    let _peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    // Not the owned draft.
    h.sync.apply_snapshot(DraftId(2), DraftSnapshot::default());

    let snapshot: DraftSnapshot =
        serde_json::from_value(json!({"users_remaining": [{"pk": 1}, {"pk": 2}]})).unwrap();
    h.sync.apply_snapshot(DraftId(1), snapshot);

    let view = h.view_until(|v| v.snapshot.is_some()).await;
    assert_eq!(view.users_remaining_count, 2);
    assert_eq!(snapshots.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn replaced_callback_receives_the_next_event() {
    let mut h = harness(fast_options());
    let (first, bump_first) = counter();
    let (second, bump_second) = counter();
    let sub = h
        .sync
        .subscribe(DraftId(1), Subscriber::new().on_event(move |_| bump_first()));

    h.sync.connect(DraftId(1));
    let peer = h.next_peer().await;
    h.state_until(|s| s.status == ConnectionStatus::Connected)
        .await;

    peer.send(live(assigned(1)));
    h.view_until(|v| v.events.len() == 1).await;

    assert!(sub.set_on_event(move |_| bump_second()));
    peer.send(live(assigned(2)));
    h.view_until(|v| v.events.len() == 2).await;

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(h.connects(), 1);
    assert_eq!(h.sync.view().events[0].id, EventId(2));
}
