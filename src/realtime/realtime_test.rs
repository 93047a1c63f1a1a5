use super::*;
use crate::config::BackoffConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

// =========================================================================
// MockTransport
// =========================================================================

enum Outcome {
    Accept,
    Fail,
    Reject,
}

/// Server half of an accepted link, handed to the test.
struct ServerSide {
    /// Frames the client emitted.
    from_client: mpsc::UnboundedReceiver<Frame>,
    /// Push frames to the client. Dropping it simulates a transport drop.
    to_client: mpsc::UnboundedSender<Frame>,
}

/// Plays scripted outcomes in order; once the script is empty every open fails.
struct MockTransport {
    script: Mutex<VecDeque<Outcome>>,
    opens: AtomicUsize,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl MockTransport {
    fn new(script: impl IntoIterator<Item = Outcome>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let transport =
            Arc::new(Self { script: Mutex::new(script.into_iter().collect()), opens: AtomicUsize::new(0), servers });
        (transport, rx)
    }

    fn push(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn open(&self, token: &str) -> Result<TransportLink, ConnectionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Outcome::Accept) => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                let _ = self.servers.send(ServerSide { from_client: out_rx, to_client: in_tx });
                Ok(TransportLink { outbound: out_tx, inbound: in_rx })
            }
            Some(Outcome::Reject) => Err(ConnectionError::Rejected(format!("token {token} refused"))),
            Some(Outcome::Fail) | None => Err(ConnectionError::Transport("connection refused".into())),
        }
    }
}

fn fast_backoff(max_attempts: u32) -> Backoff {
    Backoff::new(BackoffConfig {
        base: Duration::from_millis(5),
        max: Duration::from_millis(20),
        max_attempts,
        jitter: 0.0,
    })
}

fn manager(transport: Arc<MockTransport>, max_attempts: u32) -> ConnectionManager {
    ConnectionManager::new(transport, fast_backoff(max_attempts))
}

async fn wait_state(conn: &ConnectionManager, state: ConnectionState) {
    let mut rx = conn.watch();
    timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
        .unwrap();
}

async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    timeout(Duration::from_secs(2), servers.recv())
        .await
        .expect("server side should arrive")
        .expect("transport alive")
}

/// Drain events until `pred` matches, returning everything seen.
async fn collect_until(
    rx: &mut broadcast::Receiver<ConnectionEvent>,
    pred: impl Fn(&ConnectionEvent) -> bool,
) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv()).await.expect("event").expect("channel open");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn states(events: &[ConnectionEvent]) -> Vec<(ConnectionState, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::StateChanged { state, attempt } => Some((*state, *attempt)),
            _ => None,
        })
        .collect()
}

// =========================================================================
// connect
// =========================================================================

#[tokio::test]
async fn starts_idle() {
    let (transport, _servers) = MockTransport::new([]);
    let conn = manager(transport, 3);
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(conn.attempt(), 0);
}

#[tokio::test]
async fn connect_reaches_open() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept]);
    let conn = manager(Arc::clone(&transport), 3);
    let mut events = conn.events();

    assert!(conn.connect("tok-1"));
    let _server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;

    let seen = collect_until(&mut events, |e| matches!(e, ConnectionEvent::StateChanged { state: ConnectionState::Open, .. })).await;
    assert_eq!(states(&seen), vec![(ConnectionState::Connecting, 0), (ConnectionState::Open, 0)]);
}

#[tokio::test]
async fn second_connect_is_noop_while_active() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept]);
    let conn = manager(Arc::clone(&transport), 3);

    assert!(conn.connect("tok-1"));
    let _server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;

    assert!(!conn.connect("tok-1"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    assert_eq!(conn.state(), ConnectionState::Open);
}

// =========================================================================
// reconnect
// =========================================================================

#[tokio::test]
async fn drop_reconnects_and_resets_attempt() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept, Outcome::Accept]);
    let conn = manager(transport, 3);
    conn.connect("tok-1");
    let server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;

    let mut events = conn.events();
    drop(server);
    let _second = next_server(&mut servers).await;

    let seen = collect_until(&mut events, |e| matches!(e, ConnectionEvent::StateChanged { state: ConnectionState::Open, .. })).await;
    assert_eq!(
        states(&seen),
        vec![(ConnectionState::Reconnecting, 0), (ConnectionState::Connecting, 0), (ConnectionState::Open, 0)]
    );
    assert_eq!(conn.attempt(), 0);
}

#[tokio::test]
async fn failed_retries_increment_attempt() {
    let (transport, mut servers) =
        MockTransport::new([Outcome::Accept, Outcome::Fail, Outcome::Fail, Outcome::Accept]);
    let conn = manager(transport, 5);
    conn.connect("tok-1");
    let server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;

    let mut events = conn.events();
    drop(server);
    let _second = next_server(&mut servers).await;

    let seen = collect_until(&mut events, |e| matches!(e, ConnectionEvent::StateChanged { state: ConnectionState::Open, .. })).await;
    assert_eq!(
        states(&seen),
        vec![
            (ConnectionState::Reconnecting, 0),
            (ConnectionState::Connecting, 0),
            (ConnectionState::Reconnecting, 1),
            (ConnectionState::Connecting, 1),
            (ConnectionState::Reconnecting, 2),
            (ConnectionState::Connecting, 2),
            (ConnectionState::Open, 0),
        ]
    );
}

#[tokio::test]
async fn exhausted_retries_declare_lost() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept]);
    let conn = manager(Arc::clone(&transport), 2);
    conn.connect("tok-1");
    let server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;

    let mut events = conn.events();
    drop(server);

    let seen = collect_until(&mut events, |e| matches!(e, ConnectionEvent::Lost { .. })).await;
    assert_eq!(seen.last(), Some(&ConnectionEvent::Lost { attempts: 2 }));
    assert_eq!(conn.state(), ConnectionState::Closed);
    // One initial open plus two retries.
    assert_eq!(transport.opens.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 3, "no retries after lost");
}

#[tokio::test]
async fn initial_failure_takes_retry_path() {
    let (transport, mut servers) = MockTransport::new([Outcome::Fail, Outcome::Accept]);
    let conn = manager(transport, 3);
    conn.connect("tok-1");
    let _server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;
    assert_eq!(conn.attempt(), 0);
}

#[tokio::test]
async fn rejected_handshake_closes_without_retry() {
    let (transport, _servers) = MockTransport::new([Outcome::Reject, Outcome::Accept]);
    let conn = manager(Arc::clone(&transport), 3);
    let mut events = conn.events();
    conn.connect("bad");

    let seen = collect_until(&mut events, |e| matches!(e, ConnectionEvent::Rejected { .. })).await;
    assert!(matches!(seen.last(), Some(ConnectionEvent::Rejected { reason }) if reason.contains("bad")));
    assert_eq!(conn.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

// =========================================================================
// emit / subscribe
// =========================================================================

#[tokio::test]
async fn emit_fails_fast_unless_open() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept]);
    let conn = manager(transport, 3);
    assert!(matches!(conn.emit("bot:message", serde_json::json!({})), Err(ConnectionError::NotConnected)));

    conn.connect("tok-1");
    let mut server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;

    let id = conn.emit("bot:message", serde_json::json!({ "text": "hi" })).unwrap();
    let frame = timeout(Duration::from_secs(1), server.from_client.recv()).await.unwrap().unwrap();
    assert_eq!(frame.id, id);
    assert_eq!(frame.event, "bot:message");
    assert_eq!(frame.data_str("text"), Some("hi"));

    conn.disconnect();
    assert!(matches!(conn.emit("bot:message", serde_json::json!({})), Err(ConnectionError::NotConnected)));
}

#[tokio::test]
async fn listeners_survive_reconnect() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept, Outcome::Accept]);
    let conn = manager(transport, 3);
    let (_sub, mut rx) = conn.subscribe_channel("booking:updated");

    conn.connect("tok-1");
    let server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;
    server.to_client.send(Frame::request("booking:updated", serde_json::json!({ "n": 1 }))).unwrap();
    let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.data["n"], 1);

    drop(server);
    let server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;
    server.to_client.send(Frame::request("booking:updated", serde_json::json!({ "n": 2 }))).unwrap();
    let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.data["n"], 2);
}

#[tokio::test]
async fn listeners_run_in_registration_order() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept]);
    let conn = manager(transport, 3);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let _a = conn.subscribe("ping", {
        let order = Arc::clone(&order);
        move |_| order.lock().unwrap().push("a")
    });
    let _b = conn.subscribe("ping", {
        let order = Arc::clone(&order);
        move |_| {
            order.lock().unwrap().push("b");
            let _ = done_tx.send(());
        }
    });

    conn.connect("tok-1");
    let server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;
    server.to_client.send(Frame::request("ping", serde_json::Value::Null)).unwrap();
    timeout(Duration::from_secs(1), done_rx.recv()).await.unwrap().unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept]);
    let conn = manager(transport, 3);
    let (sub, mut rx) = conn.subscribe_channel("ping");
    let (_keep, mut control) = conn.subscribe_channel("pong");

    assert!(sub.unsubscribe());

    conn.connect("tok-1");
    let server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;
    server.to_client.send(Frame::request("ping", serde_json::Value::Null)).unwrap();
    server.to_client.send(Frame::request("pong", serde_json::Value::Null)).unwrap();

    // pong arrives after ping, so ping would already be queued if delivered.
    timeout(Duration::from_secs(1), control.recv()).await.unwrap().unwrap();
    assert!(rx.try_recv().is_err());
}

// =========================================================================
// disconnect
// =========================================================================

#[tokio::test]
async fn disconnect_during_backoff_cancels_retry() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept]);
    let conn = ConnectionManager::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Backoff::new(BackoffConfig {
            base: Duration::from_millis(200),
            max: Duration::from_millis(200),
            max_attempts: 3,
            jitter: 0.0,
        }),
    );
    conn.connect("tok-1");
    let server = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;

    drop(server);
    wait_state(&conn, ConnectionState::Reconnecting).await;
    conn.disconnect();
    assert_eq!(conn.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn disconnect_is_idempotent_and_allows_reconnect() {
    let (transport, mut servers) = MockTransport::new([Outcome::Accept]);
    let conn = manager(Arc::clone(&transport), 3);
    conn.connect("tok-1");
    let _first = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;

    let mut events = conn.events();
    conn.disconnect();
    conn.disconnect();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(events.try_recv().unwrap(), ConnectionEvent::StateChanged { state: ConnectionState::Closed, attempt: 0 });
    assert!(events.try_recv().is_err(), "second disconnect must not emit");

    transport.push(Outcome::Accept);
    assert!(conn.connect("tok-2"));
    let _second = next_server(&mut servers).await;
    wait_state(&conn, ConnectionState::Open).await;
}
