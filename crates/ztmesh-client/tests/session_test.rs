//! Relay session behaviour over the in-memory transport
//!
//! The test plays the relay on the far end of a `memory::pair()`.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use ztmesh_client::{
    Credential, Direction, ErrorKind, InboundRouteHandler, Lifecycle, PendingRoute,
    RelaySession, RouteInfo, RouteRequest, SessionConfig, SessionError, SessionState,
};
use ztmesh_proto::{
    ControlMessage, FrameCodec, RelayFrame, RouteProtocol, RouteSetup, TrafficData,
};
use ztmesh_transport::memory::{self, MemoryEndpoint};
use ztmesh_transport::{FrameSink, FrameSource, MemoryConnector};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> SessionConfig {
    SessionConfig::new(
        Url::parse("ws://relay.test/derp").unwrap(),
        "dev-a",
        Credential::RelayToken("relay-token".to_string()),
    )
    .with_org_id(Some("org-1".to_string()))
}

async fn send(relay: &mut MemoryEndpoint, frame: RelayFrame) {
    relay
        .sink
        .send_frame(FrameCodec::encode(&frame).unwrap())
        .await
        .unwrap();
}

async fn send_raw(relay: &mut MemoryEndpoint, raw: Vec<u8>) {
    relay.sink.send_frame(Bytes::from(raw)).await.unwrap();
}

async fn recv(relay: &mut MemoryEndpoint) -> RelayFrame {
    let bytes = tokio::time::timeout(WAIT, relay.source.recv_frame())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .expect("session closed the connection");
    FrameCodec::decode(bytes).unwrap()
}

/// Connect a session and complete registration from the relay side
async fn connected() -> (RelaySession, MemoryEndpoint) {
    let (client, relay) = memory::pair();
    connect_over(client, relay, config()).await
}

/// A registered session whose relay stops reading right after Register
async fn stalled_relay() -> (RelaySession, MemoryEndpoint) {
    let (client, relay) = memory::pair();
    connect_over(
        client.stall_writes_after(1),
        relay,
        config().with_close_timeout(Duration::from_millis(200)),
    )
    .await
}

async fn connect_over(
    client: MemoryEndpoint,
    mut relay: MemoryEndpoint,
    config: SessionConfig,
) -> (RelaySession, MemoryEndpoint) {
    let connector = MemoryConnector::new(client);

    let relay_task = tokio::spawn(async move {
        match recv(&mut relay).await {
            RelayFrame::Control(ControlMessage::Register { .. }) => {}
            other => panic!("Expected Register, got {:?}", other),
        }
        send(
            &mut relay,
            RelayFrame::Control(ControlMessage::Registered {
                session_id: "relay-session".to_string(),
            }),
        )
        .await;
        relay
    });

    let session = RelaySession::connect(config, &connector).await.unwrap();
    (session, relay_task.await.unwrap())
}

/// Send traffic until a write fails, counting the frames queued
fn spawn_flood(
    session: &RelaySession,
    queued: Arc<AtomicUsize>,
) -> tokio::task::JoinHandle<SessionError> {
    let session = session.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = session
                .send_traffic_data("bulk", Bytes::from_static(b"x"))
                .await
            {
                return e;
            }
            queued.fetch_add(1, Ordering::SeqCst);
        }
    })
}

/// Wait until the flood stops making progress, i.e. the write queue is full
async fn wait_until_blocked(queued: &AtomicUsize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    let mut last = 0;
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let now = queued.load(Ordering::SeqCst);
        if now > 0 && now == last {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "writes never backed up"
        );
        last = now;
    }
}

fn spawn_run(
    session: &RelaySession,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<Result<(), SessionError>> {
    let session = session.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { session.run(cancel).await })
}

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn setup(route_id: &str, target_port: u16) -> RelayFrame {
    RelayFrame::RouteSetup(RouteSetup {
        route_id: route_id.to_string(),
        org_id: Some("org-1".to_string()),
        source_device: "dev-b".to_string(),
        target_device: "dev-a".to_string(),
        external_port: target_port,
        target_port,
        protocol: RouteProtocol::Tcp,
    })
}

fn data(route_id: &str, payload: &[u8]) -> RelayFrame {
    RelayFrame::TrafficData(TrafficData::new(route_id, Bytes::copy_from_slice(payload)))
}

fn eof(route_id: &str) -> RelayFrame {
    RelayFrame::TrafficData(TrafficData::end_of_stream(route_id))
}

async fn wait_for_lifecycle(session: &RelaySession, route_id: &str, want: Lifecycle) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while session.routes().lifecycle(route_id) != Some(want) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "route {} never reached {:?}",
            route_id,
            want
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Dials `127.0.0.1:<target_port>` for every inbound route
struct DialHandler;

#[async_trait]
impl InboundRouteHandler for DialHandler {
    async fn handle_route(&self, session: RelaySession, route: PendingRoute) {
        let route_id = route.route_id().to_string();
        match TcpStream::connect(("127.0.0.1", route.target_port())).await {
            Ok(stream) => {
                let _ = session.forward(route, stream).await;
            }
            Err(e) => {
                drop(route);
                let _ = session.reset_route(&route_id, &e.to_string()).await;
            }
        }
    }
}

/// Accepts connections and reports everything each one sent before EOF
async fn collecting_backend() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                if socket.read_to_end(&mut received).await.is_ok() {
                    let _ = tx.send(received);
                }
            });
        }
    });

    (port, rx)
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (session, _relay) = connected().await;

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);

    let err = session
        .send_traffic_data("r1", Bytes::from_static(b"late"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Closed));

    let err = session.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::Closed));
}

#[tokio::test]
async fn test_close_flushes_goodbye() {
    let (session, mut relay) = connected().await;

    session
        .send_traffic_data("r1", Bytes::from_static(b"queued"))
        .await
        .unwrap();
    session.close().await.unwrap();

    assert_eq!(recv(&mut relay).await, data("r1", b"queued"));
    assert!(matches!(
        recv(&mut relay).await,
        RelayFrame::Control(ControlMessage::Goodbye { .. })
    ));
    // Transport closed after the flush
    assert!(relay.source.recv_frame().await.unwrap().is_none());
}

#[tokio::test]
async fn test_stray_and_malformed_frames_are_tolerated() {
    let (session, mut relay) = connected().await;
    let cancel = CancellationToken::new();
    let runner = spawn_run(&session, &cancel);

    send(&mut relay, data("ghost-route", b"nobody home")).await;
    send(&mut relay, eof("ghost-route")).await;
    send_raw(&mut relay, vec![1, 3, 0xff, 0xff, 0xff, 0xff]).await;
    send_raw(&mut relay, vec![1, 0x7f, 0, 1]).await;
    send_raw(&mut relay, vec![9, 2, 0, 1, b'x']).await;
    send_raw(&mut relay, vec![1]).await;

    // The loop is still alive and answering
    send(
        &mut relay,
        RelayFrame::Control(ControlMessage::Ping { timestamp: 7 }),
    )
    .await;
    assert_eq!(
        recv(&mut relay).await,
        RelayFrame::Control(ControlMessage::Pong { timestamp: 7 })
    );

    let health = session.health();
    assert_eq!(health.state, SessionState::Running);
    assert!(health.frames_in >= 7);
    assert_eq!(health.active_routes, 0);

    cancel.cancel();
    assert!(matches!(
        runner.await.unwrap(),
        Err(SessionError::Cancelled)
    ));
}

#[tokio::test]
async fn test_run_resumes_after_cancel() {
    let (session, mut relay) = connected().await;

    let cancel = CancellationToken::new();
    let runner = spawn_run(&session, &cancel);
    tokio::task::yield_now().await;
    cancel.cancel();
    assert!(matches!(
        runner.await.unwrap(),
        Err(SessionError::Cancelled)
    ));
    assert_eq!(session.state(), SessionState::Registered);

    let cancel = CancellationToken::new();
    let runner = spawn_run(&session, &cancel);
    send(
        &mut relay,
        RelayFrame::Control(ControlMessage::Ping { timestamp: 1 }),
    )
    .await;
    assert_eq!(
        recv(&mut relay).await,
        RelayFrame::Control(ControlMessage::Pong { timestamp: 1 })
    );

    session.close().await.unwrap();
    assert!(runner.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_second_run_is_rejected() {
    let (session, _relay) = connected().await;
    let cancel = CancellationToken::new();
    let runner = spawn_run(&session, &cancel);

    let mut state = session.subscribe_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Running))
        .await
        .unwrap()
        .unwrap();

    let err = session.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyRunning));

    cancel.cancel();
    let _ = runner.await;
}

#[tokio::test]
async fn test_relay_disconnect_ends_run() {
    let (session, relay) = connected().await;
    let runner = spawn_run(&session, &CancellationToken::new());

    drop(relay);

    let err = runner.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::ConnectionLost(_)));
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.health().state, SessionState::Closed);

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_close_is_bounded_when_relay_stops_reading() {
    let (session, _relay) = stalled_relay().await;
    let queued = Arc::new(AtomicUsize::new(0));
    let flood = spawn_flood(&session, queued.clone());
    wait_until_blocked(&queued).await;
    assert!(!flood.is_finished());

    tokio::time::timeout(WAIT, session.close())
        .await
        .expect("close hung on a relay that stopped reading")
        .unwrap();
    assert_eq!(session.state(), SessionState::Closed);

    // The sender blocked on the full queue is released
    let err = tokio::time::timeout(WAIT, flood)
        .await
        .expect("sender still blocked after close")
        .unwrap();
    assert!(matches!(err, SessionError::Closed));
}

#[tokio::test]
async fn test_reader_keeps_delivering_with_full_write_queue() {
    let (session, mut relay) = stalled_relay().await;
    let mut inbound = session
        .routes()
        .insert(
            "r1",
            RouteInfo {
                direction: Direction::Inbound,
                target_port: 8080,
                protocol: RouteProtocol::Tcp,
            },
            CancellationToken::new(),
        )
        .unwrap();

    let queued = Arc::new(AtomicUsize::new(0));
    let flood = spawn_flood(&session, queued.clone());
    wait_until_blocked(&queued).await;

    let cancel = CancellationToken::new();
    let runner = spawn_run(&session, &cancel);

    // Each of these owes the relay a reply that cannot be written
    send(
        &mut relay,
        RelayFrame::Control(ControlMessage::Ping { timestamp: 3 }),
    )
    .await;
    send(&mut relay, setup("unhandled", 8080)).await;
    send(&mut relay, data("r1", b"still flowing")).await;

    let payload = tokio::time::timeout(WAIT, inbound.recv())
        .await
        .expect("reader stalled behind the write queue")
        .unwrap();
    assert_eq!(payload, "still flowing");
    wait_for_lifecycle(&session, "unhandled", Lifecycle::Closed).await;

    cancel.cancel();
    let result = tokio::time::timeout(WAIT, runner)
        .await
        .expect("run ignored cancellation")
        .unwrap();
    assert!(matches!(result, Err(SessionError::Cancelled)));

    tokio::time::timeout(WAIT, session.close())
        .await
        .expect("close hung")
        .unwrap();
    let _ = tokio::time::timeout(WAIT, flood).await;
}

#[tokio::test]
async fn test_goodbye_ends_run() {
    let (session, mut relay) = connected().await;
    let runner = spawn_run(&session, &CancellationToken::new());

    send(
        &mut relay,
        RelayFrame::Control(ControlMessage::Goodbye {
            reason: "maintenance".to_string(),
        }),
    )
    .await;

    let err = runner.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn test_unauthenticated_at_upgrade() {
    let connector = MemoryConnector::rejecting("token expired");

    let err = RelaySession::connect(config(), &connector)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Authentication(_)));
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(connector.requests().await.len(), 1);
}

#[tokio::test]
async fn test_unauthenticated_at_registration() {
    let (client, mut relay) = memory::pair();
    let connector = MemoryConnector::new(client);

    let relay_task = tokio::spawn(async move {
        assert!(matches!(
            recv(&mut relay).await,
            RelayFrame::Control(ControlMessage::Register { .. })
        ));
        send(
            &mut relay,
            RelayFrame::Control(ControlMessage::Rejected {
                reason: "invalid token".to_string(),
            }),
        )
        .await;
        relay
    });

    let err = RelaySession::connect(config(), &connector)
        .await
        .unwrap_err();
    let mut relay = relay_task.await.unwrap();

    assert_eq!(err.kind(), ErrorKind::Authentication);

    // Nothing but the registration was ever sent
    if let Ok(Ok(Some(bytes))) =
        tokio::time::timeout(Duration::from_millis(200), relay.source.recv_frame()).await
    {
        panic!(
            "Unexpected frame after rejection: {:?}",
            FrameCodec::decode(bytes)
        );
    }
}

#[tokio::test]
async fn test_route_without_handler_is_reset() {
    let (session, mut relay) = connected().await;
    let runner = spawn_run(&session, &CancellationToken::new());

    send(&mut relay, setup("r1", 8080)).await;

    match recv(&mut relay).await {
        RelayFrame::Control(ControlMessage::RouteReset { route_id, .. }) => {
            assert_eq!(route_id, "r1")
        }
        other => panic!("Expected RouteReset, got {:?}", other),
    }
    assert_eq!(session.routes().lifecycle("r1"), Some(Lifecycle::Closed));

    session.close().await.unwrap();
    assert!(runner.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_unreachable_local_target() {
    let (session, mut relay) = connected().await;
    session.set_inbound_handler(std::sync::Arc::new(DialHandler));
    let runner = spawn_run(&session, &CancellationToken::new());

    let dead_port = closed_port();
    send(&mut relay, setup("dead", dead_port)).await;
    send(&mut relay, data("dead", b"lost")).await;

    match recv(&mut relay).await {
        RelayFrame::Control(ControlMessage::RouteReset { route_id, .. }) => {
            assert_eq!(route_id, "dead")
        }
        other => panic!("Expected RouteReset, got {:?}", other),
    }
    assert_eq!(session.routes().lifecycle("dead"), Some(Lifecycle::Closed));

    // Other routes on the same session still work
    let (port, mut received) = collecting_backend().await;
    send(&mut relay, setup("live", port)).await;
    send(&mut relay, data("live", b"ping")).await;
    send(&mut relay, eof("live")).await;

    let got = tokio::time::timeout(WAIT, received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, b"ping");

    session.close().await.unwrap();
    assert!(runner.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_no_cross_route_leakage() {
    const ROUTES: usize = 8;
    const CHUNKS: usize = 20;

    let (session, mut relay) = connected().await;
    session.set_inbound_handler(std::sync::Arc::new(DialHandler));
    let runner = spawn_run(&session, &CancellationToken::new());
    let (port, mut received) = collecting_backend().await;

    let ids: Vec<String> = (0..ROUTES).map(|i| format!("route-{}", i)).collect();
    for id in &ids {
        send(&mut relay, setup(id, port)).await;
    }

    let mut expected: HashMap<String, Vec<u8>> = HashMap::new();
    for chunk in 0..CHUNKS {
        for id in &ids {
            let payload = format!("{}:{};", id, chunk);
            expected
                .entry(id.clone())
                .or_default()
                .extend_from_slice(payload.as_bytes());
            send(&mut relay, data(id, payload.as_bytes())).await;
        }
    }
    for id in &ids {
        send(&mut relay, eof(id)).await;
    }

    let mut got = Vec::new();
    for _ in 0..ROUTES {
        got.push(
            tokio::time::timeout(WAIT, received.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }

    let mut want: Vec<Vec<u8>> = expected.into_values().collect();
    want.sort();
    got.sort();
    assert_eq!(got, want);

    session.close().await.unwrap();
    let _ = runner.await;
}

#[tokio::test]
async fn test_concurrent_writes_stay_whole() {
    const WRITERS: usize = 16;
    const FRAMES: usize = 50;

    let (session, mut relay) = connected().await;

    let mut tasks = Vec::new();
    for writer in 0..WRITERS {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            let route_id = format!("w{}", writer);
            let payload = Bytes::from(vec![writer as u8; 1000 + writer]);
            for _ in 0..FRAMES {
                session
                    .send_traffic_data(&route_id, payload.clone())
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut per_route: HashMap<String, usize> = HashMap::new();
    for _ in 0..WRITERS * FRAMES {
        match recv(&mut relay).await {
            RelayFrame::TrafficData(data) => {
                let writer: usize = data.route_id[1..].parse().unwrap();
                assert_eq!(data.payload.len(), 1000 + writer);
                assert!(data.payload.iter().all(|b| *b == writer as u8));
                *per_route.entry(data.route_id).or_default() += 1;
            }
            other => panic!("Unexpected frame {:?}", other),
        }
    }

    assert_eq!(per_route.len(), WRITERS);
    assert!(per_route.values().all(|count| *count == FRAMES));
}

#[tokio::test]
async fn test_half_close_propagation() {
    let (session, mut relay) = connected().await;
    let runner = spawn_run(&session, &CancellationToken::new());
    let (app, bridged) = socket_pair().await;

    let pending = session
        .send_route_request(RouteRequest {
            org_id: None,
            target_device: "dev-b".to_string(),
            external_port: 18080,
            target_port: 8080,
            protocol: RouteProtocol::Tcp,
        })
        .await
        .unwrap();
    let route_id = pending.route_id().to_string();

    match recv(&mut relay).await {
        RelayFrame::RouteSetup(setup) => {
            assert_eq!(setup.route_id, route_id);
            assert_eq!(setup.source_device, "dev-a");
            assert_eq!(setup.target_device, "dev-b");
            assert_eq!(setup.org_id.as_deref(), Some("org-1"));
            assert_eq!(setup.target_port, 8080);
            assert_eq!(setup.external_port, 18080);
        }
        other => panic!("Expected RouteSetup, got {:?}", other),
    }

    // Remote data that arrives before the forwarder starts is buffered
    send(&mut relay, data(&route_id, b"hello")).await;
    send(&mut relay, eof(&route_id)).await;
    let forward = session.forward(pending, bridged);

    let (mut app_read, mut app_write) = app.into_split();
    let mut from_remote = Vec::new();
    tokio::time::timeout(WAIT, app_read.read_to_end(&mut from_remote))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from_remote, b"hello");
    wait_for_lifecycle(&session, &route_id, Lifecycle::HalfClosed).await;

    // The other direction keeps flowing after the remote half-close
    app_write.write_all(b"still here").await.unwrap();
    app_write.shutdown().await.unwrap();

    let mut to_remote = Vec::new();
    loop {
        match recv(&mut relay).await {
            RelayFrame::TrafficData(data) if data.route_id == route_id => {
                if data.is_end_of_stream() {
                    break;
                }
                to_remote.extend_from_slice(&data.payload);
            }
            other => panic!("Unexpected frame {:?}", other),
        }
    }
    assert_eq!(to_remote, b"still here");

    let stats = forward.await.unwrap().unwrap();
    assert_eq!(stats.bytes_to_local, 5);
    assert_eq!(stats.bytes_to_relay, 10);
    assert_eq!(session.routes().lifecycle(&route_id), Some(Lifecycle::Closed));

    session.close().await.unwrap();
    assert!(runner.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_relay_reset_tears_route_down() {
    let (session, mut relay) = connected().await;
    let runner = spawn_run(&session, &CancellationToken::new());
    let (mut app, bridged) = socket_pair().await;

    let pending = session
        .send_route_request(RouteRequest {
            org_id: None,
            target_device: "dev-b".to_string(),
            external_port: 8080,
            target_port: 8080,
            protocol: RouteProtocol::Tcp,
        })
        .await
        .unwrap();
    let route_id = pending.route_id().to_string();
    assert!(matches!(recv(&mut relay).await, RelayFrame::RouteSetup(_)));
    let forward = session.forward(pending, bridged);

    send(
        &mut relay,
        RelayFrame::Control(ControlMessage::RouteReset {
            route_id: route_id.clone(),
            reason: "peer gone".to_string(),
        }),
    )
    .await;

    // Local application observes the close
    let mut rest = Vec::new();
    tokio::time::timeout(WAIT, app.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());

    assert!(forward.await.unwrap().is_ok());
    assert_eq!(session.routes().lifecycle(&route_id), Some(Lifecycle::Closed));

    // Late traffic for the reset route is dropped quietly
    send(&mut relay, data(&route_id, b"late")).await;
    send(
        &mut relay,
        RelayFrame::Control(ControlMessage::Ping { timestamp: 3 }),
    )
    .await;
    loop {
        if let RelayFrame::Control(ControlMessage::Pong { timestamp }) = recv(&mut relay).await {
            assert_eq!(timestamp, 3);
            break;
        }
    }

    session.close().await.unwrap();
    assert!(runner.await.unwrap().is_ok());
}
