//! Relay session
//!
//! One physical connection to the relay, shared by every route of a tunnel.
//!
//! ```text
//!  forwarders ──send_traffic_data──► writer queue ──► writer task ──► FrameSink
//!                                                                        │
//!  forwarders ◄── RouteTable ◄── dispatch ◄── run() read loop ◄── FrameSource
//! ```
//!
//! Writes are serialized through a single writer task, so frames from
//! concurrent routes never interleave. Exactly one `run` loop reads at a time
//! and never waits on a forwarder: inbound payloads go to per-route
//! unbounded queues. Replies the reader owes the relay (pongs, route resets)
//! are offered to the writer queue without waiting and dropped when it is
//! full.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;
use ztmesh_proto::{
    Capability, CodecError, ControlMessage, FrameCodec, RelayFrame, RouteId, RouteProtocol,
    RouteSetup, TrafficData, PROTOCOL_VERSION,
};
use ztmesh_transport::{
    ConnectRequest, FrameSink, FrameSource, RelayConnector, TransportError,
};

use crate::credentials::Credential;
use crate::error::ErrorKind;
use crate::forwarder::{ForwardStats, ForwarderError, RouteForwarder};
use crate::route_table::{Delivery, Direction, RouteInfo, RouteTable, RouteTableError};

/// Frames that may wait for the writer before senders are slowed down
const WRITE_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Relay connection lost: {0}")]
    ConnectionLost(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Route error: {0}")]
    Route(#[from] RouteTableError),

    #[error("Session is already running")]
    AlreadyRunning,

    #[error("Session is closed")]
    Closed,

    #[error("Session cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Authentication(_) => ErrorKind::Authentication,
            SessionError::Transport(_)
            | SessionError::ConnectionLost(_)
            | SessionError::Timeout(_)
            | SessionError::Closed
            | SessionError::Cancelled => ErrorKind::Transport,
            SessionError::Protocol(_) | SessionError::Codec(_) | SessionError::Route(_) => {
                ErrorKind::Protocol
            }
            SessionError::AlreadyRunning => ErrorKind::Application,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthenticationFailed(reason) => SessionError::Authentication(reason),
            TransportError::ConnectionClosed => {
                SessionError::ConnectionLost("connection closed".to_string())
            }
            other => SessionError::Transport(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Running,
    Closing,
    Closed,
}

/// Everything needed to open a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// e.g. `wss://relay.example/derp`
    pub endpoint: Url,
    pub device_id: String,
    pub credential: Credential,
    pub session_id: Option<String>,
    pub org_id: Option<String>,
    pub capabilities: Vec<Capability>,
    pub tls_insecure: bool,
    pub connect_timeout: Duration,
    pub register_timeout: Duration,
    /// Upper bound for flushing queued frames on close
    pub close_timeout: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: Url, device_id: impl Into<String>, credential: Credential) -> Self {
        Self {
            endpoint,
            device_id: device_id.into(),
            credential,
            session_id: None,
            org_id: None,
            capabilities: Capability::defaults(),
            tls_insecure: false,
            connect_timeout: Duration::from_secs(10),
            register_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_org_id(mut self, org_id: Option<String>) -> Self {
        self.org_id = org_id;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.tls_insecure = insecure;
        self
    }

    pub fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    fn connect_request(&self) -> ConnectRequest {
        let mut request = ConnectRequest::new(self.endpoint.clone())
            .with_header("Authorization", format!("Bearer {}", self.credential.token()))
            .with_header("X-Device-ID", self.device_id.clone())
            .with_insecure(self.tls_insecure)
            .with_timeout(self.connect_timeout);
        if let Some(session_id) = &self.session_id {
            request = request.with_header("X-Session-ID", session_id.clone());
        }
        if let Some(org_id) = &self.org_id {
            request = request.with_header("X-Org-ID", org_id.clone());
        }
        request
    }
}

/// Parameters for originating a route (connector role)
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Defaults to the session's organisation
    pub org_id: Option<String>,
    pub target_device: String,
    pub external_port: u16,
    pub target_port: u16,
    pub protocol: RouteProtocol,
}

/// Snapshot of session liveness and traffic counters
#[derive(Debug, Clone)]
pub struct SessionHealth {
    pub state: SessionState,
    pub relay_session_id: String,
    /// Time since the last frame was received
    pub idle: Duration,
    pub active_routes: usize,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Called for every RouteSetup received from the relay
#[async_trait]
pub trait InboundRouteHandler: Send + Sync {
    async fn handle_route(&self, session: RelaySession, route: PendingRoute);
}

/// A route registered in the table that has no forwarder yet.
///
/// Payloads that arrive for it are buffered. Dropping it without calling
/// [`RelaySession::forward`] or [`RelaySession::reset_route`] removes the
/// route from the table.
#[derive(Debug)]
pub struct PendingRoute {
    setup: RouteSetup,
    direction: Direction,
    inbound: Option<mpsc::UnboundedReceiver<Bytes>>,
    cancel: CancellationToken,
    routes: Arc<RouteTable>,
}

impl PendingRoute {
    pub fn route_id(&self) -> &str {
        &self.setup.route_id
    }

    pub fn setup(&self) -> &RouteSetup {
        &self.setup
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn target_port(&self) -> u16 {
        self.setup.target_port
    }

    /// Token cancelled when the route is reset or the session closes
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound.take()
    }
}

impl Drop for PendingRoute {
    fn drop(&mut self) {
        if self.inbound.is_some() && self.routes.remove(&self.setup.route_id) {
            debug!(route_id = %self.setup.route_id, "Pending route dropped without a forwarder");
        }
    }
}

enum WriterCommand {
    Frame(Bytes),
    Close(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

struct SessionInner {
    device_id: String,
    org_id: Option<String>,
    relay_session_id: String,
    close_timeout: Duration,
    routes: Arc<RouteTable>,
    writer_tx: mpsc::Sender<WriterCommand>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    /// Cancelled by the writer when the transport rejects a write
    writer_failed: CancellationToken,
    /// Cancelled by `close()`; stops the read loop
    shutdown: CancellationToken,
    /// Parent of every route's cancellation token
    route_cancel: CancellationToken,
    source: tokio::sync::Mutex<Option<Box<dyn FrameSource>>>,
    running: AtomicBool,
    closing: AtomicBool,
    state: watch::Sender<SessionState>,
    handler: RwLock<Option<Arc<dyn InboundRouteHandler>>>,
    last_activity: Mutex<Instant>,
    counters: Arc<Counters>,
}

/// Handle to a registered relay session. Cheap to clone.
#[derive(Clone)]
pub struct RelaySession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("device_id", &self.inner.device_id)
            .field("relay_session_id", &self.inner.relay_session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl RelaySession {
    /// Dial the relay, register this device and wait for acceptance.
    ///
    /// Authentication failures are returned as-is and never retried.
    pub async fn connect(
        config: SessionConfig,
        connector: &dyn RelayConnector,
    ) -> Result<Self, SessionError> {
        let (state, _) = watch::channel(SessionState::Connecting);

        info!(
            "Connecting to relay {} via {} ({})",
            config.endpoint,
            connector.name(),
            config.credential.describe()
        );

        let (sink, mut source) = connector.connect(&config.connect_request()).await?;

        let counters = Arc::new(Counters::default());
        let writer_failed = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let writer_task = tokio::spawn(writer_loop(
            sink,
            writer_rx,
            writer_failed.clone(),
            counters.clone(),
        ));

        let register = RelayFrame::Control(ControlMessage::Register {
            protocol_version: PROTOCOL_VERSION,
            device_id: config.device_id.clone(),
            capabilities: config.capabilities.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        let registration = async {
            enqueue(&writer_tx, FrameCodec::encode(&register)?).await?;
            await_registration(&mut source, &writer_tx).await
        };

        let relay_session_id =
            match tokio::time::timeout(config.register_timeout, registration).await {
                Ok(Ok(id)) => id,
                Ok(Err(e)) => {
                    writer_task.abort();
                    return Err(e);
                }
                Err(_) => {
                    writer_task.abort();
                    return Err(SessionError::Timeout(format!(
                        "relay did not confirm registration within {}s",
                        config.register_timeout.as_secs()
                    )));
                }
            };

        info!(
            "✅ Registered with relay (session {}, device {})",
            relay_session_id, config.device_id
        );
        state.send_replace(SessionState::Registered);

        Ok(Self {
            inner: Arc::new(SessionInner {
                device_id: config.device_id,
                org_id: config.org_id,
                relay_session_id,
                close_timeout: config.close_timeout,
                routes: Arc::new(RouteTable::new()),
                writer_tx,
                writer_task: Mutex::new(Some(writer_task)),
                writer_failed,
                shutdown: CancellationToken::new(),
                route_cancel: CancellationToken::new(),
                source: tokio::sync::Mutex::new(Some(source)),
                running: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                state,
                handler: RwLock::new(None),
                last_activity: Mutex::new(Instant::now()),
                counters,
            }),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Session id assigned by the relay at registration
    pub fn relay_session_id(&self) -> &str {
        &self.inner.relay_session_id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.inner.routes
    }

    pub fn set_inbound_handler(&self, handler: Arc<dyn InboundRouteHandler>) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn health(&self) -> SessionHealth {
        let idle = self
            .inner
            .last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let counters = &self.inner.counters;
        SessionHealth {
            state: self.state(),
            relay_session_id: self.inner.relay_session_id.clone(),
            idle,
            active_routes: self.inner.routes.len(),
            frames_in: counters.frames_in.load(Ordering::Relaxed),
            frames_out: counters.frames_out.load(Ordering::Relaxed),
            bytes_in: counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: counters.bytes_out.load(Ordering::Relaxed),
        }
    }

    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Read frames until `cancel` fires, the session is closed or the relay
    /// connection fails.
    ///
    /// Cancellation leaves the session registered; `run` may be called again
    /// to resume reading.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SessionError> {
        if self.is_closing() {
            return Err(SessionError::Closed);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyRunning);
        }

        let mut source = match self.inner.source.lock().await.take() {
            Some(source) => source,
            None => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(SessionError::Closed);
            }
        };

        self.inner.state.send_replace(SessionState::Running);
        debug!("Relay read loop started");

        let result = loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break Ok(()),
                _ = cancel.cancelled() => break Err(SessionError::Cancelled),
                _ = self.inner.writer_failed.cancelled() => {
                    break Err(SessionError::ConnectionLost("relay write failed".to_string()));
                }
                frame = source.recv_frame() => match frame {
                    Ok(Some(bytes)) => {
                        if let Err(e) = self.dispatch(bytes).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => {
                        break Err(SessionError::ConnectionLost(
                            "relay closed the connection".to_string(),
                        ));
                    }
                    Err(e) => break Err(SessionError::from(e)),
                },
            }
        };

        match &result {
            Err(SessionError::Cancelled) => {
                // Keep the connection so a later run can resume
                *self.inner.source.lock().await = Some(source);
                if !self.is_closing() {
                    self.inner.state.send_replace(SessionState::Registered);
                }
                debug!("Relay read loop cancelled");
            }
            Ok(()) => debug!("Relay read loop stopped by close"),
            Err(e) => {
                error!("Relay session failed: {}", e);
                // Nothing can flow any more; release the forwarders
                self.inner.route_cancel.cancel();
                self.inner.state.send_replace(SessionState::Closed);
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        result
    }

    async fn dispatch(&self, bytes: Bytes) -> Result<(), SessionError> {
        let counters = &self.inner.counters;
        counters.frames_in.fetch_add(1, Ordering::Relaxed);
        counters
            .bytes_in
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        if let Ok(mut last) = self.inner.last_activity.lock() {
            *last = Instant::now();
        }

        let frame = match FrameCodec::decode(bytes) {
            Ok(frame) => frame,
            Err(e) if e.is_ignorable() => {
                debug!("Ignoring frame: {}", e);
                return Ok(());
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return Ok(());
            }
        };

        match frame {
            RelayFrame::TrafficData(data) => {
                let route_id = data.route_id;
                match self.inner.routes.deliver(&route_id, data.payload) {
                    Delivery::Delivered => {}
                    Delivery::Retired => trace!(route_id = %route_id, "Frame for closed route dropped"),
                    Delivery::Unknown => trace!(route_id = %route_id, "Frame for unknown route dropped"),
                }
                Ok(())
            }
            RelayFrame::RouteSetup(setup) => {
                self.accept_route(setup).await;
                Ok(())
            }
            RelayFrame::Control(msg) => self.handle_control(msg).await,
        }
    }

    /// Route reset issued by the read loop, which must not wait on the writer
    fn reset_from_reader(&self, route_id: &str, reason: &str) {
        self.inner.routes.cancel(route_id);
        self.inner.routes.remove(route_id);

        let reset = RelayFrame::Control(ControlMessage::RouteReset {
            route_id: route_id.to_string(),
            reason: reason.to_string(),
        });
        match FrameCodec::encode(&reset) {
            Ok(frame) => try_enqueue(&self.inner.writer_tx, frame, "route reset"),
            Err(e) => warn!(route_id = %route_id, "Failed to encode route reset: {}", e),
        }
    }

    async fn accept_route(&self, setup: RouteSetup) {
        let route_id = setup.route_id.clone();
        debug!(
            route_id = %route_id,
            source_device = %setup.source_device,
            target_port = setup.target_port,
            "Received route setup"
        );

        if self.is_closing() {
            self.reset_from_reader(&route_id, "session closing");
            return;
        }

        let cancel = self.inner.route_cancel.child_token();
        let info = RouteInfo {
            direction: Direction::Inbound,
            target_port: setup.target_port,
            protocol: setup.protocol,
        };
        let inbound = match self.inner.routes.insert(route_id.clone(), info, cancel.clone()) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(route_id = %route_id, "Ignoring route setup: {}", e);
                return;
            }
        };

        let pending = PendingRoute {
            setup,
            direction: Direction::Inbound,
            inbound: Some(inbound),
            cancel,
            routes: self.inner.routes.clone(),
        };

        let handler = self
            .inner
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => {
                let session = self.clone();
                tokio::spawn(async move {
                    handler.handle_route(session, pending).await;
                });
            }
            None => {
                warn!(route_id = %route_id, "No inbound route handler, resetting route");
                drop(pending);
                self.reset_from_reader(&route_id, "inbound routes not accepted");
            }
        }
    }

    async fn handle_control(&self, msg: ControlMessage) -> Result<(), SessionError> {
        match msg {
            ControlMessage::Ping { timestamp } => {
                trace!("Relay ping {}", timestamp);
                let pong = RelayFrame::Control(ControlMessage::Pong { timestamp });
                if !self.is_closing() {
                    try_enqueue(&self.inner.writer_tx, FrameCodec::encode(&pong)?, "pong");
                }
                Ok(())
            }
            ControlMessage::Pong { timestamp } => {
                trace!("Relay pong {}", timestamp);
                Ok(())
            }
            ControlMessage::Error { code, message } => {
                warn!("Relay reported error {}: {}", code, message);
                Ok(())
            }
            ControlMessage::RouteReset { route_id, reason } => {
                debug!(route_id = %route_id, "Relay reset route: {}", reason);
                self.inner.routes.cancel(&route_id);
                self.inner.routes.remove(&route_id);
                Ok(())
            }
            ControlMessage::Goodbye { reason } => {
                info!("Relay is closing the session: {}", reason);
                Err(SessionError::ConnectionLost(format!(
                    "relay said goodbye: {}",
                    reason
                )))
            }
            ControlMessage::Rejected { reason } => Err(SessionError::Authentication(reason)),
            ControlMessage::Registered { .. } | ControlMessage::Register { .. } => {
                debug!("Ignoring unexpected registration frame");
                Ok(())
            }
        }
    }

    async fn send_frame(&self, frame: &RelayFrame) -> Result<(), SessionError> {
        if self.is_closing() {
            return Err(SessionError::Closed);
        }
        enqueue(&self.inner.writer_tx, FrameCodec::encode(frame)?).await
    }

    /// Originate a route to a remote device.
    ///
    /// Returns once the RouteSetup is queued for writing; the route becomes
    /// established when traffic starts flowing.
    pub async fn send_route_request(&self, req: RouteRequest) -> Result<PendingRoute, SessionError> {
        if self.is_closing() {
            return Err(SessionError::Closed);
        }

        let route_id: RouteId = uuid::Uuid::new_v4().to_string();
        let cancel = self.inner.route_cancel.child_token();
        let inbound = self.inner.routes.insert(
            route_id.clone(),
            RouteInfo {
                direction: Direction::Outbound,
                target_port: req.target_port,
                protocol: req.protocol,
            },
            cancel.clone(),
        )?;

        let setup = RouteSetup {
            route_id,
            org_id: req.org_id.or_else(|| self.inner.org_id.clone()),
            source_device: self.inner.device_id.clone(),
            target_device: req.target_device,
            external_port: req.external_port,
            target_port: req.target_port,
            protocol: req.protocol,
        };

        // Created before the write so a failed write tears the route down
        let pending = PendingRoute {
            setup,
            direction: Direction::Outbound,
            inbound: Some(inbound),
            cancel,
            routes: self.inner.routes.clone(),
        };

        self.send_frame(&RelayFrame::RouteSetup(pending.setup.clone()))
            .await?;

        debug!(
            route_id = %pending.route_id(),
            target_device = %pending.setup.target_device,
            target_port = pending.setup.target_port,
            "Sent route setup"
        );
        Ok(pending)
    }

    /// Write one TrafficData frame. An empty payload signals end of stream.
    pub async fn send_traffic_data(&self, route_id: &str, payload: Bytes) -> Result<(), SessionError> {
        self.send_frame(&RelayFrame::TrafficData(TrafficData::new(route_id, payload)))
            .await
    }

    /// Bridge a pending route to a local socket on its own task
    pub fn forward(
        &self,
        mut pending: PendingRoute,
        stream: TcpStream,
    ) -> JoinHandle<Result<ForwardStats, ForwarderError>> {
        let forwarder = pending.take_inbound().map(|inbound| {
            RouteForwarder::new(
                self.clone(),
                pending.setup.route_id.clone(),
                stream,
                inbound,
                pending.cancel.clone(),
            )
        });

        tokio::spawn(async move {
            match forwarder {
                Some(forwarder) => forwarder.run().await,
                None => Err(ForwarderError::RouteClosed),
            }
        })
    }

    /// Tear a route down locally and tell the relay it cannot continue
    pub async fn reset_route(&self, route_id: &str, reason: &str) -> Result<(), SessionError> {
        self.inner.routes.cancel(route_id);
        self.inner.routes.remove(route_id);

        let reset = RelayFrame::Control(ControlMessage::RouteReset {
            route_id: route_id.to_string(),
            reason: reason.to_string(),
        });
        enqueue(&self.inner.writer_tx, FrameCodec::encode(&reset)?).await
    }

    /// Send a keepalive ping to the relay
    pub async fn ping(&self) -> Result<(), SessionError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.send_frame(&RelayFrame::Control(ControlMessage::Ping { timestamp }))
            .await
    }

    /// Shut the session down: stop accepting routes, cancel forwarders,
    /// flush queued frames and close the transport. Idempotent.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing relay session {}", self.inner.relay_session_id);
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closing;
            true
        });
        self.inner.shutdown.cancel();

        for (route_id, cancel) in self.inner.routes.drain() {
            trace!(route_id = %route_id, "Cancelling route");
            cancel.cancel();
        }
        self.inner.route_cancel.cancel();

        let goodbye = RelayFrame::Control(ControlMessage::Goodbye {
            reason: "client closing".to_string(),
        });
        if let Ok(frame) = FrameCodec::encode(&goodbye) {
            try_enqueue(&self.inner.writer_tx, frame, "goodbye");
        }

        // Everything queued before the close command is written first
        let writer_tx = self.inner.writer_tx.clone();
        let flush = async move {
            let (done_tx, done_rx) = oneshot::channel();
            if writer_tx.send(WriterCommand::Close(done_tx)).await.is_err() {
                // Writer already gone
                return;
            }
            let _ = done_rx.await;
        };
        let flushed = tokio::time::timeout(self.inner.close_timeout, flush)
            .await
            .is_ok();

        let writer_task = self
            .inner
            .writer_task
            .lock()
            .ok()
            .and_then(|mut task| task.take());
        if let Some(task) = writer_task {
            if !flushed {
                // Dropping the queue fails every sender still waiting on it
                warn!("Relay writer did not flush in time, aborting");
                task.abort();
            }
        }

        // Drop the read half if no run loop holds it
        self.inner.source.lock().await.take();

        self.inner.state.send_replace(SessionState::Closed);
        Ok(())
    }
}

async fn enqueue(tx: &mpsc::Sender<WriterCommand>, frame: Bytes) -> Result<(), SessionError> {
    tx.send(WriterCommand::Frame(frame))
        .await
        .map_err(|_| SessionError::Closed)
}

/// Queue a frame without waiting. A full queue drops it.
fn try_enqueue(tx: &mpsc::Sender<WriterCommand>, frame: Bytes, what: &str) {
    match tx.try_send(WriterCommand::Frame(frame)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Relay write queue full, dropping {}", what);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Relay writer stopped, dropping {}", what);
        }
    }
}

async fn await_registration(
    source: &mut Box<dyn FrameSource>,
    writer_tx: &mpsc::Sender<WriterCommand>,
) -> Result<String, SessionError> {
    loop {
        let bytes = source.recv_frame().await?.ok_or_else(|| {
            SessionError::ConnectionLost("relay closed the connection during registration".to_string())
        })?;

        let frame = match FrameCodec::decode(bytes) {
            Ok(frame) => frame,
            Err(e) if e.is_ignorable() => {
                debug!("Ignoring frame during registration: {}", e);
                continue;
            }
            Err(e) => return Err(SessionError::Codec(e)),
        };

        match frame {
            RelayFrame::Control(ControlMessage::Registered { session_id }) => return Ok(session_id),
            RelayFrame::Control(ControlMessage::Rejected { reason }) => {
                error!("❌ Relay rejected registration: {}", reason);
                return Err(SessionError::Authentication(reason));
            }
            RelayFrame::Control(ControlMessage::Error { code, message }) => {
                return Err(match code {
                    401 | 403 => SessionError::Authentication(message),
                    _ => SessionError::Protocol(format!("relay error {}: {}", code, message)),
                });
            }
            RelayFrame::Control(ControlMessage::Ping { timestamp }) => {
                let pong = RelayFrame::Control(ControlMessage::Pong { timestamp });
                enqueue(writer_tx, FrameCodec::encode(&pong)?).await?;
            }
            other => debug!("Ignoring {:?} frame before registration", other.kind()),
        }
    }
}

async fn writer_loop(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<WriterCommand>,
    failed: CancellationToken,
    counters: Arc<Counters>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Frame(frame) => {
                let len = frame.len() as u64;
                if let Err(e) = sink.send_frame(frame).await {
                    error!("Failed to write to relay: {}", e);
                    failed.cancel();
                    break;
                }
                counters.frames_out.fetch_add(1, Ordering::Relaxed);
                counters.bytes_out.fetch_add(len, Ordering::Relaxed);
            }
            WriterCommand::Close(done) => {
                if let Err(e) = sink.close().await {
                    debug!("Error closing relay transport: {}", e);
                }
                let _ = done.send(());
                return;
            }
        }
    }

    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ztmesh_transport::memory::{self, MemoryEndpoint};
    use ztmesh_transport::MemoryConnector;

    fn config() -> SessionConfig {
        SessionConfig::new(
            Url::parse("ws://relay.test/derp").unwrap(),
            "dev-a",
            Credential::SessionToken("tok".to_string()),
        )
        .with_session_id(Some("sess-1".to_string()))
        .with_org_id(Some("org-1".to_string()))
    }

    async fn expect_register(relay: &mut MemoryEndpoint) -> String {
        let bytes = relay.source.recv_frame().await.unwrap().unwrap();
        match FrameCodec::decode(bytes).unwrap() {
            RelayFrame::Control(ControlMessage::Register {
                device_id,
                protocol_version,
                capabilities,
                ..
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(capabilities, Capability::defaults());
                device_id
            }
            other => panic!("Expected Register, got {:?}", other),
        }
    }

    async fn reply(relay: &mut MemoryEndpoint, msg: ControlMessage) {
        let frame = FrameCodec::encode(&RelayFrame::Control(msg)).unwrap();
        relay.sink.send_frame(frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_sends_headers_and_registers() {
        let (client, mut relay) = memory::pair();
        let connector = MemoryConnector::new(client);

        let relay_task = tokio::spawn(async move {
            let device = expect_register(&mut relay).await;
            reply(
                &mut relay,
                ControlMessage::Registered {
                    session_id: format!("relay-{}", device),
                },
            )
            .await;
            relay
        });

        let session = RelaySession::connect(config(), &connector).await.unwrap();
        let _relay = relay_task.await.unwrap();

        assert_eq!(session.relay_session_id(), "relay-dev-a");
        assert_eq!(session.state(), SessionState::Registered);

        let requests = connector.requests().await;
        assert_eq!(requests[0].header("Authorization"), Some("Bearer tok"));
        assert_eq!(requests[0].header("X-Session-ID"), Some("sess-1"));
        assert_eq!(requests[0].header("X-Org-ID"), Some("org-1"));
        assert_eq!(requests[0].header("X-Device-ID"), Some("dev-a"));
    }

    #[tokio::test]
    async fn test_answers_ping_during_registration() {
        let (client, mut relay) = memory::pair();
        let connector = MemoryConnector::new(client);

        let relay_task = tokio::spawn(async move {
            expect_register(&mut relay).await;
            reply(&mut relay, ControlMessage::Ping { timestamp: 42 }).await;
            let pong = relay.source.recv_frame().await.unwrap().unwrap();
            assert_eq!(
                FrameCodec::decode(pong).unwrap(),
                RelayFrame::Control(ControlMessage::Pong { timestamp: 42 })
            );
            reply(
                &mut relay,
                ControlMessage::Registered {
                    session_id: "s".to_string(),
                },
            )
            .await;
            relay
        });

        let session = RelaySession::connect(config(), &connector).await.unwrap();
        let _relay = relay_task.await.unwrap();
        assert_eq!(session.relay_session_id(), "s");
    }

    #[tokio::test]
    async fn test_registration_timeout() {
        let (client, _relay) = memory::pair();
        let connector = MemoryConnector::new(client);

        let err = RelaySession::connect(
            config().with_register_timeout(Duration::from_millis(50)),
            &connector,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SessionError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_transport_auth_maps_to_authentication() {
        let err = SessionError::from(TransportError::AuthenticationFailed("expired".to_string()));
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let err = SessionError::from(TransportError::ConnectionClosed);
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
