//! Connection Gateway (spec §4.1): terminates persistent bidirectional
//! client connections, decodes/encodes framed JSON messages, and writes
//! outbound envelopes through a bounded per-connection send queue.
//!
//! Grounded on the accept-loop / per-connection-task shape of
//! `signaling/websocket/server.rs`: one `tokio::spawn` per accepted
//! connection and a `broadcast` shutdown channel. Reads, queued-envelope
//! writes, and the idle ping/pong tick all live in a single `select!`
//! loop per connection, so a requested close is always visible to every
//! branch instead of being split across two tasks with no shared state.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::Error;
use crate::model::{ConnectionId, ExpiryReason, SessionId};
use crate::protocol::{Inbound, MessageClass, Outbound, Role};
use crate::registry::Registry;
use crate::router::MessageRouter;
use crate::sweeper::ExpiryNotifier;

/// Every `type` tag [`Inbound`] knows how to deserialize (spec §6.1
/// inbound table). Kept in sync by hand since `Inbound`'s `#[serde(tag =
/// "type")]` dispatch has no runtime-enumerable variant list.
const KNOWN_INBOUND_TYPES: &[&str] = &[
    "register",
    "transcription",
    "audio",
    "language.change",
    "ping",
    "student.ptt",
    "student.send",
];

/// Bounded, class-aware send queue (spec §4.1). Control envelopes
/// (`error`, `session.expired`, `pong`, `connection`, `register`) are
/// held on an always-accepted side queue; everything else is bounded at
/// `capacity` and evicts the oldest entry on overflow
/// (drop-oldest-non-critical).
struct SendQueue {
    control: Mutex<VecDeque<Outbound>>,
    droppable: Mutex<VecDeque<Outbound>>,
    capacity: usize,
    notify: Notify,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            control: Mutex::new(VecDeque::new()),
            droppable: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    fn push(&self, envelope: Outbound, connection_id: ConnectionId) {
        match envelope.class() {
            MessageClass::Control => {
                self.control.lock().push_back(envelope);
            }
            _ => {
                let mut queue = self.droppable.lock();
                if queue.len() >= self.capacity {
                    queue.pop_front();
                    warn!(%connection_id, "connection.backpressure: dropped oldest non-critical message");
                }
                queue.push_back(envelope);
            }
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Outbound {
        loop {
            if let Some(env) = self.control.lock().pop_front() {
                return env;
            }
            if let Some(env) = self.droppable.lock().pop_front() {
                return env;
            }
            self.notify.notified().await;
        }
    }
}

/// Per-connection runtime state shared between the connection's
/// `select!` loop and the rest of the coordinator.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    queue: SendQueue,
    should_close: AtomicBool,
    pub role: Mutex<Option<Role>>,
    pub session_id: Mutex<Option<SessionId>>,
    pub language: Mutex<String>,
    last_pong: Mutex<tokio::time::Instant>,
}

impl ConnectionHandle {
    fn new(id: ConnectionId, queue_capacity: usize) -> Self {
        Self {
            id,
            queue: SendQueue::new(queue_capacity),
            should_close: AtomicBool::new(false),
            role: Mutex::new(None),
            session_id: Mutex::new(None),
            language: Mutex::new(String::new()),
            last_pong: Mutex::new(tokio::time::Instant::now()),
        }
    }

    /// Enqueue an outbound envelope for delivery by this connection's
    /// writer task.
    pub fn send(&self, envelope: Outbound) {
        self.queue.push(envelope, self.id);
    }

    /// Request that the connection close after it has drained any
    /// already-queued control frames.
    pub fn request_close(&self) {
        self.should_close.store(true, Ordering::SeqCst);
        self.queue.notify.notify_one();
    }

    /// Dequeue the next outbound envelope, awaiting one if none is
    /// queued yet. The gateway's connection loop is the primary caller;
    /// exposed for harnesses that exercise the router/orchestrator
    /// without a live socket.
    pub async fn recv(&self) -> Outbound {
        self.queue.pop().await
    }

    /// Record that a WebSocket-level pong was just received, resetting
    /// the idle clock (spec §4.1 "Idle ping every 20s; pong required
    /// within 10s").
    fn note_pong(&self) {
        *self.last_pong.lock() = tokio::time::Instant::now();
    }

    /// Time elapsed since the last WebSocket-level pong, used by the
    /// gateway's idle-timeout check.
    fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Whether a close was requested and every already-queued envelope
    /// has been drained, so the gateway can close the socket without
    /// waiting on a [`SendQueue::pop`] that would otherwise never
    /// resolve for an empty queue.
    fn should_close_now(&self) -> bool {
        self.should_close.load(Ordering::SeqCst)
            && self.queue.control.lock().is_empty()
            && self.queue.droppable.lock().is_empty()
    }
}

/// Process-wide table of live connections (spec §5 "Cross-session
/// operations... use a short critical section").
#[derive(Default)]
pub struct ConnectionDirectory {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    queue_depth: usize,
}

impl ConnectionDirectory {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            connections: DashMap::new(),
            queue_depth,
        }
    }

    /// Register a new connection handle, ready to enqueue/dequeue
    /// envelopes. The live gateway calls this once per accepted socket;
    /// test harnesses that drive the router directly without a socket
    /// use it the same way.
    pub fn register(&self, id: ConnectionId) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new(id, self.queue_depth));
        self.connections.insert(id, handle.clone());
        handle
    }

    pub fn remove(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|e| e.clone())
    }

    /// Enqueue `envelope` for `id`. Returns `false` if there is no live
    /// connection for that id (spec §4.7 "skipped without affecting
    /// others").
    pub fn send_to(&self, id: ConnectionId, envelope: Outbound) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.send(envelope);
                true
            }
            None => false,
        }
    }

    pub fn close(&self, id: ConnectionId, reason: Outbound) {
        if let Some(handle) = self.get(id) {
            handle.send(reason);
            handle.request_close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Bridges the sweeper's expiry callback to live connections, closing
/// them with a `session.expired` envelope (spec §4.3).
pub struct GatewayExpiryNotifier {
    connections: Arc<ConnectionDirectory>,
}

impl GatewayExpiryNotifier {
    pub fn new(connections: Arc<ConnectionDirectory>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl ExpiryNotifier for GatewayExpiryNotifier {
    async fn notify_session_expired(
        &self,
        _session_id: SessionId,
        reason: ExpiryReason,
        teacher: Option<ConnectionId>,
        students: Vec<ConnectionId>,
    ) {
        let envelope = || Outbound::SessionExpired {
            reason: reason.into(),
        };
        if let Some(teacher_id) = teacher {
            self.connections.close(teacher_id, envelope());
        }
        for student_id in students {
            self.connections.close(student_id, envelope());
        }
    }
}

/// Accepts and terminates client WebSocket connections.
pub struct Gateway {
    config: Arc<RelayConfig>,
    connections: Arc<ConnectionDirectory>,
    router: Arc<MessageRouter>,
    registry: Arc<Registry>,
}

impl Gateway {
    pub fn new(
        config: Arc<RelayConfig>,
        connections: Arc<ConnectionDirectory>,
        router: Arc<MessageRouter>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            config,
            connections,
            router,
            registry,
        }
    }

    /// Run the accept loop until `shutdown` fires. Mirrors the
    /// teacher's `listener.accept()` / `broadcast` shutdown pairing.
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "gateway: listening for connections");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let gateway = Arc::clone(&self);
                            if gateway.connections.connection_count() >= gateway.config.max_connections {
                                warn!(%peer_addr, "gateway: connection rejected, at capacity");
                                tokio::spawn(async move {
                                    if let Err(err) = gateway.reject_at_capacity(stream, peer_addr).await {
                                        debug!(%peer_addr, %err, "gateway: capacity rejection handshake failed");
                                    }
                                });
                                continue;
                            }
                            tokio::spawn(async move {
                                if let Err(err) = gateway.handle_connection(stream, peer_addr).await {
                                    error!(%peer_addr, %err, "gateway: connection task ended with error");
                                }
                            });
                        }
                        Err(err) => {
                            error!(%err, "gateway: accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("gateway: shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Complete the WS handshake for a connection rejected at
    /// `max_connections` capacity so it still receives `error.capacity`
    /// before the socket closes (spec §5 "new client connects receive
    /// `error.capacity` and close").
    async fn reject_at_capacity(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|err| Error::InvalidFrame(err.to_string()))?;
        let (mut write, _read) = ws_stream.split();
        let envelope = Outbound::Error {
            code: Error::Capacity.error_code(),
            message: "server at capacity".into(),
            retry_after: None,
        };
        let text = serde_json::to_string(&envelope)?;
        let _ = write.send(Message::Text(text)).await;
        let _ = write.close().await;
        debug!(%peer_addr, "gateway: capacity rejection delivered");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|err| Error::InvalidFrame(err.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let connection_id = ConnectionId::new();
        let handle = self.connections.register(connection_id);
        info!(%connection_id, %peer_addr, "gateway: connection accepted");

        let ping_interval = self.config.ping_interval;
        let max_frame_bytes = self.config.max_frame_bytes;
        let mut ping_ticker = tokio::time::interval(ping_interval);
        ping_ticker.tick().await; // first tick fires immediately
        let mut reading = true;

        loop {
            tokio::select! {
                frame = read.next(), if reading => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > max_frame_bytes {
                                handle.send(Outbound::Error {
                                    code: Error::PayloadTooLarge.error_code(),
                                    message: "payload too large".into(),
                                    retry_after: None,
                                });
                                handle.request_close();
                                reading = false;
                            } else if !self.dispatch_inbound(&handle, &text).await {
                                reading = false;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            handle.note_pong();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            handle.request_close();
                            reading = false;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!(%connection_id, %err, "gateway: read error");
                            handle.request_close();
                            reading = false;
                        }
                    }
                }
                envelope = handle.queue.pop() => {
                    let is_close = handle.should_close.load(Ordering::SeqCst)
                        && handle.queue.control.lock().is_empty()
                        && handle.queue.droppable.lock().is_empty();
                    match serde_json::to_string(&envelope) {
                        Ok(text) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            error!(%err, "gateway: failed to encode outbound envelope");
                        }
                    }
                    if is_close {
                        let _ = write.close().await;
                        break;
                    }
                }
                _ = std::future::ready(()), if handle.should_close_now() => {
                    let _ = write.close().await;
                    break;
                }
                _ = ping_ticker.tick() => {
                    if handle.last_pong_elapsed() > self.config.pong_timeout + ping_interval {
                        warn!(%connection_id, "gateway: idle timeout");
                        handle.send(Outbound::Error {
                            code: Error::IdleTimeout.error_code(),
                            message: "idle timeout".into(),
                            retry_after: None,
                        });
                        handle.request_close();
                        reading = false;
                        continue;
                    }
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.on_connection_closed(&handle).await;
        self.connections.remove(connection_id);
        let _ = write.close().await;
        info!(%connection_id, "gateway: connection closed");
        Ok(())
    }

    /// Decode one inbound text frame, distinguishing an unrecognized
    /// `type` tag (spec §4.5 "Unknown types... `error.unknown_type`,
    /// connection kept open") from a structurally invalid envelope
    /// (`error.invalid_frame`, connection closed). Returns `false` if the
    /// caller should stop reading from this connection.
    async fn dispatch_inbound(&self, handle: &Arc<ConnectionHandle>, text: &str) -> bool {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => {
                if let Some(tag) = value.get("type").and_then(|t| t.as_str()) {
                    if !KNOWN_INBOUND_TYPES.contains(&tag) {
                        handle.send(Outbound::Error {
                            code: Error::UnknownType(tag.to_string()).error_code(),
                            message: format!("unknown message type: {tag}"),
                            retry_after: None,
                        });
                        return true;
                    }
                }
            }
            Err(err) => {
                debug!(%err, "gateway: frame is not valid JSON");
                handle.send(Outbound::Error {
                    code: Error::InvalidFrame(err.to_string()).error_code(),
                    message: "invalid frame".into(),
                    retry_after: None,
                });
                handle.request_close();
                return false;
            }
        }

        match serde_json::from_str::<Inbound>(text) {
            Ok(message) => {
                self.router.handle(handle, message).await;
                true
            }
            Err(err) => {
                debug!(%err, "gateway: invalid frame");
                handle.send(Outbound::Error {
                    code: Error::InvalidFrame(err.to_string()).error_code(),
                    message: "invalid frame".into(),
                    retry_after: None,
                });
                handle.request_close();
                false
            }
        }
    }

    /// Surface a disconnect to the Session Registry synchronously with
    /// respect to subsequent registry reads (spec §4.1 "Close events are
    /// surfaced to the Session Registry synchronously").
    async fn on_connection_closed(&self, handle: &ConnectionHandle) {
        let role = *handle.role.lock();
        let session_id = *handle.session_id.lock();
        let Some(session_id) = session_id else { return };
        match role {
            Some(Role::Teacher) => self.registry.teacher_disconnected(session_id).await,
            Some(Role::Student) => {
                self.registry
                    .student_disconnected(session_id, handle.id)
                    .await
            }
            None => {}
        }
    }
}
