//! WebSocket relay with room-based position routing.
//!
//! Architecture:
//! ```text
//! Session A ──┐                         ┌──► Session A (minus own events)
//!             ├── Room ("r1") ── BroadcastGroup
//! Session B ──┘      │                  └──► Session B
//!                    └── last position per member (late-joiner catch-up)
//! ```
//!
//! The relay is authoritative for colors: every member gets a color that is
//! unique within its room, and positions are re-stamped with it before
//! fan-out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

use crate::broadcast::{Membership, RoomManager};
use crate::compression::Compression;
use crate::error::EngineError;
use crate::protocol::{
    JoinAccepted, JoinRequest, MessageType, RejectReason, WireMessage, MAX_ROOM_NAME_LEN,
    PROTOCOL_VERSION,
};
use crate::transport::{self, ServerTls, WsStream};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Close connections that send nothing for this long
    pub idle_timeout: Duration,
    /// Bound on TLS + WebSocket accept, and on the wait for the first `Join`
    pub handshake_timeout: Duration,
    /// Whether clients may negotiate compressed position payloads
    pub allow_compression: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4444".to_string(),
            max_peers_per_room: 64,
            broadcast_capacity: 256,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            allow_compression: true,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_joins: u64,
    pub rejected_joins: u64,
    pub total_messages: u64,
    pub malformed_frames: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_joins: AtomicU64,
    rejected_joins: AtomicU64,
    total_messages: AtomicU64,
    malformed_frames: AtomicU64,
    active_rooms: AtomicUsize,
}

struct Inner {
    config: ServerConfig,
    tls: Option<ServerTls>,
    rooms: RoomManager,
    counters: Counters,
    next_conn_id: AtomicU64,
}

/// The relay server. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
}

impl RelayServer {
    /// Plain-TCP relay.
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, None)
    }

    /// Relay that requires mutual TLS on every connection.
    pub fn with_tls(config: ServerConfig, tls: ServerTls) -> Self {
        Self::build(config, Some(tls))
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    fn build(config: ServerConfig, tls: Option<ServerTls>) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity, config.max_peers_per_room);
        Self {
            inner: Arc::new(Inner {
                config,
                tls,
                rooms,
                counters: Counters::default(),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Bind the listener. Binding to port 0 picks a free port, see
    /// [`BoundRelay::local_addr`].
    pub async fn bind(&self) -> std::io::Result<BoundRelay> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        Ok(BoundRelay {
            listener,
            server: self.clone(),
        })
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        self.bind().await?.run().await
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let c = &self.inner.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            total_joins: c.total_joins.load(Ordering::Relaxed),
            rejected_joins: c.rejected_joins.load(Ordering::Relaxed),
            total_messages: c.total_messages.load(Ordering::Relaxed),
            malformed_frames: c.malformed_frames.load(Ordering::Relaxed),
            active_rooms: c.active_rooms.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn is_secure(&self) -> bool {
        self.inner.tls.is_some()
    }

    /// Get room manager reference.
    pub fn room_manager(&self) -> &RoomManager {
        &self.inner.rooms
    }
}

/// A relay with its listener bound.
pub struct BoundRelay {
    listener: TcpListener,
    server: RelayServer,
}

impl BoundRelay {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn server(&self) -> &RelayServer {
        &self.server
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> std::io::Result<()> {
        log::info!(
            "Relay listening on {} (tls: {})",
            self.listener.local_addr()?,
            self.server.is_secure()
        );

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let inner = self.server.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(inner, stream, addr).await {
                    log::debug!("Connection from {addr} ended: {e}");
                }
            });
        }
    }
}

/// Normalize and check a join request. Returns the room key on success.
pub fn validate_join(request: &JoinRequest) -> Result<String, RejectReason> {
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(RejectReason::UnsupportedVersion {
            server_version: PROTOCOL_VERSION,
        });
    }
    let room = request.room.trim().to_lowercase();
    if room.is_empty() || room.len() > MAX_ROOM_NAME_LEN {
        return Err(RejectReason::InvalidRoom);
    }
    Ok(room)
}

type Sink = SplitSink<WsStream, Message>;

async fn send<S>(sink: &mut S, msg: &WireMessage) -> Result<(), EngineError>
where
    S: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

/// Like [`send`], but gives up after `limit`.
///
/// Returns `Ok(false)` if the peer stopped reading and the write stalled.
async fn send_within<S>(sink: &mut S, msg: &WireMessage, limit: Duration) -> Result<bool, EngineError>
where
    S: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    match timeout(limit, send(sink, msg)).await {
        Ok(sent) => sent.map(|()| true),
        Err(_) => Ok(false),
    }
}

/// Next binary frame. `None` once the peer closed or the socket failed.
async fn next_binary(stream: &mut SplitStream<WsStream>) -> Option<Vec<u8>> {
    loop {
        match stream.next().await? {
            Ok(Message::Binary(data)) => return Some(data.into()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn handle_connection(
    inner: Arc<Inner>,
    tcp: TcpStream,
    addr: SocketAddr,
) -> Result<(), EngineError> {
    let ws = transport::accept(tcp, inner.tls.as_ref(), inner.config.handshake_timeout).await?;
    log::debug!("WebSocket connection established from {addr}");

    let counters = &inner.counters;
    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let result = serve(&inner, ws, addr).await;

    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn reject(inner: &Inner, sink: &mut Sink, reason: RejectReason) -> Result<(), EngineError> {
    inner.counters.rejected_joins.fetch_add(1, Ordering::Relaxed);
    send(sink, &WireMessage::join_rejected(&reason)?).await?;
    let _ = sink.close().await;
    Ok(())
}

async fn serve(inner: &Inner, ws: WsStream, addr: SocketAddr) -> Result<(), EngineError> {
    let config = &inner.config;
    let counters = &inner.counters;
    let (mut sink, mut stream) = ws.split();

    let first = match timeout(config.handshake_timeout, next_binary(&mut stream)).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(()),
        Err(_) => {
            log::debug!("No join from {addr} within {:?}", config.handshake_timeout);
            let _ = sink.close().await;
            return Ok(());
        }
    };
    counters.total_messages.fetch_add(1, Ordering::Relaxed);

    let (peer_id, request) = match WireMessage::decode(&first).and_then(|m| {
        let request = m.join_request()?;
        Ok((m.peer_id, request))
    }) {
        Ok(join) => join,
        Err(e) => {
            counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
            log::warn!("Expected a join from {addr}: {e}");
            let _ = sink.close().await;
            return Ok(());
        }
    };

    let room = match validate_join(&request) {
        Ok(room) => room,
        Err(reason) => {
            log::info!("Rejected join from {peer_id} ({addr}): {reason}");
            return reject(inner, &mut sink, reason).await;
        }
    };

    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let membership = match inner.rooms.join(&room, peer_id, conn_id, request.color).await {
        Ok(membership) => membership,
        Err(reason) => {
            log::info!("Rejected join from {peer_id} to room {room:?}: {reason}");
            return reject(inner, &mut sink, reason).await;
        }
    };
    counters.total_joins.fetch_add(1, Ordering::Relaxed);
    counters
        .active_rooms
        .store(inner.rooms.room_count().await, Ordering::Relaxed);

    let compression = request.compression.negotiate(config.allow_compression);
    log::info!(
        "Peer {peer_id} joined room {room:?} (color {:06x}, compression {compression:?})",
        membership.color
    );

    let result = relay(
        inner,
        &mut sink,
        &mut stream,
        peer_id,
        conn_id,
        &room,
        compression,
        membership,
    )
    .await;

    inner.rooms.leave(&room, peer_id, conn_id).await;
    counters
        .active_rooms
        .store(inner.rooms.room_count().await, Ordering::Relaxed);
    let _ = sink.close().await;
    log::info!("Peer {peer_id} left room {room:?}");
    result
}

/// Forward traffic for one joined member until it leaves or goes idle.
#[allow(clippy::too_many_arguments)]
async fn relay(
    inner: &Inner,
    sink: &mut Sink,
    stream: &mut SplitStream<WsStream>,
    peer_id: Uuid,
    conn_id: u64,
    room: &str,
    compression: Compression,
    membership: Membership,
) -> Result<(), EngineError> {
    let counters = &inner.counters;
    let idle = inner.config.idle_timeout;
    let Membership {
        color,
        mut receiver,
        group,
        catch_up,
    } = membership;

    send(sink, &WireMessage::join_accepted(&JoinAccepted { color, compression })?).await?;
    for event in &catch_up {
        send(sink, &event.to_wire(compression)?).await?;
    }

    let mut deadline = Instant::now() + idle;
    loop {
        tokio::select! {
            frame = stream.next() => {
                let data = match frame {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        deadline = Instant::now() + idle;
                        continue;
                    }
                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {peer_id}: {e}");
                        break;
                    }
                };
                deadline = Instant::now() + idle;
                counters.total_messages.fetch_add(1, Ordering::Relaxed);

                let msg = match WireMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Malformed frame from {peer_id}: {e}");
                        continue;
                    }
                };

                match msg.msg_type {
                    MessageType::Position => {
                        let report = match msg.position_report(compression) {
                            Ok(report) => report,
                            Err(e) => {
                                counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Malformed position from {peer_id}: {e}");
                                continue;
                            }
                        };
                        log::trace!("Position from {peer_id}: ({}, {})", report.x, report.y);
                        let published = inner
                            .rooms
                            .publish_position(room, peer_id, conn_id, msg.seq, report)
                            .await;
                        if published.is_none() {
                            log::debug!("Connection for {peer_id} was superseded by a re-join");
                            break;
                        }
                    }
                    MessageType::Ping => {
                        send(sink, &WireMessage::pong(Uuid::nil())).await?;
                    }
                    MessageType::Join => {
                        counters.rejected_joins.fetch_add(1, Ordering::Relaxed);
                        send(sink, &WireMessage::join_rejected(&RejectReason::AlreadyJoined)?).await?;
                    }
                    other => {
                        log::debug!("Ignoring {other:?} from {peer_id}");
                    }
                }
            }

            event = receiver.recv() => {
                match event {
                    Ok(event) => {
                        if event.peer_id() == peer_id {
                            continue;
                        }
                        // A member that stopped reading must not outlive its idle deadline.
                        let limit = deadline.saturating_duration_since(Instant::now());
                        if !send_within(sink, &event.to_wire(compression)?, limit).await? {
                            log::info!("Peer {peer_id} stopped reading, closing");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Peer {peer_id} lagged by {n} messages");
                        group.record_lag(n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                log::info!("Peer {peer_id} idle for {idle:?}, closing");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PositionReport;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    async fn start(config: ServerConfig) -> (RelayServer, SocketAddr) {
        let server = RelayServer::new(config);
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        tokio::spawn(bound.run());
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        ws
    }

    async fn send_msg(ws: &mut Client, msg: &WireMessage) {
        ws.send(Message::Binary(msg.encode().unwrap().into()))
            .await
            .unwrap();
    }

    async fn recv_msg(ws: &mut Client) -> WireMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
                .unwrap();
            if let Message::Binary(data) = frame {
                return WireMessage::decode(&data).unwrap();
            }
        }
    }

    async fn join(ws: &mut Client, peer: Uuid, room: &str, compression: Compression, color: u32) -> WireMessage {
        let request = JoinRequest::new(room, compression, color);
        send_msg(ws, &WireMessage::join(peer, &request).unwrap()).await;
        recv_msg(ws).await
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:4444");
        assert_eq!(config.max_peers_per_room, 64);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert!(config.allow_compression);
    }

    #[test]
    fn test_validate_join() {
        let ok = JoinRequest::new("  Lobby ", Compression::None, 0);
        assert_eq!(validate_join(&ok).unwrap(), "lobby");

        let empty = JoinRequest::new("   ", Compression::None, 0);
        assert_eq!(validate_join(&empty), Err(RejectReason::InvalidRoom));

        let long = JoinRequest::new("x".repeat(MAX_ROOM_NAME_LEN + 1), Compression::None, 0);
        assert_eq!(validate_join(&long), Err(RejectReason::InvalidRoom));

        let mut old = JoinRequest::new("r", Compression::None, 0);
        old.protocol_version = PROTOCOL_VERSION + 1;
        assert_eq!(
            validate_join(&old),
            Err(RejectReason::UnsupportedVersion {
                server_version: PROTOCOL_VERSION
            })
        );
    }

    #[test]
    fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats(), ServerStats::default());
        assert!(!server.is_secure());
    }

    #[tokio::test]
    async fn test_join_and_fan_out_with_mixed_codecs() {
        let (server, addr) = start(test_config()).await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut a = connect(addr).await;
        let accepted = join(&mut a, alice, "R1", Compression::Lz4, 0x00ff00).await;
        let a_joined = accepted.accepted().unwrap();
        assert_eq!(a_joined.color, 0x00ff00);
        assert_eq!(a_joined.compression, Compression::Lz4);

        let mut b = connect(addr).await;
        // Same room after normalization; same requested color gets replaced.
        let b_joined = join(&mut b, bob, "r1", Compression::None, 0x00ff00)
            .await
            .accepted()
            .unwrap();
        assert_ne!(b_joined.color, a_joined.color);
        assert_eq!(b_joined.compression, Compression::None);

        let report = PositionReport { x: 5, y: -3, color: 0x123456 };
        send_msg(&mut a, &WireMessage::position(alice, 1, &report, Compression::Lz4).unwrap()).await;

        let got = recv_msg(&mut b).await;
        assert_eq!(got.peer_id, alice);
        let decoded = got.position_report(Compression::None).unwrap();
        assert_eq!((decoded.x, decoded.y), (5, -3));
        assert_eq!(decoded.color, a_joined.color);

        let stats = server.stats();
        assert_eq!(stats.total_joins, 2);
        assert_eq!(stats.active_rooms, 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (server, addr) = start(test_config()).await;
        let mut ws = connect(addr).await;
        let mut request = JoinRequest::new("r", Compression::None, 0);
        request.protocol_version = 99;
        send_msg(&mut ws, &WireMessage::join(Uuid::new_v4(), &request).unwrap()).await;

        let reply = recv_msg(&mut ws).await;
        assert!(matches!(
            reply.rejection().unwrap(),
            RejectReason::UnsupportedVersion { server_version: PROTOCOL_VERSION }
        ));
        assert_eq!(server.stats().rejected_joins, 1);
    }

    #[tokio::test]
    async fn test_second_join_rejected_and_ping_answered() {
        let (_server, addr) = start(test_config()).await;
        let peer = Uuid::new_v4();
        let mut ws = connect(addr).await;
        join(&mut ws, peer, "r", Compression::None, 0).await.accepted().unwrap();

        let again = JoinRequest::new("other", Compression::None, 0);
        send_msg(&mut ws, &WireMessage::join(peer, &again).unwrap()).await;
        assert_eq!(recv_msg(&mut ws).await.rejection().unwrap(), RejectReason::AlreadyJoined);

        send_msg(&mut ws, &WireMessage::ping(peer)).await;
        assert_eq!(recv_msg(&mut ws).await.msg_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_peer_left_and_catch_up() {
        let (server, addr) = start(test_config()).await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut a = connect(addr).await;
        join(&mut a, alice, "r", Compression::None, 0).await.accepted().unwrap();
        let report = PositionReport { x: 40, y: 41, color: 0 };
        send_msg(&mut a, &WireMessage::position(alice, 1, &report, Compression::None).unwrap()).await;
        // Ping round trip orders the position before the next join.
        send_msg(&mut a, &WireMessage::ping(alice)).await;
        assert_eq!(recv_msg(&mut a).await.msg_type, MessageType::Pong);

        let mut b = connect(addr).await;
        join(&mut b, bob, "r", Compression::None, 0).await.accepted().unwrap();
        let catch_up = recv_msg(&mut b).await;
        assert_eq!(catch_up.peer_id, alice);
        assert_eq!(catch_up.position_report(Compression::None).unwrap().x, 40);

        a.close(None).await.unwrap();
        let left = recv_msg(&mut b).await;
        assert_eq!(left.msg_type, MessageType::PeerLeft);
        assert_eq!(left.peer_id, alice);
        assert_eq!(server.room_manager().member_count("r").await, 1);
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let config = ServerConfig {
            idle_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let (server, addr) = start(config).await;
        let mut ws = connect(addr).await;
        join(&mut ws, Uuid::new_v4(), "r", Compression::None, 0).await.accepted().unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.stats().active_rooms, 0);
    }

    /// A peer whose receive window never opens.
    struct StalledSink;

    impl futures_util::Sink<Message> for StalledSink {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), WsError> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_send_to_stalled_peer_gives_up() {
        let started = Instant::now();
        let sent = send_within(
            &mut StalledSink,
            &WireMessage::peer_left(Uuid::new_v4()),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert!(!sent);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_garbage_first_frame_counted() {
        let (server, addr) = start(test_config()).await;
        let mut ws = connect(addr).await;
        ws.send(Message::Binary(vec![0xff, 0xfe].into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.stats().malformed_frames, 1);
        assert_eq!(server.stats().total_joins, 0);
    }
}
