//! Physical connection to one replica.
//!
//! Owns a single TCP (optionally TLS) stream and provides byte-exact frame
//! I/O plus the health signals the dispatcher uses to retire it. Writes may
//! come from many callers and are serialized by a write gate; reads belong to
//! a single receive loop.

use crate::call::{CallStage, CallStageCell};
use crate::config::ConnectionConfig;
use crate::error::{ClientError, TransportError, TransportErrorCode};
use crate::health::{ConnectionTimestamps, HealthChecker, HealthVerdict, TransitTimeouts};
use crate::port_pool::{AddressFamily, UserPortPool};
use crate::stream::ReplicaStream;
use crate::tls::create_tls_connector;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rntbd_protocol::{ResponseHeader, BODY_LENGTH_SIZE, FRAME_HEADER_SIZE, RESPONSE_LENGTH_LIMIT};
use socket2::{SockRef, Socket, TcpKeepalive};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::Instant;
use uuid::Uuid;

/// Scheme of replica addresses.
pub const RNTBD_SCHEME: &str = "rntbd://";

/// Splits `rntbd://host:port/path` into host and port.
pub fn parse_target(target: &str) -> Result<(String, u16), ClientError> {
    let invalid = |why: &str| ClientError::Config(format!("invalid target {:?}: {}", target, why));

    let rest = target
        .strip_prefix(RNTBD_SCHEME)
        .ok_or_else(|| invalid("expected rntbd:// scheme"))?;
    let authority = rest.split('/').next().unwrap_or_default();

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok((host.to_string(), port))
}

/// Path and query of a target without trailing slashes.
pub fn replica_path(target: &str) -> &str {
    let rest = target.strip_prefix(RNTBD_SCHEME).unwrap_or(target);
    match rest.find('/') {
        Some(start) => rest[start..].trim_end_matches('/'),
        None => "",
    }
}

struct BoundPort {
    pool: Arc<dyn UserPortPool>,
    family: AddressFamily,
    port: u16,
}

/// A connection to one replica.
pub struct Connection {
    target: String,
    host: String,
    port: u16,
    config: ConnectionConfig,
    health: HealthChecker,
    name: RwLock<String>,
    /// Write gate: at most one writer at a time.
    writer: tokio::sync::Mutex<Option<WriteHalf<ReplicaStream>>>,
    /// Only the receive loop reads.
    reader: tokio::sync::Mutex<Option<ReadHalf<ReplicaStream>>>,
    timestamps: Mutex<ConnectionTimestamps>,
    transit: TransitTimeouts,
    /// Duplicate of the TCP socket used for health probes and shutdown.
    socket: Mutex<Option<Socket>>,
    bound_port: Mutex<Option<BoundPort>>,
    disposed: AtomicBool,
}

impl Connection {
    /// Creates a connection to `target` (not yet opened).
    pub fn new(target: &str, config: ConnectionConfig) -> Result<Self, ClientError> {
        let (host, port) = parse_target(target)?;
        let health = HealthChecker::new(
            config.send_hang_detection,
            config.receive_hang_detection,
            config.idle_timeout,
            config.transit_timeouts,
        )?;
        Ok(Self {
            target: target.to_string(),
            host,
            port,
            config,
            health,
            name: RwLock::new(format!("<not connected> -> {}", target)),
            writer: tokio::sync::Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            timestamps: Mutex::new(ConnectionTimestamps::new(Instant::now())),
            transit: TransitTimeouts::new(),
            socket: Mutex::new(None),
            bound_port: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Diagnostic name, `local -> remote` once connected.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn health_checker(&self) -> &HealthChecker {
        &self.health
    }

    pub fn timestamps(&self) -> ConnectionTimestamps {
        *self.timestamps.lock()
    }

    fn error(&self, code: TransportErrorCode, activity_id: Uuid) -> TransportError {
        TransportError::new(code, activity_id, self.target.clone(), self.name())
    }

    fn ensure_not_disposed(&self) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ClientError::InvalidOperation("connection used after dispose"));
        }
        Ok(())
    }

    /// Resolves, connects, tunes the socket and negotiates TLS.
    ///
    /// With a port pool, candidate local ports are tried before an
    /// OS-assigned one.
    pub async fn open(
        &self,
        activity_id: Uuid,
        port_pool: Option<Arc<dyn UserPortPool>>,
    ) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        self.timestamps.lock().record_send_attempt(Instant::now());

        let addr = self.resolve(activity_id).await?;
        tracing::debug!("connecting to {} ({})", self.target, addr);

        let (tcp, bound) = connect_tcp(addr, port_pool.as_deref()).await.map_err(|e| {
            tracing::debug!("connect to {} failed: {}", addr, e);
            self.error(TransportErrorCode::ConnectFailed, activity_id)
                .with_source(e)
        })?;
        if let (Some(pool), Some(port)) = (port_pool, bound) {
            *self.bound_port.lock() = Some(BoundPort {
                pool,
                family: AddressFamily::of(&addr),
                port,
            });
        }

        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!("failed to disable Nagle on {}: {}", addr, e);
        }
        let keepalive = TcpKeepalive::new()
            .with_time(self.config.keepalive.time)
            .with_interval(self.config.keepalive.interval);
        if let Err(e) = SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
            tracing::debug!("failed to enable keep-alive on {}: {}", addr, e);
        }
        let socket = SockRef::from(&tcp).try_clone().map_err(|e| {
            self.error(TransportErrorCode::ConnectFailed, activity_id)
                .with_source(e)
        })?;

        self.timestamps.lock().record_connected(Instant::now());
        *self.name.write() = match (tcp.local_addr(), tcp.peer_addr()) {
            (Ok(local), Ok(peer)) => format!("{} -> {}", local, peer),
            _ => format!("<unknown> -> {}", self.target),
        };
        *self.socket.lock() = Some(socket);

        let stream = match self.config.tls {
            Some(ref tls) if tls.enabled => {
                let (connector, server_name) =
                    create_tls_connector(tls, &self.host).map_err(|e| {
                        self.error(TransportErrorCode::SslNegotiationFailed, activity_id)
                            .with_source(e)
                    })?;
                tracing::debug!("performing TLS handshake with {}", self.target);
                let tls_stream = connector.connect(server_name, tcp).await.map_err(|e| {
                    self.error(TransportErrorCode::SslNegotiationFailed, activity_id)
                        .with_source(e)
                })?;
                self.timestamps.lock().record_connected(Instant::now());
                ReplicaStream::tls(tls_stream)
            }
            _ => ReplicaStream::plain(tcp),
        };
        let tls = stream.is_tls();

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        tracing::debug!("connection {} open (tls: {})", self.name(), tls);
        Ok(())
    }

    async fn resolve(&self, activity_id: Uuid) -> Result<SocketAddr, TransportError> {
        let dns_error = |source: Option<io::Error>| {
            let err = self.error(TransportErrorCode::DnsResolutionFailed, activity_id);
            match source {
                Some(source) => err.with_source(source),
                None => err,
            }
        };
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| dns_error(Some(e)))?
            .collect();
        addrs
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| dns_error(None))
    }

    /// Writes one complete frame. `stage` moves to sending once the write
    /// gate is held.
    pub async fn write_request(
        &self,
        activity_id: Uuid,
        bytes: &[u8],
        user_payload: bool,
        stage: Option<&CallStageCell>,
    ) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| {
            self.error(TransportErrorCode::SendFailed, activity_id)
                .with_payload(user_payload, false)
        })?;
        if let Some(stage) = stage {
            stage.set(CallStage::Sending);
        }

        self.timestamps.lock().record_send_attempt(Instant::now());
        let written = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::debug!("send on {} failed: {}", self.name(), e);
            return Err(self
                .error(TransportErrorCode::SendFailed, activity_id)
                .with_payload(user_payload, true)
                .with_source(e));
        }
        self.timestamps.lock().record_send(Instant::now());
        Ok(())
    }

    /// Half-closes the stream so later writes fail while reads continue.
    #[cfg(test)]
    pub(crate) async fn shutdown_writes(&self) {
        if let Some(writer) = self.writer.lock().await.as_mut() {
            let _ = writer.shutdown().await;
        }
    }

    /// Reads a response header and its metadata block.
    ///
    /// The declared length is validated before anything else is read.
    pub async fn read_response_metadata(
        &self,
        activity_id: Uuid,
    ) -> Result<(ResponseHeader, Bytes), TransportError> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or_else(|| {
            self.receive_error(TransportErrorCode::ReceiveStreamClosed, activity_id)
        })?;

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        self.read_fully(reader, &mut raw, activity_id).await?;
        let header = ResponseHeader::decode(&raw, RESPONSE_LENGTH_LIMIT).map_err(|e| {
            self.receive_error(TransportErrorCode::InvalidResponseLength, activity_id)
                .with_source(e)
        })?;

        let mut metadata = vec![0u8; header.metadata_len()];
        self.read_fully(reader, &mut metadata, activity_id).await?;
        Ok((header, Bytes::from(metadata)))
    }

    /// Reads a length-prefixed response body.
    pub async fn read_response_body(&self, activity_id: Uuid) -> Result<Bytes, TransportError> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or_else(|| {
            self.receive_error(TransportErrorCode::ReceiveStreamClosed, activity_id)
        })?;

        let mut length = [0u8; BODY_LENGTH_SIZE];
        self.read_fully(reader, &mut length, activity_id).await?;
        let length = u32::from_le_bytes(length);
        if length > RESPONSE_LENGTH_LIMIT {
            tracing::debug!(
                "connection {} declared a {} byte response body",
                self.name(),
                length
            );
            return Err(self.receive_error(TransportErrorCode::InvalidResponseLength, activity_id));
        }
        let mut body = vec![0u8; length as usize];
        self.read_fully(reader, &mut body, activity_id).await?;
        Ok(Bytes::from(body))
    }

    fn receive_error(&self, code: TransportErrorCode, activity_id: Uuid) -> TransportError {
        self.error(code, activity_id).with_payload(true, true)
    }

    async fn read_fully(
        &self,
        reader: &mut ReadHalf<ReplicaStream>,
        buf: &mut [u8],
        activity_id: Uuid,
    ) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await.map_err(|e| {
                self.receive_error(TransportErrorCode::ReceiveFailed, activity_id)
                    .with_source(e)
            })?;
            if n == 0 {
                return Err(self.receive_error(TransportErrorCode::ReceiveStreamClosed, activity_id));
            }
            filled += n;
            self.timestamps.lock().record_receive(Instant::now());
        }
        Ok(())
    }

    /// Judges whether the connection still works. Only logs as a side effect.
    pub fn is_healthy(&self) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        let timestamps = self.timestamps();
        match self
            .health
            .check(Instant::now(), &timestamps, self.transit.snapshot())
        {
            HealthVerdict::Healthy => true,
            HealthVerdict::Unhealthy(reason) => {
                tracing::warn!(
                    "connection {} is unhealthy ({:?}): {:?}",
                    self.name(),
                    reason,
                    timestamps
                );
                false
            }
            HealthVerdict::NeedsProbe => self.probe(),
        }
    }

    /// Zero-byte non-blocking send. Would-block means the send path is fine.
    #[cfg(any(unix, windows))]
    fn probe(&self) -> bool {
        let socket = self.socket.lock();
        let Some(socket) = socket.as_ref() else {
            return false;
        };
        match socket.send(&[]) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                tracing::warn!("health probe on {} failed: {}", self.name(), e);
                false
            }
        }
    }

    /// Without a zero-byte send the timestamp checks are the whole verdict.
    #[cfg(not(any(unix, windows)))]
    fn probe(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Whether data arrived within the idle window, plus how long to wait
    /// before the next check (or before closing, when idle).
    pub fn is_active(&self) -> Result<(bool, Duration), ClientError> {
        self.ensure_not_disposed()?;
        let last_receive = self.timestamps.lock().last_receive;
        Ok(self.health.is_active(Instant::now(), last_receive))
    }

    /// Feeds request outcomes into transit-timeout detection.
    pub fn notify_status(&self, completed: bool, read_only: bool) {
        self.transit.update(completed, read_only);
    }

    /// `(timeouts, write_timeouts)` since the last successful request.
    pub fn transit_timeouts(&self) -> (u32, u32) {
        self.transit.snapshot()
    }

    /// Closes the connection and releases its pooled port. Callable once.
    pub fn dispose(&self) -> Result<(), ClientError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(ClientError::InvalidOperation("connection disposed twice"));
        }

        if let Some(bound) = self.bound_port.lock().take() {
            bound.pool.remove_reference(bound.family, bound.port);
        }
        // Shutting the socket down wakes the receive loop with end-of-stream.
        if let Some(socket) = self.socket.lock().take() {
            if let Err(e) = socket.shutdown(std::net::Shutdown::Both) {
                tracing::debug!("shutdown of {} failed: {}", self.name(), e);
            }
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        let mut name = self.name.write();
        *name = format!("<disconnected> {}", name);
        tracing::debug!("connection {} disposed", name);
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn unspecified(addr: &SocketAddr, port: u16) -> SocketAddr {
    let ip = match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

fn new_socket(addr: &SocketAddr) -> io::Result<TcpSocket> {
    match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
}

/// Connects to `addr`, returning the pooled local port if one was used.
async fn connect_tcp(
    addr: SocketAddr,
    pool: Option<&dyn UserPortPool>,
) -> io::Result<(TcpStream, Option<u16>)> {
    let Some(pool) = pool else {
        return Ok((TcpStream::connect(addr).await?, None));
    };
    let family = AddressFamily::of(&addr);

    for port in pool.candidate_ports(family) {
        let socket = new_socket(&addr)?;
        socket.set_reuseaddr(true)?;
        if let Err(e) = socket.bind(unspecified(&addr, port)) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                pool.mark_unusable(family, port);
            } else {
                tracing::debug!("bind to local port {} failed: {}", port, e);
            }
            continue;
        }
        match socket.connect(addr).await {
            Ok(stream) => {
                pool.add_reference(family, port);
                return Ok((stream, Some(port)));
            }
            // Another connection already uses this local/remote pair.
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!("local port {} in use towards {}", port, addr);
            }
            Err(e) => return Err(e),
        }
    }

    // An OS-assigned port bound with reuse joins the pool for later sharing.
    let socket = new_socket(&addr)?;
    socket.set_reuseaddr(true)?;
    if socket.bind(unspecified(&addr, 0)).is_ok() {
        let stream = socket.connect(addr).await?;
        let port = stream.local_addr()?.port();
        pool.add_reference(family, port);
        return Ok((stream, Some(port)));
    }
    Ok((TcpStream::connect(addr).await?, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsClientConfig;
    use crate::port_pool::SimplePortPool;
    use rntbd_protocol::{ResponseFrame, ResponseToken, TokenValue};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new().with_idle_timeout(Some(Duration::from_secs(600)))
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("rntbd://{}/apps/replica", listener.local_addr().unwrap());
        (listener, target)
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("rntbd://replica.local:14330/apps/x").unwrap(),
            ("replica.local".to_string(), 14330)
        );
        assert_eq!(
            parse_target("rntbd://[::1]:443/").unwrap(),
            ("::1".to_string(), 443)
        );
        assert_eq!(
            parse_target("rntbd://10.0.0.1:80").unwrap(),
            ("10.0.0.1".to_string(), 80)
        );
        assert!(parse_target("https://replica:443/").is_err());
        assert!(parse_target("rntbd://replica/").is_err());
        assert!(parse_target("rntbd://:443/").is_err());
        assert!(parse_target("rntbd://replica:http/").is_err());
    }

    #[test]
    fn test_replica_path() {
        assert_eq!(replica_path("rntbd://replica:1/apps/a/services/b/"), "/apps/a/services/b");
        assert_eq!(replica_path("rntbd://replica:1/apps?x=1"), "/apps?x=1");
        assert_eq!(replica_path("rntbd://replica:1"), "");
    }

    #[test]
    fn test_rejects_bad_hang_limits() {
        let config = ConnectionConfig::new()
            .with_hang_detection(Duration::from_secs(10), Duration::from_secs(10));
        assert!(matches!(
            Connection::new("rntbd://replica:1/", config),
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_open_write_and_read() {
        let (listener, target) = listener().await;
        let activity_id = Uuid::new_v4();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 5];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, b"hello");

            let mut response = ResponseFrame::new(201, activity_id).with_body(&b"body"[..]);
            response
                .tokens
                .set(ResponseToken::TransportRequestId, TokenValue::ULong(1))
                .unwrap();
            let encoded = response.encode().unwrap();
            // Dribble the frame to exercise partial reads.
            for chunk in encoded.chunks(5) {
                socket.write_all(chunk).await.unwrap();
                socket.flush().await.unwrap();
            }
            socket
        });

        let connection = Connection::new(&target, config()).unwrap();
        assert!(connection.name().starts_with("<not connected> -> rntbd://"));
        connection.open(activity_id, None).await.unwrap();
        assert!(connection.name().contains(" -> 127.0.0.1:"));
        assert!(connection.is_healthy());

        let before = connection.timestamps();
        connection.write_request(activity_id, b"hello", false, None).await.unwrap();
        let after = connection.timestamps();
        assert!(after.last_send >= before.last_send);
        assert_eq!(after.sends_since_last_receive, 1);
        assert_eq!(after.last_receive, before.last_receive);

        let (header, metadata) = connection.read_response_metadata(activity_id).await.unwrap();
        assert_eq!(header.status, 201);
        assert_eq!(header.activity_id, activity_id);
        let frame = ResponseFrame::from_parts(header, metadata).unwrap();
        assert!(frame.payload_present());
        let body = connection.read_response_body(activity_id).await.unwrap();
        assert_eq!(&body[..], b"body");
        assert_eq!(connection.timestamps().sends_since_last_receive, 0);

        let _socket = server.await.unwrap();
        connection.dispose().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_response_length() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; FRAME_HEADER_SIZE];
            header[..4].copy_from_slice(&(i32::MAX as u32 + 1).to_le_bytes());
            socket.write_all(&header).await.unwrap();
            // Keep the socket open; the client must not wait for the declared bytes.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let connection = Connection::new(&target, config()).unwrap();
        connection.open(Uuid::nil(), None).await.unwrap();
        let err = connection.read_response_metadata(Uuid::nil()).await.unwrap_err();
        assert_eq!(err.code, TransportErrorCode::InvalidResponseLength);
        assert!(err.payload_sent);
    }

    #[tokio::test]
    async fn test_oversized_body_length() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let connection = Connection::new(&target, config()).unwrap();
        connection.open(Uuid::nil(), None).await.unwrap();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            connection.read_response_body(Uuid::nil()),
        )
        .await
        .expect("length must be rejected before the body is read")
        .unwrap_err();
        assert_eq!(err.code, TransportErrorCode::InvalidResponseLength);
        assert!(err.payload_sent);
    }

    #[tokio::test]
    async fn test_tls_handshake_failure() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let config = config().with_tls(TlsClientConfig::new().with_insecure());
        let connection = Connection::new(&target, config).unwrap();
        let err = connection.open(Uuid::nil(), None).await.unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportErrorCode::SslNegotiationFailed)
        );
        match err {
            ClientError::Transport(err) => {
                assert!(!err.payload_sent);
                assert!(err.source.is_some());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tls_config_failure_is_transport_fault() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let tls = TlsClientConfig::new().with_ca_cert("/nonexistent/ca.pem");
        let connection = Connection::new(&target, config().with_tls(tls)).unwrap();
        let err = connection.open(Uuid::nil(), None).await.unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportErrorCode::SslNegotiationFailed)
        );
        match err {
            ClientError::Transport(err) => {
                assert!(!err.payload_sent);
                let source = err.source.map(|e| e.to_string()).unwrap_or_default();
                assert!(source.contains("cannot open cert file"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[1, 2, 3]).await.unwrap();
        });

        let connection = Connection::new(&target, config()).unwrap();
        connection.open(Uuid::nil(), None).await.unwrap();
        let err = connection.read_response_metadata(Uuid::nil()).await.unwrap_err();
        assert_eq!(err.code, TransportErrorCode::ReceiveStreamClosed);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, target) = listener().await;
        drop(listener);

        let connection = Connection::new(&target, config()).unwrap();
        let err = connection.open(Uuid::nil(), None).await.unwrap_err();
        assert_eq!(err.transport_code(), Some(TransportErrorCode::ConnectFailed));
        match err {
            ClientError::Transport(err) => assert!(!err.payload_sent),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dns_failure() {
        let connection = Connection::new("rntbd://replica.invalid:443/", config()).unwrap();
        let err = connection.open(Uuid::nil(), None).await.unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportErrorCode::DnsResolutionFailed)
        );
    }

    #[tokio::test]
    async fn test_port_pool_references() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let pool = Arc::new(SimplePortPool::new());
        let connection = Connection::new(&target, config()).unwrap();
        connection
            .open(Uuid::nil(), Some(pool.clone() as Arc<dyn UserPortPool>))
            .await
            .unwrap();

        let ports = pool.candidate_ports(AddressFamily::V4);
        assert_eq!(ports.len(), 1);
        assert_eq!(pool.reference_count(AddressFamily::V4, ports[0]), 1);
        assert!(connection.name().contains(&format!(":{} -> ", ports[0])));

        connection.dispose().unwrap();
        assert_eq!(pool.reference_count(AddressFamily::V4, ports[0]), 0);
    }

    #[tokio::test]
    async fn test_dispose_twice_and_use_after_dispose() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let connection = Connection::new(&target, config()).unwrap();
        connection.open(Uuid::nil(), None).await.unwrap();
        connection.dispose().unwrap();

        assert!(connection.name().starts_with("<disconnected> "));
        assert!(!connection.is_healthy());
        assert!(matches!(
            connection.dispose(),
            Err(ClientError::InvalidOperation(_))
        ));
        assert!(matches!(
            connection.is_active(),
            Err(ClientError::InvalidOperation(_))
        ));
        let err = connection
            .write_request(Uuid::nil(), b"late", true, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, TransportErrorCode::SendFailed);
        assert!(!err.payload_sent);
    }

    #[tokio::test]
    async fn test_dispose_wakes_reader() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let connection = Arc::new(Connection::new(&target, config()).unwrap());
        connection.open(Uuid::nil(), None).await.unwrap();

        let reader = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.read_response_metadata(Uuid::nil()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        connection.dispose().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("reader must wake after dispose")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_is_active_after_open() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let connection = Connection::new(&target, config()).unwrap();
        connection.open(Uuid::nil(), None).await.unwrap();
        let (active, time_to_idle) = connection.is_active().unwrap();
        assert!(active);
        assert!(time_to_idle > Duration::from_secs(600));
    }

    /// On platforms without a zero-byte send the probe step always passes, so
    /// this only asserts the unix/windows behaviour.
    #[cfg(any(unix, windows))]
    #[tokio::test]
    async fn test_probe_healthy_socket() {
        let (listener, target) = listener().await;
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let connection = Connection::new(&target, config()).unwrap();
        connection.open(Uuid::nil(), None).await.unwrap();
        assert!(connection.probe());
    }
}
