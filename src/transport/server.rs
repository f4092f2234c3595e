//! TCP listener and HTTP routing.
//!
//! One listener serves every endpoint. Each accepted socket gets its own
//! task, which reads the request head and routes on the path.
//!
//! # Endpoints
//!
//! | Path (default) | Query | Result |
//! |----------------|-------|--------|
//! | `/xportlws` | `tok`, `cap` | device link upgrade, session runs until the link ends |
//! | `/xportws` | `uuid`, `port` | client WebSocket upgrade, attached to a slot |
//! | `/version` | - | `200 OK`, `version:<crate version>` |
//! | anything else | - | `404 Not Found` |
//!
//! # Rejections
//!
//! | Error | Status |
//! |-------|--------|
//! | [`Error::Unauthorized`] | 401 |
//! | [`Error::DeviceNotFound`] | 404 |
//! | [`Error::CapacityExhausted`] | 503 |
//! | anything else | 400 |

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, error, info, warn};

use crate::auth::{PlainTokenValidator, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::identifiers::DeviceId;
use crate::mux::{ClientLink, Registry};

use super::connection::FramedConnection;
use super::handshake::IncomingRequest;

// ============================================================================
// Server
// ============================================================================

/// A bound listener, ready to [`run`](Self::run).
///
/// # Example
///
/// ```ignore
/// let server = Server::bind(ServerConfig::new().with_port(8000)).await?;
/// let shutdown = server.shutdown_handle();
///
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.shutdown();
/// });
///
/// server.run().await?;
/// ```
pub struct Server {
    /// Accepting socket.
    listener: TcpListener,
    /// Address actually bound.
    local_addr: SocketAddr,
    /// Routing configuration.
    config: ServerConfig,
    /// Device sessions.
    registry: Arc<Registry>,
    /// Device token check.
    validator: Arc<dyn TokenValidator>,
    /// Stop signal for the accept loop.
    shutdown: ShutdownHandle,
}

/// Stops a running [`Server`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Stops accepting and closes every device session.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// State shared by connection tasks.
struct Router {
    config: ServerConfig,
    registry: Arc<Registry>,
    validator: Arc<dyn TokenValidator>,
}

// ============================================================================
// Server - Constructor & Accessors
// ============================================================================

impl Server {
    /// Validates `config` and binds its listen address.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the configuration is invalid
    /// - [`Error::Io`] if binding fails
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.socket_addr()).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, "Listener bound");

        Ok(Self {
            listener,
            local_addr,
            config,
            registry: Arc::new(Registry::new()),
            validator: Arc::new(PlainTokenValidator),
            shutdown: ShutdownHandle(Arc::new(watch::Sender::new(false))),
        })
    }

    /// Replaces the device token validator.
    #[must_use]
    pub fn with_validator(mut self, validator: impl TokenValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Uses an existing registry instead of a fresh one.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// Returns the address the listener is bound to.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the device registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns a handle that stops the server.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stops the server. Same as [`ShutdownHandle::shutdown`].
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }
}

// ============================================================================
// Server - Accept Loop
// ============================================================================

impl Server {
    /// Accepts connections until shut down.
    ///
    /// On shutdown every device session is asked to close; connection
    /// tasks wind down on their own.
    ///
    /// # Errors
    ///
    /// Currently always `Ok(())`; accept failures are logged and retried.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            local_addr,
            config,
            registry,
            validator,
            shutdown,
        } = self;

        let router = Arc::new(Router {
            config,
            registry,
            validator,
        });
        let mut stop = shutdown.0.subscribe();

        info!(%local_addr, "Listening");

        loop {
            tokio::select! {
                () = stopped(&mut stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            if let Err(e) = router.handle_connection(stream, peer).await {
                                debug!(error = %e, ?peer, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                },
            }
        }

        router.registry.shutdown();
        info!(%local_addr, "Listener stopped");
        Ok(())
    }
}

// ============================================================================
// Router
// ============================================================================

impl Router {
    /// Reads the request head and dispatches on its path.
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let read = IncomingRequest::read(stream, peer, self.config.max_header_bytes);
        let request = timeout(self.config.handshake_timeout(), read)
            .await
            .map_err(|_| Error::handshake("timed out waiting for request head"))??;

        let path = request.head().path.as_str();
        debug!(?peer, method = %request.head().method, path, "Request");

        if path == self.config.device_path {
            self.serve_device(request).await
        } else if path == self.config.client_path {
            self.serve_client(request).await
        } else if path == self.config.version_path {
            let body = format!("version:{}", env!("CARGO_PKG_VERSION"));
            request.respond(200, "OK", &body).await
        } else {
            request.respond(404, "Not Found", "not found").await
        }
    }

    /// Device endpoint: authenticate, upgrade, run the session.
    async fn serve_device(&self, request: IncomingRequest) -> Result<()> {
        let peer = request.peer();

        let accepted = self.device_params(&request).and_then(|params| {
            request.check_upgrade()?;
            Ok(params)
        });
        let (device_id, capacity) = match accepted {
            Ok(params) => params,
            Err(e) => return reject(request, e).await,
        };

        let connection = FramedConnection::upgrade(request).await?;
        info!(device_id = %device_id, ?peer, capacity, "Device connected");

        if let Err(e) = self.registry.register(device_id.clone(), capacity, connection).await {
            info!(device_id = %device_id, ?peer, error = %e, "Device disconnected");
        }
        Ok(())
    }

    fn device_params(&self, request: &IncomingRequest) -> Result<(DeviceId, u16)> {
        let head = request.head();
        let token = head
            .query_param("tok")
            .ok_or_else(|| Error::unauthorized("missing device token"))?;
        let device_id = self.validator.validate(token)?;
        let capacity = u16_param(request, "cap")?;
        Ok((device_id, capacity))
    }

    /// Client endpoint: find the device, upgrade, attach, pump.
    async fn serve_client(&self, request: IncomingRequest) -> Result<()> {
        let peer = request.peer();

        let accepted = client_params(&request).and_then(|(device_id, port)| {
            self.registry.lookup(&device_id)?;
            request.check_upgrade()?;
            Ok((device_id, port))
        });
        let (device_id, target_port) = match accepted {
            Ok(params) => params,
            Err(e) => return reject(request, e).await,
        };

        let stream = request.upgrade().await?;
        let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
        let (link, incoming) = ClientLink::split(ws);

        match self.registry.attach(&device_id, target_port, link.clone()).await {
            Ok(handle) => {
                debug!(device_id = %device_id, ?peer, slot = %handle.address(), target_port, "Client attached");
                handle.run_egress(incoming).await;
                Ok(())
            }
            Err(e) => {
                warn!(device_id = %device_id, ?peer, target_port, error = %e, "Client attach refused");
                if let Err(e) = link.close().await {
                    debug!(device_id = %device_id, ?peer, error = %e, "Client close failed");
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn client_params(request: &IncomingRequest) -> Result<(DeviceId, u16)> {
    let device_id = match request.head().query_param("uuid") {
        Some(uuid) if !uuid.is_empty() => DeviceId::new(uuid),
        _ => return Err(Error::invalid_argument("missing 'uuid' parameter")),
    };
    let port = u16_param(request, "port")?;
    Ok((device_id, port))
}

fn u16_param(request: &IncomingRequest, name: &str) -> Result<u16> {
    let raw = request
        .head()
        .query_param(name)
        .ok_or_else(|| Error::invalid_argument(format!("missing '{name}' parameter")))?;
    raw.parse()
        .map_err(|_| Error::invalid_argument(format!("bad '{name}' parameter: {raw:?}")))
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// HTTP status for a refused request.
fn status_for(error: &Error) -> (u16, &'static str) {
    match error {
        Error::Unauthorized { .. } => (401, "Unauthorized"),
        Error::DeviceNotFound { .. } => (404, "Not Found"),
        Error::CapacityExhausted { .. } => (503, "Service Unavailable"),
        _ => (400, "Bad Request"),
    }
}

async fn reject(request: IncomingRequest, error: Error) -> Result<()> {
    let (status, reason) = status_for(&error);
    warn!(peer = ?request.peer(), path = %request.head().path, status, error = %error, "Request rejected");
    request.respond(status, reason, &error.to_string()).await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{MaybeTlsStream, connect_async};

    use crate::mux::DeviceSession;

    const WAIT: Duration = Duration::from_secs(3);

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Running {
        addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown: ShutdownHandle,
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.shutdown.shutdown();
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig::new()
            .with_bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_port(0)
    }

    async fn start() -> Running {
        start_with(local_config()).await
    }

    async fn start_with(config: ServerConfig) -> Running {
        let server = Server::bind(config).await.unwrap();
        let running = Running {
            addr: server.local_addr(),
            registry: Arc::clone(server.registry()),
            shutdown: server.shutdown_handle(),
        };
        tokio::spawn(server.run());
        running
    }

    /// Sends a raw request and returns the response head plus the socket.
    async fn raw_request(addr: SocketAddr, target: &str, upgrade: bool) -> (String, TcpStream) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = format!("GET {target} HTTP/1.1\r\nHost: test\r\n");
        if upgrade {
            request.push_str(
                "Connection: Upgrade\r\nUpgrade: websocket\r\n\
                 Sec-WebSocket-Version: 13\r\n\
                 Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
            );
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        // Byte at a time so no frame data is consumed.
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let byte = timeout(WAIT, stream.read_u8()).await.unwrap().unwrap();
            head.push(byte);
        }
        (String::from_utf8(head).unwrap(), stream)
    }

    async fn connect_device(running: &Running, token: &str, capacity: u16) -> FramedConnection {
        let target = format!("/xportlws?tok={token}&cap={capacity}");
        let (head, stream) = raw_request(running.addr, &target, true).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
        FramedConnection::new(stream)
    }

    async fn connect_client(running: &Running, device: &str, port: u16) -> Client {
        let url = format!("ws://{}/xportws?uuid={device}&port={port}", running.addr);
        let (ws, _) = timeout(WAIT, connect_async(url)).await.unwrap().unwrap();
        ws
    }

    async fn client_status(running: &Running, query: &str) -> u16 {
        let url = format!("ws://{}/xportws?{query}", running.addr);
        match timeout(WAIT, connect_async(url)).await.unwrap() {
            Err(WsError::Http(response)) => response.status().as_u16(),
            Err(e) => panic!("expected HTTP rejection, got {e}"),
            Ok(_) => panic!("expected HTTP rejection, got an upgrade"),
        }
    }

    async fn wait_session(running: &Running, device: &str) -> Arc<DeviceSession> {
        let id = DeviceId::new(device);
        timeout(WAIT, async {
            loop {
                if let Ok(session) = running.registry.lookup(&id) {
                    return session;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn next_frame(device: &mut FramedConnection) -> Vec<u8> {
        timeout(WAIT, device.read_message()).await.unwrap().unwrap()
    }

    async fn next_binary(client: &mut Client) -> Vec<u8> {
        loop {
            match timeout(WAIT, client.next()).await.unwrap() {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(_)) => {}
                other => panic!("expected binary message, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_version_and_not_found() -> anyhow::Result<()> {
        let running = start().await;

        let (head, mut stream) = raw_request(running.addr, "/version", false).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        let mut body = String::new();
        stream.read_to_string(&mut body).await?;
        assert_eq!(body, format!("version:{}", env!("CARGO_PKG_VERSION")));

        let (head, _) = raw_request(running.addr, "/nowhere", false).await;
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "{head}");
        Ok(())
    }

    #[tokio::test]
    async fn test_incomplete_head_dropped_after_timeout() -> anyhow::Result<()> {
        let running =
            start_with(local_config().with_handshake_timeout(Duration::from_millis(100))).await;

        let mut stream = TcpStream::connect(running.addr).await?;
        stream.write_all(b"GET /xportlws?tok=dev&cap=1 HTTP/1.1\r\nHost: te").await?;

        let mut rest = Vec::new();
        let read = timeout(WAIT, stream.read_to_end(&mut rest)).await?;
        assert!(matches!(read, Ok(0) | Err(_)), "{read:?}");
        assert!(rest.is_empty());
        assert_eq!(running.registry.device_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_device_rejections() {
        let running = start().await;

        let (head, _) = raw_request(running.addr, "/xportlws?cap=4", true).await;
        assert!(head.starts_with("HTTP/1.1 401 "), "{head}");

        let (head, _) = raw_request(running.addr, "/xportlws?tok=d&cap=many", true).await;
        assert!(head.starts_with("HTTP/1.1 400 "), "{head}");

        let (head, _) = raw_request(running.addr, "/xportlws?tok=d&cap=4", false).await;
        assert!(head.starts_with("HTTP/1.1 400 "), "{head}");

        assert_eq!(running.registry.device_count(), 0);
    }

    #[tokio::test]
    async fn test_custom_validator() {
        let config = ServerConfig::new()
            .with_bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_port(0);
        let server = Server::bind(config)
            .await
            .unwrap()
            .with_validator(|token: &str| match token {
                "secret" => Ok(DeviceId::new("dev-1")),
                _ => Err(Error::unauthorized("unknown token")),
            });
        let running = Running {
            addr: server.local_addr(),
            registry: Arc::clone(server.registry()),
            shutdown: server.shutdown_handle(),
        };
        tokio::spawn(server.run());

        let (head, _) = raw_request(running.addr, "/xportlws?tok=guess&cap=1", true).await;
        assert!(head.starts_with("HTTP/1.1 401 "), "{head}");

        let _device = connect_device(&running, "secret", 1).await;
        wait_session(&running, "dev-1").await;
    }

    #[tokio::test]
    async fn test_client_rejections() {
        let running = start().await;

        assert_eq!(client_status(&running, "uuid=ghost&port=80").await, 404);
        assert_eq!(client_status(&running, "port=80").await, 400);
        assert_eq!(client_status(&running, "uuid=ghost").await, 400);

        let _device = connect_device(&running, "dev", 1).await;
        wait_session(&running, "dev").await;
        assert_eq!(client_status(&running, "uuid=dev&port=99999").await, 400);
    }

    #[tokio::test]
    async fn test_capacity_exhausted_closes_client() {
        let running = start().await;
        let mut device = connect_device(&running, "dev", 1).await;
        wait_session(&running, "dev").await;

        let _first = connect_client(&running, "dev", 80).await;
        next_frame(&mut device).await;

        let mut second = connect_client(&running, "dev", 81).await;
        match timeout(WAIT, second.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scenario_slot_reuse_with_new_generation() {
        let running = start().await;
        let mut device = connect_device(&running, "dev", 4).await;
        let session = wait_session(&running, "dev").await;
        assert_eq!(session.capacity(), 4);

        // First client: slot 0, tag 1.
        let mut first = connect_client(&running, "dev", 80).await;
        assert_eq!(next_frame(&mut device).await, vec![2, 0, 0, 1, 0, 80, 0]);

        device.write_message(&[1, 0, 0, 1, 0, b'h', b'i']).await.unwrap();
        assert_eq!(next_binary(&mut first).await, b"hi");

        first.send(Message::binary(b"yo".to_vec())).await.unwrap();
        assert_eq!(next_frame(&mut device).await, vec![1, 0, 0, 1, 0, b'y', b'o']);

        // Disconnect: ClientClosed with the old tag, then the slot is freed.
        first.close(None).await.unwrap();
        assert_eq!(next_frame(&mut device).await, vec![3, 0, 0, 1, 0]);
        wait_until(|| session.active_slots() == 0).await;
        assert_eq!(session.generation_of(0).map(|g| g.get()), Some(2));

        // Second client: slot 0 again, tag 2, port 443.
        let mut second = connect_client(&running, "dev", 443).await;
        assert_eq!(next_frame(&mut device).await, vec![2, 0, 0, 2, 0, 0xbb, 0x01]);

        // Data for the old tag is dropped; the new tag gets through.
        device.write_message(&[1, 0, 0, 1, 0, b'o', b'l', b'd']).await.unwrap();
        device.write_message(&[1, 0, 0, 2, 0, b'n', b'e', b'w']).await.unwrap();
        assert_eq!(next_binary(&mut second).await, b"new");
    }

    #[tokio::test]
    async fn test_scenario_short_frames() {
        let running = start().await;
        let mut device = connect_device(&running, "dev", 1).await;
        wait_session(&running, "dev").await;

        // Length 3, opcode only.
        device.write_message(&[8]).await.unwrap();
        assert_eq!(next_frame(&mut device).await, vec![9]);

        device.write_message(&[9]).await.unwrap();

        // Addressed opcode too short: dropped, session survives.
        device.write_message(&[1]).await.unwrap();
        device.write_message(&[6, 0, 0]).await.unwrap();

        device.write_message(&[8, 1, 2, 3, 4, 5]).await.unwrap();
        assert_eq!(next_frame(&mut device).await, vec![9, 1, 2, 3, 4, 5]);
        assert!(running.registry.contains(&DeviceId::new("dev")));
    }

    #[tokio::test]
    async fn test_scenario_reconnect_replaces_session() {
        let running = start().await;

        // Device A, mid-transfer.
        let mut device_a = connect_device(&running, "dev", 2).await;
        let session_a = wait_session(&running, "dev").await;
        let mut client_a = connect_client(&running, "dev", 80).await;
        assert_eq!(next_frame(&mut device_a).await, vec![2, 0, 0, 1, 0, 80, 0]);
        device_a.write_message(&[1, 0, 0, 1, 0, 1, 2, 3]).await.unwrap();
        assert_eq!(next_binary(&mut client_a).await, vec![1, 2, 3]);

        // Device B under the same identifier.
        let mut device_b = connect_device(&running, "dev", 3).await;

        // A's link is closed and its slots freed before B is installed.
        assert!(timeout(WAIT, device_a.read_message()).await.unwrap().is_err());
        wait_until(|| session_a.is_finished()).await;
        assert_eq!(session_a.active_slots(), 0);
        match timeout(WAIT, client_a.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
            other => panic!("expected close, got {other:?}"),
        }

        let session_b = wait_session(&running, "dev").await;
        assert!(!Arc::ptr_eq(&session_a, &session_b));
        assert_eq!(session_b.capacity(), 3);
        assert_eq!(session_b.active_slots(), 0);
        assert_eq!(running.registry.device_count(), 1);

        let _client_b = connect_client(&running, "dev", 22).await;
        assert_eq!(next_frame(&mut device_b).await, vec![2, 0, 0, 1, 0, 22, 0]);
    }

    #[tokio::test]
    async fn test_device_disconnect_closes_clients() {
        let running = start().await;
        let mut device = connect_device(&running, "dev", 2).await;
        let session = wait_session(&running, "dev").await;

        let mut client = connect_client(&running, "dev", 80).await;
        next_frame(&mut device).await;

        drop(device);
        match timeout(WAIT, client.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
            other => panic!("expected close, got {other:?}"),
        }
        wait_until(|| !running.registry.contains(&DeviceId::new("dev"))).await;
        assert_eq!(session.active_slots(), 0);
    }

    #[tokio::test]
    async fn test_device_closing_slot_closes_client() {
        let running = start().await;
        let mut device = connect_device(&running, "dev", 1).await;
        let session = wait_session(&running, "dev").await;

        let mut client = connect_client(&running, "dev", 80).await;
        next_frame(&mut device).await;

        device.write_message(&[5, 0, 0, 1, 0]).await.unwrap();
        match timeout(WAIT, client.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(session.active_slots(), 0);

        // No ClientClosed follows; the next frame is the Pong.
        device.write_message(&[8]).await.unwrap();
        assert_eq!(next_frame(&mut device).await, vec![9]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_devices() {
        let running = start().await;
        let mut device = connect_device(&running, "dev", 1).await;
        wait_session(&running, "dev").await;

        running.shutdown.shutdown();
        assert!(timeout(WAIT, device.read_message()).await.unwrap().is_err());
        wait_until(|| running.registry.device_count() == 0).await;
    }
}
