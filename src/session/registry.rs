//! Tunnel registry for WebSocket mode.
//!
//! Owns the two cross-task maps: `tunnels` (registered tunnels) and
//! `connections` (live local sockets keyed by `connection_id`). A
//! connection is born when the first `data` frame for an unseen id
//! arrives: the registry dials the local target, stores the write half,
//! and spawns a forwarder that streams local reads back to the server as
//! `data` frames, in read order.
//!
//! SSH streams get special treatment: bigger socket buffers, bigger read
//! chunks, a slower ticker and an application-level keepalive (an empty
//! `data` frame) once the stream has been idle for 30 s.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::protocol::{DataPayload, MessageType};
use crate::session::{Session, SessionError};
use crate::tunnel::{Tunnel, TunnelConfig, TunnelType};
use crate::util::tune_stream;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_ATTEMPTS: u32 = 5;
const DIAL_BACKOFF_STEP: Duration = Duration::from_millis(200);
const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);
const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);
const BUFFER_SIZE: usize = 128 * 1024;
const SSH_BUFFER_SIZE: usize = 256 * 1024;
const READ_CHUNK: usize = 8 * 1024;
const SSH_READ_CHUNK: usize = 32 * 1024;
const TICK_PERIOD: Duration = Duration::from_secs(15);
const SSH_TICK_PERIOD: Duration = Duration::from_secs(30);
const SSH_IDLE_THRESHOLD: Duration = Duration::from_secs(30);

const SSH_PREFIX: &[u8; 4] = b"SSH-";

/// A live local socket participating in a tunnel.
struct ConnectionEntry {
    tunnel_id: String,
    /// Write half, shared with the inbound `data` handler.
    writer: Arc<Mutex<OwnedWriteHalf>>,
    is_ssh: Arc<AtomicBool>,
    /// Last local activity, epoch milliseconds.
    last_activity_ms: Arc<AtomicI64>,
}

/// Registry of tunnels and their live connections (WebSocket mode).
pub struct TunnelRegistry {
    session: Arc<Session>,
    tunnels: RwLock<HashMap<String, Tunnel>>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl TunnelRegistry {
    /// Build the registry and install its `data` handler on the session.
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        let registry = Arc::new(Self {
            session,
            tunnels: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        });

        let handler_registry = Arc::clone(&registry);
        registry
            .session
            .register_handler(MessageType::Data, move |msg| {
                let registry = Arc::clone(&handler_registry);
                async move {
                    let payload: DataPayload = msg.parse_payload()?;
                    registry
                        .handle_data(&payload.tunnel_id, &payload.connection_id, payload.data)
                        .await
                }
            });

        registry
    }

    // ── Tunnel lifecycle ─────────────────────────────────────────────

    /// Register a tunnel with the server and store the resulting record.
    pub async fn register(&self, config: TunnelConfig) -> Result<Tunnel, SessionError> {
        if !self.session.is_connected() {
            self.session.connect().await?;
        }

        let response = self.session.send_register_tunnel(&config).await?;

        let mut tunnel = Tunnel::new(response.tunnel_id.clone(), config);
        match tunnel.config.tunnel_type {
            TunnelType::Http => tunnel.set_http_info(response.url.unwrap_or_default()),
            TunnelType::Tcp => tunnel.set_tcp_info(response.remote_port),
        }

        self.tunnels
            .write()
            .await
            .insert(tunnel.id.clone(), tunnel.clone());

        if tunnel.config.tunnel_type == TunnelType::Tcp {
            // No local listener: connections are originated on demand when
            // data frames arrive.
            info!(
                "Ready to forward connections to local service at {}",
                tunnel.config.local_target()
            );
        }

        Ok(tunnel)
    }

    /// Unregister on the server and drop the record. Local state goes away
    /// even when the server call fails; the error is still surfaced.
    pub async fn unregister(&self, tunnel_id: &str) -> Result<(), SessionError> {
        let result = if self.session.is_connected() {
            self.session.send_unregister_tunnel(tunnel_id).await
        } else {
            match self.session.connect().await {
                Ok(()) => self.session.send_unregister_tunnel(tunnel_id).await,
                Err(e) => Err(e),
            }
        };
        self.tunnels.write().await.remove(tunnel_id);
        result
    }

    pub async fn get_all(&self) -> Vec<Tunnel> {
        self.tunnels.read().await.values().cloned().collect()
    }

    pub async fn get_by_id(&self, tunnel_id: &str) -> Option<Tunnel> {
        self.tunnels.read().await.get(tunnel_id).cloned()
    }

    /// Outbound `data` frame for one connection.
    pub async fn send_data(
        &self,
        tunnel_id: &str,
        connection_id: &str,
        data: &[u8],
    ) -> Result<(), SessionError> {
        self.session.send_data(tunnel_id, connection_id, data).await
    }

    // ── Inbound data path ────────────────────────────────────────────

    /// Handle one inbound `data` payload: route to the live connection,
    /// or dial the local target when the `connection_id` is new.
    pub async fn handle_data(
        self: &Arc<Self>,
        tunnel_id: &str,
        connection_id: &str,
        data: Vec<u8>,
    ) -> Result<(), SessionError> {
        let writer = {
            let connections = self.connections.read().await;
            connections.get(connection_id).map(|e| Arc::clone(&e.writer))
        };

        match writer {
            Some(writer) => {
                if data.is_empty() {
                    return Ok(());
                }
                debug!(
                    "Forwarding {} bytes to local connection {connection_id}",
                    data.len()
                );
                let mut guard = writer.lock().await;
                if let Err(e) = write_with_deadline(&mut *guard, &data).await {
                    error!("All attempts to write data to connection {connection_id} failed: {e}");
                    drop(guard);
                    self.remove_connection(connection_id).await;
                    return Err(SessionError::LocalService(format!(
                        "failed to write data to connection after retries: {e}"
                    )));
                }
                Ok(())
            }
            None => self.open_connection(tunnel_id, connection_id, data).await,
        }
    }

    /// First frame for an unseen `connection_id`: dial the local service,
    /// store the entry, start the forwarder, deliver the payload.
    async fn open_connection(
        self: &Arc<Self>,
        tunnel_id: &str,
        connection_id: &str,
        initial: Vec<u8>,
    ) -> Result<(), SessionError> {
        let tunnel = self
            .get_by_id(tunnel_id)
            .await
            .ok_or_else(|| SessionError::UnknownTunnel(tunnel_id.to_string()))?;

        let local_addr = tunnel.config.local_target();
        info!("Connecting to local service at {local_addr} for connection {connection_id}...");

        let dial = Backoff::linear(DIAL_BACKOFF_STEP, DIAL_ATTEMPTS);
        let stream = dial
            .retry(|| async {
                match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&local_addr)).await {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection timed out",
                    )),
                }
            })
            .await
            .map_err(|e| {
                error!("All attempts to connect to local service at {local_addr} failed: {}", e.last);
                SessionError::LocalService(format!(
                    "failed to connect to local service after {} attempts: {}",
                    e.attempts, e.last
                ))
            })?;

        // Visitors of SSH tunnels announce themselves in their first bytes,
        // which ride in on this initial payload. Size the socket for it.
        let ssh_inbound = initial.len() >= 4 && initial[..4] == *SSH_PREFIX;
        if ssh_inbound {
            info!("SSH handshake detected, data length: {} bytes", initial.len());
        }
        let buffer_size = if ssh_inbound { SSH_BUFFER_SIZE } else { BUFFER_SIZE };
        tune_stream(&stream, buffer_size, KEEPALIVE_PERIOD);
        info!("Connected to local service at {local_addr}");

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));
        let is_ssh = Arc::new(AtomicBool::new(ssh_inbound));
        let last_activity_ms = Arc::new(AtomicI64::new(now_ms()));

        {
            let mut connections = self.connections.write().await;
            if let Some(existing) = connections.get(connection_id) {
                // Raced with another frame for the same id: the map keeps
                // at most one entry, so deliver through the winner.
                warn!("Connection {connection_id} already registered, reusing existing entry");
                let writer = Arc::clone(&existing.writer);
                drop(connections);
                if !initial.is_empty() {
                    let mut guard = writer.lock().await;
                    write_with_deadline(&mut *guard, &initial)
                        .await
                        .map_err(|e| SessionError::LocalService(e.to_string()))?;
                }
                return Ok(());
            }
            connections.insert(
                connection_id.to_string(),
                ConnectionEntry {
                    tunnel_id: tunnel_id.to_string(),
                    writer: Arc::clone(&writer),
                    is_ssh: Arc::clone(&is_ssh),
                    last_activity_ms: Arc::clone(&last_activity_ms),
                },
            );
        }

        if !initial.is_empty() {
            debug!(
                "Forwarding initial {} bytes to local connection {connection_id}",
                initial.len()
            );
            let mut guard = writer.lock().await;
            if let Err(e) = write_with_deadline(&mut *guard, &initial).await {
                error!("Failed to write initial data after all retries: {e}");
                drop(guard);
                self.remove_connection(connection_id).await;
                return Err(SessionError::LocalService(format!(
                    "failed to write initial data: {e}"
                )));
            }
        }

        let registry = Arc::clone(self);
        let tunnel_id = tunnel_id.to_string();
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            registry
                .forward_local_reads(tunnel_id, connection_id, read_half, is_ssh, last_activity_ms)
                .await;
        });

        Ok(())
    }

    /// Stream local reads to the server, in read order, until EOF or a
    /// persistent failure. Owns the entry's removal on exit.
    async fn forward_local_reads(
        self: Arc<Self>,
        tunnel_id: String,
        connection_id: String,
        mut read_half: OwnedReadHalf,
        is_ssh: Arc<AtomicBool>,
        last_activity_ms: Arc<AtomicI64>,
    ) {
        info!("Starting data forwarding from local to remote for connection {connection_id}");
        let send_policy = Backoff::exponential(Duration::from_millis(50), Duration::from_secs(2), 5);

        // First chunk: longer deadline, then SSH sniffing.
        let mut first = vec![0u8; READ_CHUNK];
        let n = match tokio::time::timeout(FIRST_READ_TIMEOUT, read_half.read(&mut first)).await {
            Ok(Ok(0)) => {
                info!("Local connection {connection_id} closed before any data");
                self.remove_connection(&connection_id).await;
                return;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                error!("Error reading initial data for connection {connection_id}: {e}");
                self.remove_connection(&connection_id).await;
                return;
            }
            Err(_) => {
                error!("Timed out reading initial data for connection {connection_id}");
                self.remove_connection(&connection_id).await;
                return;
            }
        };

        if n >= 4 && first[..4] == *SSH_PREFIX && !is_ssh.swap(true, Ordering::SeqCst) {
            info!("SSH connection detected for {connection_id}, applying optimizations");
        }
        let ssh = is_ssh.load(Ordering::SeqCst);
        last_activity_ms.store(now_ms(), Ordering::SeqCst);

        let initial = first[..n].to_vec();
        debug!(
            "Sending initial data ({} bytes) for connection {connection_id}",
            initial.len()
        );
        if let Err(e) = send_policy
            .retry(|| self.session.send_data(&tunnel_id, &connection_id, &initial))
            .await
        {
            error!("All attempts to send initial data to server failed: {e}");
            self.remove_connection(&connection_id).await;
            return;
        }

        let chunk_size = if ssh { SSH_READ_CHUNK } else { READ_CHUNK };
        let mut buf = vec![0u8; chunk_size];
        let mut ticker = tokio::time::interval(if ssh { SSH_TICK_PERIOD } else { TICK_PERIOD });
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => {
                        info!("Local connection {connection_id} closed by local service (EOF)");
                        break;
                    }
                    Ok(n) => {
                        last_activity_ms.store(now_ms(), Ordering::SeqCst);
                        let data = buf[..n].to_vec();
                        // Sent inline: per-connection frames must keep read
                        // order.
                        if let Err(e) = send_policy
                            .retry(|| self.session.send_data(&tunnel_id, &connection_id, &data))
                            .await
                        {
                            error!("Failed to send data to server: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error reading from local connection {connection_id}: {e}");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let idle = now_ms() - last_activity_ms.load(Ordering::SeqCst);
                    if is_ssh.load(Ordering::SeqCst) && idle > SSH_IDLE_THRESHOLD.as_millis() as i64 {
                        debug!("Sending SSH keepalive for connection {connection_id}");
                        if let Err(e) = self.session.send_data(&tunnel_id, &connection_id, &[]).await {
                            warn!("Failed to send keepalive: {e}");
                        }
                    }
                }
            }
        }

        self.remove_connection(&connection_id).await;
    }

    /// Drop the entry for a connection. Closing the write half tells the
    /// local service we are done; idempotent.
    async fn remove_connection(&self, connection_id: &str) {
        let removed = self.connections.write().await.remove(connection_id);
        if let Some(entry) = removed {
            info!(
                "Closing connection {connection_id} (tunnel {})",
                entry.tunnel_id
            );
        }
    }

    #[cfg(test)]
    async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// Write the whole buffer under a deadline, retrying transient failures.
/// The deadline applies per attempt and is always cleared by returning.
async fn write_with_deadline<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> std::io::Result<()> {
    let mut last_err = None;
    for attempt in 0..WRITE_ATTEMPTS {
        match tokio::time::timeout(WRITE_DEADLINE, writer.write_all(data)).await {
            Ok(Ok(())) => {
                return match tokio::time::timeout(WRITE_DEADLINE, writer.flush()).await {
                    Ok(result) => result,
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "flush timed out",
                    )),
                };
            }
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {
                last_err = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write timed out",
                ));
            }
        }
        if attempt + 1 < WRITE_ATTEMPTS {
            warn!(
                "Attempt {} to write data failed: {}, retrying...",
                attempt + 1,
                last_err.as_ref().map(|e| e.to_string()).unwrap_or_default()
            );
            tokio::time::sleep(WRITE_RETRY_DELAY).await;
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "write failed")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::{Message, MessageType};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsFrame;

    /// Control-plane stub that records every `data` payload it receives.
    async fn data_sink_server() -> (u16, Arc<Mutex<Vec<DataPayload>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if let WsFrame::Text(text) = frame {
                    let msg = Message::from_text(&text).unwrap();
                    if msg.message_type == MessageType::Data {
                        let payload: DataPayload = msg.parse_payload().unwrap();
                        sink.lock().await.push(payload);
                    } else if msg.message_type == MessageType::Ping {
                        let pong = Message::without_payload(MessageType::Pong);
                        let _ = ws
                            .send(WsFrame::Text(pong.to_text().unwrap().into()))
                            .await;
                    }
                }
            }
        });
        (port, received)
    }

    async fn connected_registry(port: u16) -> Arc<TunnelRegistry> {
        let mut config = Config::default();
        config.server_address = "127.0.0.1".into();
        config.control_port = port;
        config.auth_enabled = false;
        config.tls_enabled = false;
        let session = Session::new(Arc::new(config));
        session.connect().await.unwrap();
        TunnelRegistry::new(session)
    }

    async fn seed_tunnel(registry: &TunnelRegistry, id: &str, local_port: u16) {
        let config: TunnelConfig = toml::from_str(&format!(
            "type = \"tcp\"\nlocal_port = {local_port}"
        ))
        .unwrap();
        let mut tunnel = Tunnel::new(id, config);
        tunnel.set_tcp_info(20000);
        registry
            .tunnels
            .write()
            .await
            .insert(id.to_string(), tunnel);
    }

    async fn wait_until<F, Fut>(mut probe: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if probe().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn first_data_frame_dials_local_service_and_streams_back() {
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        let local_task = tokio::spawn(async move {
            let (mut socket, _) = local.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n\r\n");
            // Two writes: payload frames must come back in this order.
            socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            socket.write_all(b"hello from local").await.unwrap();
        });

        let (port, received) = data_sink_server().await;
        let registry = connected_registry(port).await;
        seed_tunnel(&registry, "t1", local_port).await;

        registry
            .handle_data("t1", "c1", b"GET / HTTP/1.1\r\n\r\n".to_vec())
            .await
            .unwrap();
        assert_eq!(registry.connection_count().await, 1);

        local_task.await.unwrap();
        wait_until(|| async {
            let frames = received.lock().await;
            let total: usize = frames.iter().map(|p| p.data.len()).sum();
            total >= b"HTTP/1.1 200 OK\r\n\r\nhello from local".len()
        })
        .await;

        let frames = received.lock().await;
        let bytes: Vec<u8> = frames.iter().flat_map(|p| p.data.clone()).collect();
        assert_eq!(bytes, b"HTTP/1.1 200 OK\r\n\r\nhello from local".to_vec());
        assert!(frames.iter().all(|p| p.connection_id == "c1"));
    }

    #[tokio::test]
    async fn entry_removed_after_local_close() {
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = local.accept().await.unwrap();
            let mut buf = vec![0u8; 16];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"bye").await.unwrap();
            // Dropping the socket closes it; the forwarder must notice.
        });

        let (port, _received) = data_sink_server().await;
        let registry = connected_registry(port).await;
        seed_tunnel(&registry, "t1", local_port).await;

        registry.handle_data("t1", "c9", b"x".to_vec()).await.unwrap();
        wait_until(|| async { registry.connection_count().await == 0 }).await;
    }

    #[tokio::test]
    async fn ssh_banner_marks_connection_before_second_read() {
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = local.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
            // Hold the socket open so the entry stays alive.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (port, received) = data_sink_server().await;
        let registry = connected_registry(port).await;
        seed_tunnel(&registry, "t1", local_port).await;

        registry
            .handle_data("t1", "c2", b"SSH-2.0-client\r\n".to_vec())
            .await
            .unwrap();

        // Marked from the visitor banner at entry creation, confirmed by
        // the local banner on first read; either way, before any second
        // read completes.
        let marked = {
            let connections = registry.connections.read().await;
            connections
                .get("c2")
                .map(|e| e.is_ssh.load(Ordering::SeqCst))
        };
        assert_eq!(marked, Some(true));

        wait_until(|| async { !received.lock().await.is_empty() }).await;
        let frames = received.lock().await;
        assert_eq!(frames[0].data, b"SSH-2.0-OpenSSH_9.6\r\n".to_vec());
    }

    #[tokio::test]
    async fn unknown_tunnel_is_an_error() {
        let (port, _received) = data_sink_server().await;
        let registry = connected_registry(port).await;
        let result = registry.handle_data("nope", "c1", b"x".to_vec()).await;
        assert!(matches!(result, Err(SessionError::UnknownTunnel(_))));
        assert_eq!(registry.connection_count().await, 0);
    }
}
