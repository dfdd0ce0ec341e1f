//! Direct-TCP reverse tunnel.
//!
//! The raw-TCP alternative to the WebSocket session. The client originates
//! one outbound registration connection per tunnel (`DIRECT_TCP_FORWARD`)
//! and keeps an independent control-loop connection (`CONTROL_CONNECTION`)
//! on which the server delivers reverse `CONNECT:{host}:{port}` requests.
//! For each request the client dials the target, answers `OK` or
//! `ERROR:{reason}`, then splices the two sockets until EOF on both
//! directions. No listener is ever opened on the client side.
//!
//! Handshake replies from the server are a single ASCII line:
//! `CONNECTED[:<assigned_port>]` or `ERROR[:<reason>]`. A differing
//! assigned port is adopted and announced through the port-change
//! callback; an `ERROR` makes the client re-register on a fresh random
//! port in `[10000, 30000)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::tunnel::{Tunnel, TunnelConfig, TunnelType};
use crate::util::{target_port, tune_stream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_BUFFER: usize = 4096;
const SSH_HANDSHAKE_BUFFER: usize = 64 * 1024;
/// Pause before re-registering after a server `ERROR` reply.
const ERROR_RETRY_PAUSE: Duration = Duration::from_millis(500);
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Longer wait when the server looks unreachable.
const UNREACHABLE_RETRY_DELAY: Duration = Duration::from_secs(30);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);
const SPLICE_BUFFER: usize = 256 * 1024;
/// Remote ports drawn after a registration conflict.
const REMOTE_PORT_RANGE: std::ops::Range<u16> = 10_000..30_000;

const TRAILER_FORWARD: &str = "DIRECT_TCP_FORWARD";
const TRAILER_CONTROL: &str = "CONTROL_CONNECTION";

/// Invoked with the new port whenever the server assigns one that differs
/// from the current value.
pub type PortChangeCallback = Box<dyn Fn(u16) + Send + Sync>;

// ── Handshake parsing ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum HandshakeReply {
    /// `ERROR[...]` — registration rejected (usually a port conflict).
    Error(String),
    /// `CONNECTED:<port>` — accepted on the given port.
    ConnectedPort(u16),
    /// `CONNECTED` without a parseable port — accepted as requested.
    Connected,
    Unexpected(String),
}

fn parse_handshake(response: &str) -> HandshakeReply {
    let trimmed = response.trim();
    if trimmed.starts_with("ERROR") {
        return HandshakeReply::Error(trimmed.to_string());
    }
    if let Some(rest) = trimmed.strip_prefix("CONNECTED:") {
        let port_text = rest.split(':').next().unwrap_or("").trim();
        return match port_text.parse::<u16>() {
            Ok(port) => HandshakeReply::ConnectedPort(port),
            Err(_) => HandshakeReply::Connected,
        };
    }
    if trimmed.contains("CONNECTED") {
        return HandshakeReply::Connected;
    }
    HandshakeReply::Unexpected(trimmed.to_string())
}

/// Dial errors that suggest the server host itself is down or unroutable.
fn is_unreachable(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::ConnectionRefused {
        return true;
    }
    let text = e.to_string();
    text.contains("connection refused")
        || text.contains("no route to host")
        || text.contains("network is unreachable")
}

// ── Tunnel instance ──────────────────────────────────────────────────

/// One direct-TCP tunnel: registration connection + control loop.
pub struct DirectTunnel {
    server_addr: String,
    control_port: u16,
    /// `host:port` of the local service.
    target_addr: String,
    remote_port: AtomicU16,
    /// Token included in the registration line when set.
    auth_token: Option<String>,
    /// The registration connection, held open for the tunnel's lifetime.
    control: Mutex<Option<TcpStream>>,
    stop_tx: watch::Sender<bool>,
    port_callback: std::sync::Mutex<Option<PortChangeCallback>>,
}

impl DirectTunnel {
    #[must_use]
    pub fn new(
        server_addr: impl Into<String>,
        control_port: u16,
        target_addr: impl Into<String>,
        remote_port: u16,
        auth_token: Option<String>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            server_addr: server_addr.into(),
            control_port,
            target_addr: target_addr.into(),
            remote_port: AtomicU16::new(remote_port),
            auth_token,
            control: Mutex::new(None),
            stop_tx,
            port_callback: std::sync::Mutex::new(None),
        })
    }

    #[must_use]
    pub fn remote_port(&self) -> u16 {
        self.remote_port.load(Ordering::SeqCst)
    }

    pub fn set_port_change_callback(&self, callback: PortChangeCallback) {
        *self.port_callback.lock().expect("callback lock") = Some(callback);
    }

    fn registration_line(&self, trailer: &str) -> String {
        match &self.auth_token {
            Some(token) if !token.is_empty() => format!(
                "AUTH_TOKEN={token}:{}:{}:{trailer}",
                self.target_addr,
                self.remote_port()
            ),
            _ => format!("{}:{}:{trailer}", self.target_addr, self.remote_port()),
        }
    }

    fn adopt_port(&self, port: u16) {
        let old = self.remote_port.swap(port, Ordering::SeqCst);
        if old != port {
            warn!("Server assigned alternative port {port} (requested: {old})");
            if let Some(callback) = self.port_callback.lock().expect("callback lock").as_ref() {
                callback(port);
            }
        }
    }

    /// Register with the server and start the control loop.
    ///
    /// On an `ERROR` reply the registration restarts on a fresh random
    /// remote port; on anything that is not a `CONNECTED` line it fails.
    pub async fn start(self: &Arc<Self>) -> Result<(), DirectError> {
        if self.control.lock().await.is_some() {
            return Err(DirectError::AlreadyRunning);
        }
        self.stop_tx.send_replace(false);

        let server = format!("{}:{}", self.server_addr, self.control_port);
        loop {
            if self.auth_token.is_some() {
                info!(
                    "Establishing authenticated outbound control connection to server on port {}",
                    self.control_port
                );
            } else {
                info!(
                    "Establishing outbound control connection to server on port {}",
                    self.control_port
                );
            }

            let mut stream = match tokio::time::timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect(&server),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(DirectError::Connect(format!(
                        "failed to connect to server: {e}"
                    )))
                }
                Err(_) => {
                    return Err(DirectError::Connect(
                        "failed to connect to server: connection timed out".to_string(),
                    ))
                }
            };

            let line = self.registration_line(TRAILER_FORWARD);
            stream
                .write_all(line.as_bytes())
                .await
                .map_err(|e| DirectError::Handshake(format!("failed to send registration: {e}")))?;

            // SSH targets get a bigger handshake buffer; their banners and
            // key exchange can ride in right behind the reply.
            let buffer_size = if target_port(&self.target_addr) == Some(22) {
                SSH_HANDSHAKE_BUFFER
            } else {
                HANDSHAKE_BUFFER
            };
            let mut buf = vec![0u8; buffer_size];
            let n = match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => n,
                Ok(Ok(_)) => {
                    return Err(DirectError::Handshake(
                        "server closed connection during handshake".to_string(),
                    ))
                }
                Ok(Err(e)) => {
                    return Err(DirectError::Handshake(format!(
                        "failed to read response from server: {e}"
                    )))
                }
                Err(_) => {
                    return Err(DirectError::Handshake(
                        "timed out waiting for handshake response".to_string(),
                    ))
                }
            };

            let response = String::from_utf8_lossy(&buf[..n]).to_string();
            match parse_handshake(&response) {
                HandshakeReply::Error(reason) => {
                    warn!("Server error response: {reason}. Will try with a different port");
                    drop(stream);
                    tokio::time::sleep(ERROR_RETRY_PAUSE).await;
                    let fresh = rand::thread_rng().gen_range(REMOTE_PORT_RANGE);
                    self.remote_port.store(fresh, Ordering::SeqCst);
                    info!("Trying with new random port: {fresh}");
                    continue;
                }
                HandshakeReply::ConnectedPort(port) => self.adopt_port(port),
                HandshakeReply::Connected => {}
                HandshakeReply::Unexpected(text) => {
                    return Err(DirectError::UnexpectedHandshake(text));
                }
            }

            *self.control.lock().await = Some(stream);
            break;
        }

        info!(
            "Tunnel active: {} -> {}:{}",
            self.target_addr,
            self.server_addr,
            self.remote_port()
        );
        debug!("Outbound IP: {}", self.outbound_ip().await);

        let tunnel = Arc::clone(self);
        tokio::spawn(async move { tunnel.control_loop().await });
        Ok(())
    }

    /// Stop the tunnel: raise the stop flag and close the registration
    /// connection so in-flight reads return promptly.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let mut control = self.control.lock().await;
        if control.take().is_some() {
            info!(
                "Stopping tunnel to {} (remote port: {})",
                self.server_addr,
                self.remote_port()
            );
        }
    }

    /// Source IP the server would see from this client.
    pub async fn outbound_ip(&self) -> std::net::IpAddr {
        let local = self
            .control
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.local_addr().ok());
        crate::util::outbound_ip(local)
    }

    /// Maintain the control-loop connection: register with the
    /// `CONTROL_CONNECTION` trailer, serve one reverse request, reconnect.
    /// Ends only when `stop` is called.
    async fn control_loop(self: Arc<Self>) {
        let server = format!("{}:{}", self.server_addr, self.control_port);
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                info!("Stopping control connection loop");
                return;
            }

            let mut control =
                match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&server)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        if *stop_rx.borrow() {
                            return;
                        }
                        let delay = if is_unreachable(&e) {
                            warn!("Server may be unavailable, waiting longer before retrying");
                            UNREACHABLE_RETRY_DELAY
                        } else {
                            RETRY_DELAY
                        };
                        error!(
                            "Failed to establish control connection: {e}. Retrying in {}s",
                            delay.as_secs()
                        );
                        if wait_or_stop(delay, &mut stop_rx).await {
                            return;
                        }
                        continue;
                    }
                    Err(_) => {
                        error!(
                            "Control connection attempt timed out. Retrying in {}s",
                            RETRY_DELAY.as_secs()
                        );
                        if wait_or_stop(RETRY_DELAY, &mut stop_rx).await {
                            return;
                        }
                        continue;
                    }
                };

            let line = self.registration_line(TRAILER_CONTROL);
            if let Err(e) = control.write_all(line.as_bytes()).await {
                error!("Failed to send control registration: {e}");
                if wait_or_stop(RETRY_DELAY, &mut stop_rx).await {
                    return;
                }
                continue;
            }

            let mut buf = vec![0u8; 1024];
            let n = match tokio::time::timeout(CONTROL_READ_TIMEOUT, control.read(&mut buf)).await
            {
                Ok(Ok(n)) if n > 0 => n,
                Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                    warn!("Server closed control connection during registration, retrying");
                    if wait_or_stop(RETRY_DELAY, &mut stop_rx).await {
                        return;
                    }
                    continue;
                }
            };

            let response = String::from_utf8_lossy(&buf[..n]).to_string();
            match parse_handshake(&response) {
                HandshakeReply::ConnectedPort(port) => self.adopt_port(port),
                HandshakeReply::Connected => {}
                HandshakeReply::Error(_) | HandshakeReply::Unexpected(_) => {
                    warn!("Unexpected response from server: {}", response.trim());
                    if wait_or_stop(RETRY_DELAY, &mut stop_rx).await {
                        return;
                    }
                    continue;
                }
            }

            self.serve_reverse_request(control).await;

            if *stop_rx.borrow() {
                return;
            }
            info!("Control connection lost, reconnecting...");
            if wait_or_stop(RETRY_DELAY, &mut stop_rx).await {
                return;
            }
        }
    }

    /// One reverse request: `CONNECT:{host}:{port}` → dial, confirm,
    /// splice until both directions hit EOF.
    async fn serve_reverse_request(&self, mut control: TcpStream) {
        let mut buf = vec![0u8; 1024];
        let n = match control.read(&mut buf).await {
            Ok(n) if n > 0 => n,
            Ok(_) => return,
            Err(e) => {
                error!("Failed to read from control connection: {e}");
                return;
            }
        };

        let request = String::from_utf8_lossy(&buf[..n]).to_string();
        let request = request.trim();

        let Some(rest) = request.strip_prefix("CONNECT:") else {
            error!("Unknown control request: {request}");
            let _ = control.write_all(b"ERROR:Unknown request").await;
            return;
        };

        let mut parts = rest.splitn(2, ':');
        let host = parts.next().unwrap_or("");
        let port = parts.next().unwrap_or("");
        if host.is_empty() || port.is_empty() {
            error!("Invalid CONNECT request format: {request}");
            let _ = control.write_all(b"ERROR:Invalid request format").await;
            return;
        }

        let target = format!("{host}:{port}");
        info!("Connecting to target {target} as requested by server");
        let target_conn = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Failed to connect to target {target}: {e}");
                let _ = control.write_all(format!("ERROR:{e}").as_bytes()).await;
                return;
            }
            Err(_) => {
                error!("Timed out connecting to target {target}");
                let _ = control.write_all(b"ERROR:connection timed out").await;
                return;
            }
        };

        if control.write_all(b"OK").await.is_err() {
            return;
        }

        tune_stream(&control, SPLICE_BUFFER, KEEPALIVE_PERIOD);
        tune_stream(&target_conn, SPLICE_BUFFER, KEEPALIVE_PERIOD);

        splice(control, target_conn).await;
    }
}

/// Sleep, but wake early on stop. Returns true when stopped.
async fn wait_or_stop(delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        _ = stop_rx.changed() => *stop_rx.borrow(),
    }
}

/// Symmetric byte splice: two unidirectional copiers, each closing the
/// peer's write half on EOF.
pub(crate) async fn splice(a: TcpStream, b: TcpStream) {
    let (mut a_read, mut a_write) = a.into_split();
    let (mut b_read, mut b_write) = b.into_split();

    let forward = tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut a_read, &mut b_write).await {
            debug!("Splice copy ended: {e}");
        }
        let _ = b_write.shutdown().await;
    });
    let backward = tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut b_read, &mut a_write).await {
            debug!("Splice copy ended: {e}");
        }
        let _ = a_write.shutdown().await;
    });

    let _ = tokio::join!(forward, backward);
}

// ── Repository ───────────────────────────────────────────────────────

struct DirectEntry {
    tunnel: Tunnel,
    instance: Arc<DirectTunnel>,
}

/// Tunnel store for direct-TCP mode: one [`DirectTunnel`] per record.
/// Data transfer happens inside the splices, so the repository itself
/// never moves bytes.
pub struct DirectRepository {
    config: Arc<Config>,
    tunnels: RwLock<HashMap<String, DirectEntry>>,
}

impl DirectRepository {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            tunnels: RwLock::new(HashMap::new()),
        })
    }

    /// Mint a tunnel id, pick a remote port when none was requested, and
    /// start a direct tunnel instance for it.
    pub async fn register(&self, mut config: TunnelConfig) -> Result<Tunnel, DirectError> {
        config.tunnel_type = TunnelType::Tcp;
        if config.local_addr.is_empty() {
            config.local_addr = "127.0.0.1".to_string();
        }
        if config.remote_port == 0 {
            config.remote_port = rand::thread_rng().gen_range(REMOTE_PORT_RANGE);
            info!("Using random port {} for tunnel", config.remote_port);
        }

        let id = format!("tunnel-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let token = (self.config.auth_enabled && !self.config.auth_token.is_empty())
            .then(|| self.config.auth_token.clone());

        let instance = DirectTunnel::new(
            self.config.server_address.clone(),
            self.config.control_port,
            config.local_target(),
            config.remote_port,
            token,
        );
        instance.start().await?;

        let mut tunnel = Tunnel::new(id.clone(), config);
        tunnel.set_tcp_info(instance.remote_port());

        self.tunnels.write().await.insert(
            id,
            DirectEntry {
                tunnel: tunnel.clone(),
                instance,
            },
        );
        Ok(tunnel)
    }

    /// Stop the instance and drop the record.
    pub async fn unregister(&self, tunnel_id: &str) -> Result<(), DirectError> {
        match self.tunnels.write().await.remove(tunnel_id) {
            Some(entry) => {
                entry.instance.stop().await;
                info!("Tunnel removed: {tunnel_id}");
                Ok(())
            }
            None => {
                warn!("Tunnel not found: {tunnel_id}");
                Err(DirectError::NotFound(tunnel_id.to_string()))
            }
        }
    }

    /// All records, with `remote_port` refreshed from the live instance
    /// (the server may have reassigned it after a reconnect).
    pub async fn get_all(&self) -> Vec<Tunnel> {
        self.tunnels
            .read()
            .await
            .values()
            .map(|entry| {
                let mut tunnel = entry.tunnel.clone();
                tunnel.set_tcp_info(entry.instance.remote_port());
                tunnel
            })
            .collect()
    }

    pub async fn get_by_id(&self, tunnel_id: &str) -> Option<Tunnel> {
        self.tunnels.read().await.get(tunnel_id).map(|entry| {
            let mut tunnel = entry.tunnel.clone();
            tunnel.set_tcp_info(entry.instance.remote_port());
            tunnel
        })
    }

    /// Install the port-change callback on a live instance.
    pub async fn set_port_change_callback(
        &self,
        tunnel_id: &str,
        callback: PortChangeCallback,
    ) -> bool {
        match self.tunnels.read().await.get(tunnel_id) {
            Some(entry) => {
                entry.instance.set_port_change_callback(callback);
                true
            }
            None => false,
        }
    }

    /// Bytes flow through the splices; nothing to do here.
    pub fn send_data(&self, tunnel_id: &str, connection_id: &str, data: &[u8]) {
        debug!(
            "send_data is a no-op in direct-TCP mode (tunnel {tunnel_id}, connection {connection_id}, {} bytes)",
            data.len()
        );
    }

    /// Bytes flow through the splices; nothing to do here.
    pub fn handle_data(&self, tunnel_id: &str, connection_id: &str, data: &[u8]) {
        debug!(
            "handle_data is a no-op in direct-TCP mode (tunnel {tunnel_id}, connection {connection_id}, {} bytes)",
            data.len()
        );
    }

    /// Stop every instance; used at shutdown.
    pub async fn stop_all(&self) {
        let mut tunnels = self.tunnels.write().await;
        for (id, entry) in tunnels.drain() {
            info!("Stopping tunnel {id}");
            entry.instance.stop().await;
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum DirectError {
    AlreadyRunning,
    Connect(String),
    Handshake(String),
    /// The handshake reply was neither `CONNECTED` nor `ERROR`.
    UnexpectedHandshake(String),
    NotFound(String),
}

impl std::fmt::Display for DirectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectError::AlreadyRunning => write!(f, "tunnel is already running"),
            DirectError::Connect(e) => write!(f, "{e}"),
            DirectError::Handshake(e) => write!(f, "{e}"),
            DirectError::UnexpectedHandshake(text) => {
                write!(f, "unexpected response from server: {text}")
            }
            DirectError::NotFound(id) => write!(f, "tunnel not found: {id}"),
        }
    }
}

impl std::error::Error for DirectError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn handshake_replies_parse() {
        assert_eq!(
            parse_handshake("CONNECTED:20777"),
            HandshakeReply::ConnectedPort(20777)
        );
        assert_eq!(parse_handshake("CONNECTED"), HandshakeReply::Connected);
        assert_eq!(parse_handshake("CONNECTED:abc"), HandshakeReply::Connected);
        assert_eq!(parse_handshake("OK CONNECTED\n"), HandshakeReply::Connected);
        assert_eq!(
            parse_handshake("ERROR:port in use"),
            HandshakeReply::Error("ERROR:port in use".into())
        );
        assert_eq!(
            parse_handshake("HELLO"),
            HandshakeReply::Unexpected("HELLO".into())
        );
    }

    #[test]
    fn unreachable_errors_classified() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "boom");
        assert!(is_unreachable(&refused));
        let no_route = std::io::Error::new(std::io::ErrorKind::Other, "no route to host");
        assert!(is_unreachable(&no_route));
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(!is_unreachable(&reset));
    }

    #[test]
    fn registration_lines_follow_wire_format() {
        let plain = DirectTunnel::new("relay.example.net", 7000, "127.0.0.1:22", 2222, None);
        assert_eq!(
            plain.registration_line(TRAILER_FORWARD),
            "127.0.0.1:22:2222:DIRECT_TCP_FORWARD"
        );
        let authed = DirectTunnel::new(
            "relay.example.net",
            7000,
            "127.0.0.1:22",
            2222,
            Some("hxp_tok".into()),
        );
        assert_eq!(
            authed.registration_line(TRAILER_CONTROL),
            "AUTH_TOKEN=hxp_tok:127.0.0.1:22:2222:CONTROL_CONNECTION"
        );
    }

    /// Relay stub: answers registration connections from a scripted queue
    /// and reports each received line.
    async fn scripted_relay(
        replies: Vec<&'static str>,
    ) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut replies = replies.into_iter();
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 1024];
                let Ok(n) = socket.read(&mut buf).await else {
                    continue;
                };
                let _ = line_tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                let reply = replies.next().unwrap_or("CONNECTED");
                let _ = socket.write_all(reply.as_bytes()).await;
                // Park the socket; dropping it here would race the client's
                // handshake read.
                tokio::spawn(async move {
                    let mut hold = vec![0u8; 16];
                    let _ = socket.read(&mut hold).await;
                });
            }
        });
        (port, line_rx)
    }

    #[tokio::test]
    async fn port_reassignment_adopts_and_fires_callback_once() {
        let (port, mut lines) = scripted_relay(vec!["CONNECTED:20777", "CONNECTED:20777"]).await;
        let tunnel = DirectTunnel::new("127.0.0.1", port, "127.0.0.1:5432", 20000, None);
        let fired = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(AtomicU16::new(0));
        let fired_in_cb = Arc::clone(&fired);
        let seen_in_cb = Arc::clone(&seen);
        tunnel.set_port_change_callback(Box::new(move |new_port| {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
            seen_in_cb.store(new_port, Ordering::SeqCst);
        }));

        tunnel.start().await.unwrap();
        assert_eq!(tunnel.remote_port(), 20777);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 20777);

        let first = lines.recv().await.unwrap();
        assert_eq!(first, "127.0.0.1:5432:20000:DIRECT_TCP_FORWARD");

        // The control loop re-registers with the adopted port; the same
        // assignment must not fire the callback again.
        let second = lines.recv().await.unwrap();
        assert_eq!(second, "127.0.0.1:5432:20777:CONTROL_CONNECTION");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tunnel.stop().await;
    }

    #[tokio::test]
    async fn error_reply_retries_on_fresh_random_port() {
        let (port, mut lines) = scripted_relay(vec!["ERROR:port already allocated"]).await;
        let tunnel = DirectTunnel::new("127.0.0.1", port, "127.0.0.1:8080", 20000, None);
        tunnel.start().await.unwrap();

        let first = lines.recv().await.unwrap();
        assert_eq!(first, "127.0.0.1:8080:20000:DIRECT_TCP_FORWARD");
        let second = lines.recv().await.unwrap();
        assert!(second.ends_with(":DIRECT_TCP_FORWARD"));
        assert_ne!(first, second);

        let adopted = tunnel.remote_port();
        assert!((10_000..30_000).contains(&adopted));
        assert_ne!(adopted, 20000);
        tunnel.stop().await;
    }

    #[tokio::test]
    async fn junk_handshake_is_fatal() {
        let (port, _lines) = scripted_relay(vec!["HTTP/1.1 400 Bad Request"]).await;
        let tunnel = DirectTunnel::new("127.0.0.1", port, "127.0.0.1:8080", 20000, None);
        assert!(matches!(
            tunnel.start().await,
            Err(DirectError::UnexpectedHandshake(_))
        ));
    }

    #[tokio::test]
    async fn reverse_connect_splices_to_target() {
        // Echo target standing in for the local service.
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Relay: accept registration, then drive one reverse CONNECT over
        // the control-loop connection and assert the spliced echo.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = listener.local_addr().unwrap().port();
        let relay = tokio::spawn(async move {
            // Registration connection.
            let (mut reg, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = reg.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).ends_with(":DIRECT_TCP_FORWARD"));
            reg.write_all(b"CONNECTED").await.unwrap();

            // Control-loop connection.
            let (mut ctl, _) = listener.accept().await.unwrap();
            let n = ctl.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).ends_with(":CONTROL_CONNECTION"));
            ctl.write_all(b"CONNECTED").await.unwrap();

            ctl.write_all(format!("CONNECT:127.0.0.1:{echo_port}").as_bytes())
                .await
                .unwrap();
            let n = ctl.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"OK");

            ctl.write_all(b"ping through the tunnel").await.unwrap();
            let mut echoed = Vec::new();
            while echoed.len() < b"ping through the tunnel".len() {
                let n = ctl.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                echoed.extend_from_slice(&buf[..n]);
            }
            assert_eq!(echoed, b"ping through the tunnel");
            reg
        });

        let tunnel = DirectTunnel::new("127.0.0.1", relay_port, "127.0.0.1:9999", 20000, None);
        tunnel.start().await.unwrap();
        let _reg = relay.await.unwrap();
        tunnel.stop().await;
    }

    #[tokio::test]
    async fn repository_mints_ids_and_ports() {
        let (port, _lines) = scripted_relay(vec!["CONNECTED"]).await;
        let mut config = Config::default();
        config.server_address = "127.0.0.1".into();
        config.control_port = port;
        let repo = DirectRepository::new(Arc::new(config));

        let tunnel_config: TunnelConfig =
            toml::from_str("type = \"tcp\"\nlocal_port = 5432").unwrap();
        let tunnel = repo.register(tunnel_config).await.unwrap();
        assert!(tunnel.id.starts_with("tunnel-"));
        assert!((10_000..30_000).contains(&tunnel.remote_port));
        assert!(tunnel.active);

        let fetched = repo.get_by_id(&tunnel.id).await.unwrap();
        assert_eq!(fetched.remote_port, tunnel.remote_port);
        assert_eq!(repo.get_all().await.len(), 1);

        repo.unregister(&tunnel.id).await.unwrap();
        assert!(repo.get_by_id(&tunnel.id).await.is_none());
        assert!(matches!(
            repo.unregister(&tunnel.id).await,
            Err(DirectError::NotFound(_))
        ));
    }
}
