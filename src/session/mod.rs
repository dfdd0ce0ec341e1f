//! WebSocket session transport.
//!
//! One [`Session`] is one long-lived framed duplex channel to the server's
//! `/control` endpoint. The write half lives under a mutex; a dedicated
//! read pump decodes frames and routes them by message type to registered
//! handlers. Two background activities keep the session alive: a 30 s
//! keepalive ping and a reconnect supervisor that re-dials (re-running
//! token validation) whenever the connected flag drops.
//!
//! Token validation failures are fatal: the reconnect supervisor will not
//! loop on a token the server has already rejected.

pub mod http_proxy;
pub mod registry;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use crate::auth::{AuthData, AuthError, AuthValidator};
use crate::backoff::Backoff;
use crate::config::Config;
use crate::protocol::{
    AuthPayload, DataPayload, ErrorPayload, Message, MessageType, ProtocolError, RegisterPayload,
    RegisterResponsePayload, UnregisterPayload,
};
use crate::tunnel::TunnelConfig;

/// Interval between keepalive pings.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Poll interval of the reconnect supervisor.
const RECONNECT_POLL: Duration = Duration::from_secs(1);
/// Wait between failed reconnect attempts.
const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Overall deadline of a `register` RPC.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsFrame>;

/// Boxed async message handler, registered per message type.
pub type HandlerFuture = futures_util::future::BoxFuture<'static, Result<(), SessionError>>;
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// One control session to the server.
pub struct Session {
    config: Arc<Config>,
    validator: AuthValidator,
    /// Write half of the socket; `None` while disconnected.
    sink: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    /// Set when the token was rejected; blocks further reconnects.
    fatal_auth: AtomicBool,
    /// Serializes concurrent `connect` calls.
    connect_lock: Mutex<()>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    user: RwLock<Option<AuthData>>,
    subdomain: RwLock<String>,
    send_retry: Backoff,
}

impl Session {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let validator = AuthValidator::new(config.validation_url());
        Arc::new(Self {
            config,
            validator,
            sink: Mutex::new(None),
            connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            fatal_auth: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
            handlers: RwLock::new(HashMap::new()),
            user: RwLock::new(None),
            subdomain: RwLock::new(String::new()),
            send_retry: Backoff::exponential(
                Duration::from_millis(100),
                Duration::from_secs(2),
                3,
            ),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Account record from the last successful token validation.
    #[must_use]
    pub fn user_data(&self) -> Option<AuthData> {
        self.user.read().expect("user lock").clone()
    }

    /// Tunnel quota from the cached account record: `(reached, used,
    /// limit)`. `None` when no validation has happened yet.
    #[must_use]
    pub fn check_tunnel_limit(&self) -> Option<(bool, i64, i64)> {
        self.user_data().map(|d| d.tunnel_limit_reached())
    }

    #[must_use]
    pub fn subdomain(&self) -> String {
        self.subdomain.read().expect("subdomain lock").clone()
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Establish the session: validate the token (when auth is enabled),
    /// dial the WebSocket, send the `auth` frame, start the read pump.
    /// Idempotent while connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        if self.config.auth_enabled && !self.config.auth_token.is_empty() {
            info!("Validating authentication token...");
            let response = match self.validator.validate(&self.config.auth_token).await {
                Ok(r) => r,
                Err(e) => {
                    if e.is_admission() {
                        self.fatal_auth.store(true, Ordering::SeqCst);
                    }
                    error!("Failed to validate token: {e}");
                    return Err(SessionError::Auth(e));
                }
            };
            let data = response.data;
            info!("Token validated for user: {} ({})", data.fullname, data.email);
            let (_, used, limit) = data.tunnel_limit_reached();
            info!(
                "Subscription: {}, tunnel limit: {used}/{limit}",
                data.subscription.name
            );
            *self.user.write().expect("user lock") = Some(data);
        }

        let url = self.config.control_url();
        info!("Connecting to server: {url}");
        let connector = self.tls_connector()?;
        let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            connector,
        )
        .await
        .map_err(|e| SessionError::Connect(e.to_string()))?;

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        if self.config.auth_enabled {
            let auth = Message::new(
                MessageType::Auth,
                &AuthPayload {
                    token: self.config.auth_token.clone(),
                },
            )?;
            if let Err(e) = self.send(&auth).await {
                error!("Failed to send authentication message: {e}");
                self.close().await;
                return Err(e);
            }
        }

        let session = Arc::clone(self);
        tokio::spawn(async move { session.read_pump(stream).await });

        info!("Connected to server: {url}");
        Ok(())
    }

    /// Drop the socket and clear the connected flag. Safe to call twice.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            info!("Closing connection");
            let _ = sink.close().await;
        }
    }

    /// Start the keepalive ticker and the reconnect supervisor. Called
    /// once; later calls are no-ops.
    pub fn run_with_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if session.fatal_auth.load(Ordering::SeqCst) {
                    warn!("Not reconnecting: authentication token was rejected");
                    return;
                }
                if !session.is_connected() {
                    info!("Reconnecting to server...");
                    if let Err(e) = session.connect().await {
                        error!("Failed to reconnect: {e}");
                        tokio::time::sleep(RECONNECT_RETRY_DELAY).await;
                        continue;
                    }
                }
                tokio::time::sleep(RECONNECT_POLL).await;
            }
        });

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if session.is_connected() {
                    let ping = Message::without_payload(MessageType::Ping);
                    if let Err(e) = session.send(&ping).await {
                        error!("Failed to send ping: {e}");
                        session.close().await;
                    }
                }
            }
        });
    }

    fn tls_connector(&self) -> Result<Option<Connector>, SessionError> {
        if !self.config.tls_enabled {
            return Ok(None);
        }
        let mut builder = native_tls::TlsConnector::builder();
        if !self.config.tls_cert.is_empty() && !self.config.tls_key.is_empty() {
            let cert = std::fs::read(&self.config.tls_cert)
                .map_err(|e| SessionError::Tls(format!("failed to read certificate: {e}")))?;
            let key = std::fs::read(&self.config.tls_key)
                .map_err(|e| SessionError::Tls(format!("failed to read key: {e}")))?;
            let identity = native_tls::Identity::from_pkcs8(&cert, &key)
                .map_err(|e| SessionError::Tls(format!("failed to load identity: {e}")))?;
            builder.identity(identity);
        } else {
            // No client certificate configured: the relay usually fronts a
            // self-signed endpoint, so peer verification is skipped.
            builder.danger_accept_invalid_certs(true);
        }
        let connector = builder
            .build()
            .map_err(|e| SessionError::Tls(e.to_string()))?;
        Ok(Some(Connector::NativeTls(connector)))
    }

    // ── Read pump and dispatch ───────────────────────────────────────

    async fn read_pump(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    error!("Failed to read message: {e}");
                    break;
                }
            };
            match frame {
                WsFrame::Text(text) => {
                    let msg = match Message::from_text(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            error!("Failed to parse message: {e}");
                            continue;
                        }
                    };
                    if msg.message_type == MessageType::Pong {
                        continue;
                    }
                    let handler = self
                        .handlers
                        .read()
                        .expect("handlers lock")
                        .get(&msg.message_type)
                        .cloned();
                    match handler {
                        Some(handler) => {
                            let message_type = msg.message_type;
                            if let Err(e) = handler(msg).await {
                                error!("Error handling {message_type} message: {e}");
                            }
                        }
                        None => warn!("No handler for message type: {}", msg.message_type),
                    }
                }
                WsFrame::Close(_) => break,
                _ => {}
            }
        }
        self.close().await;
    }

    /// Install the handler for a message type, replacing any previous one.
    pub fn register_handler<F, Fut>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |msg| -> HandlerFuture { Box::pin(handler(msg)) });
        self.handlers
            .write()
            .expect("handlers lock")
            .insert(message_type, handler);
    }

    pub fn remove_handler(&self, message_type: MessageType) {
        self.handlers
            .write()
            .expect("handlers lock")
            .remove(&message_type);
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Serialize and write one frame under the sink mutex. A failed write
    /// marks the session as disconnected; the caller must not reuse it.
    pub async fn send(&self, msg: &Message) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let text = msg.to_text()?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SessionError::NotConnected)?;
        if let Err(e) = sink.send(WsFrame::Text(text.into())).await {
            self.connected.store(false, Ordering::SeqCst);
            *guard = None;
            return Err(SessionError::SendFailed(e.to_string()));
        }
        Ok(())
    }

    /// `data` frame for one tunneled connection, with bounded retry.
    pub async fn send_data(
        &self,
        tunnel_id: &str,
        connection_id: &str,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let payload = DataPayload {
            tunnel_id: tunnel_id.to_string(),
            connection_id: connection_id.to_string(),
            data: data.to_vec(),
        };
        self.send_retry
            .retry(|| async {
                let msg = Message::new(MessageType::Data, &payload)?;
                self.send(&msg).await
            })
            .await
            .map_err(|e| SessionError::SendFailed(e.to_string()))
    }

    // ── RPCs ─────────────────────────────────────────────────────────

    /// Register a tunnel and block for the server's answer.
    ///
    /// `register` and `error` handlers are installed for the duration of
    /// this one call; concurrent registrations on the same session are not
    /// supported. Times out after 10 s.
    pub async fn send_register_tunnel(
        &self,
        config: &TunnelConfig,
    ) -> Result<RegisterResponsePayload, SessionError> {
        *self.subdomain.write().expect("subdomain lock") = config.subdomain.clone();

        let (tx, mut rx) = mpsc::channel::<Result<RegisterResponsePayload, SessionError>>(2);

        let reply_tx = tx.clone();
        self.register_handler(MessageType::Register, move |msg: Message| {
            let tx = reply_tx.clone();
            async move {
                let response = msg.parse_payload::<RegisterResponsePayload>()?;
                let _ = tx.send(Ok(response)).await;
                Ok(())
            }
        });
        self.register_handler(MessageType::Error, move |msg: Message| {
            let tx = tx.clone();
            async move {
                let payload = msg.parse_payload::<ErrorPayload>()?;
                let _ = tx
                    .send(Err(SessionError::Remote {
                        code: payload.code,
                        message: payload.message,
                    }))
                    .await;
                Ok(())
            }
        });

        let payload = RegisterPayload {
            tunnel_type: config.tunnel_type,
            subdomain: config.subdomain.clone(),
            local_addr: config.local_addr.clone(),
            local_port: config.local_port,
            remote_port: config.remote_port,
            auth: config.auth.clone(),
        };

        let result = async {
            let msg = Message::new(MessageType::Register, &payload)?;
            self.send(&msg).await?;
            match tokio::time::timeout(REGISTER_TIMEOUT, rx.recv()).await {
                Ok(Some(Ok(response))) => {
                    if response.success {
                        Ok(response)
                    } else {
                        Err(SessionError::RegistrationFailed(response.error))
                    }
                }
                Ok(Some(Err(e))) => Err(e),
                Ok(None) | Err(_) => Err(SessionError::Timeout),
            }
        }
        .await;

        self.remove_handler(MessageType::Register);
        self.remove_handler(MessageType::Error);
        result
    }

    /// Ask the server to drop a tunnel. Fire-and-forget on the wire.
    pub async fn send_unregister_tunnel(&self, tunnel_id: &str) -> Result<(), SessionError> {
        let msg = Message::new(
            MessageType::Unregister,
            &UnregisterPayload {
                tunnel_id: tunnel_id.to_string(),
            },
        )?;
        self.send(&msg).await
    }
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SessionError {
    NotConnected,
    Connect(String),
    Tls(String),
    Auth(AuthError),
    Protocol(ProtocolError),
    SendFailed(String),
    Timeout,
    /// An `error` frame from the server.
    Remote { code: String, message: String },
    RegistrationFailed(String),
    /// A `data` frame referenced a tunnel this registry does not hold.
    UnknownTunnel(String),
    /// The local service could not be dialed or written.
    LocalService(String),
}

impl SessionError {
    /// Admission errors must not trigger a reconnect with the same token.
    #[must_use]
    pub fn is_admission(&self) -> bool {
        matches!(self, SessionError::Auth(e) if e.is_admission())
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotConnected => write!(f, "not connected to server"),
            SessionError::Connect(e) => write!(f, "failed to connect to server: {e}"),
            SessionError::Tls(e) => write!(f, "TLS setup failed: {e}"),
            SessionError::Auth(e) => write!(f, "{e}"),
            SessionError::Protocol(e) => write!(f, "{e}"),
            SessionError::SendFailed(e) => write!(f, "failed to send message: {e}"),
            SessionError::Timeout => write!(f, "timeout waiting for registration response"),
            SessionError::Remote { code, message } => {
                write!(f, "error from server: {code} - {message}")
            }
            SessionError::RegistrationFailed(e) => write!(f, "tunnel registration failed: {e}"),
            SessionError::UnknownTunnel(id) => write!(f, "tunnel with ID {id} not found"),
            SessionError::LocalService(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<AuthError> for SessionError {
    fn from(e: AuthError) -> Self {
        SessionError::Auth(e)
    }
}
