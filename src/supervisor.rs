//! Tunnel supervisor: the thin orchestrator over both backends.
//!
//! HTTP tunnels ride the WebSocket session (token validation, quota
//! check, registry registration). TCP tunnels always go direct-TCP, and
//! always validate the token first — even when `auth_enabled` is off — so
//! a missing token is a configuration error caught before any network
//! I/O. Admission and configuration failures surface to the caller with a
//! user-facing hint; they are never retried.

use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::{AuthData, AuthError, AuthValidator};
use crate::config::{Config, ConnectionMode};
use crate::direct::{DirectError, DirectRepository, PortChangeCallback};
use crate::session::http_proxy::HttpProxy;
use crate::session::registry::TunnelRegistry;
use crate::session::{Session, SessionError};
use crate::tunnel::{Tunnel, TunnelAuth, TunnelConfig, TunnelType};

/// The WebSocket-backed half: session, registry, HTTP request proxy.
struct WebSocketBackend {
    session: Arc<Session>,
    registry: Arc<TunnelRegistry>,
    /// Held so the `http_request` handler stays installed.
    _http_proxy: Arc<HttpProxy>,
}

/// Owns tunnel lifecycle across both connection modes.
pub struct TunnelSupervisor {
    config: Arc<Config>,
    validator: AuthValidator,
    /// Present in websocket mode.
    websocket: Option<WebSocketBackend>,
    /// Always available; TCP tunnels force direct-TCP mode.
    direct: Arc<DirectRepository>,
}

impl TunnelSupervisor {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let validator = AuthValidator::new(config.validation_url());
        let websocket = match config.connection_mode {
            ConnectionMode::Websocket => {
                let session = Session::new(Arc::clone(&config));
                let registry = TunnelRegistry::new(Arc::clone(&session));
                let http_proxy = HttpProxy::new(Arc::clone(&session));
                Some(WebSocketBackend {
                    session,
                    registry,
                    _http_proxy: http_proxy,
                })
            }
            ConnectionMode::DirectTcp => None,
        };
        let direct = DirectRepository::new(Arc::clone(&config));
        Self {
            config,
            validator,
            websocket,
            direct,
        }
    }

    // ── Creation ─────────────────────────────────────────────────────

    /// Create an HTTP tunnel over the WebSocket session and return the
    /// record with its public URL populated.
    pub async fn create_http_tunnel(
        &self,
        local_port: u16,
        subdomain: &str,
        auth: Option<TunnelAuth>,
    ) -> Result<Tunnel, TunnelError> {
        if local_port == 0 {
            return Err(TunnelError::Config(
                "local port must be greater than 0".to_string(),
            ));
        }
        let backend = self.websocket.as_ref().ok_or_else(|| {
            TunnelError::Config(
                "HTTP tunnels require connection_mode = \"websocket\"".to_string(),
            )
        })?;

        info!("Creating HTTP tunnel for local port {local_port} with subdomain {subdomain}");

        if !backend.session.is_connected() {
            backend.session.connect().await.map_err(map_session)?;
        }
        self.enforce_quota(backend.session.user_data().as_ref())?;

        let tunnel_config = TunnelConfig {
            name: String::new(),
            tunnel_type: TunnelType::Http,
            local_port,
            local_addr: "127.0.0.1".to_string(),
            subdomain: subdomain.to_string(),
            remote_port: 0,
            auth,
        };
        let tunnel = backend
            .registry
            .register(tunnel_config)
            .await
            .map_err(map_session)?;

        info!(
            "HTTP tunnel created successfully with URL: {}",
            tunnel.url.as_deref().unwrap_or("<none>")
        );

        backend.session.run_with_reconnect();
        Ok(tunnel)
    }

    /// Create a TCP tunnel over direct-TCP. The token is validated even
    /// when `auth_enabled` is off; an empty token fails before any
    /// network I/O.
    pub async fn create_tcp_tunnel(&self, mut config: TunnelConfig) -> Result<Tunnel, TunnelError> {
        if config.local_port == 0 {
            return Err(TunnelError::Config(
                "local port must be greater than 0".to_string(),
            ));
        }
        if self.config.connection_mode != ConnectionMode::DirectTcp {
            warn!(
                "Changing connection mode from {} to direct_tcp for TCP tunnel",
                self.config.connection_mode
            );
        }

        if self.config.auth_token.is_empty() {
            return Err(TunnelError::Config(
                "authentication token is required to create a TCP tunnel".to_string(),
            ));
        }

        let response = self
            .validator
            .validate(&self.config.auth_token)
            .await
            .map_err(|e| {
                if e.is_admission() {
                    TunnelError::Admission(e.to_string())
                } else {
                    TunnelError::Validation(e)
                }
            })?;
        info!(
            "Token validated for user: {} ({})",
            response.data.fullname, response.data.email
        );
        self.enforce_quota(Some(&response.data))?;

        config.tunnel_type = TunnelType::Tcp;
        info!(
            "Creating TCP tunnel from {} with remote port {}",
            config.local_target(),
            config.remote_port
        );
        let tunnel = self
            .direct
            .register(config)
            .await
            .map_err(TunnelError::Direct)?;

        info!(
            "TCP tunnel created successfully with remote port: {}",
            tunnel.remote_port
        );
        Ok(tunnel)
    }

    fn enforce_quota(&self, user: Option<&AuthData>) -> Result<(), TunnelError> {
        if let Some(user) = user {
            let (reached, used, limit) = user.tunnel_limit_reached();
            if reached {
                return Err(TunnelError::Admission(format!(
                    "tunnel limit reached ({used}/{limit})"
                )));
            }
        }
        Ok(())
    }

    // ── Lifecycle and introspection ──────────────────────────────────

    /// Unregister a tunnel and stop its transport. Blocks at most for the
    /// unregister round-trip.
    pub async fn close_tunnel(&self, tunnel_id: &str) -> Result<(), TunnelError> {
        info!("Closing tunnel with ID: {tunnel_id}");
        if let Some(backend) = &self.websocket {
            if backend.registry.get_by_id(tunnel_id).await.is_some() {
                backend
                    .registry
                    .unregister(tunnel_id)
                    .await
                    .map_err(map_session)?;
                info!("Tunnel closed successfully: {tunnel_id}");
                return Ok(());
            }
        }
        if self.direct.get_by_id(tunnel_id).await.is_some() {
            self.direct
                .unregister(tunnel_id)
                .await
                .map_err(TunnelError::Direct)?;
            info!("Tunnel closed successfully: {tunnel_id}");
            return Ok(());
        }
        Err(TunnelError::NotFound(tunnel_id.to_string()))
    }

    pub async fn get_all_tunnels(&self) -> Vec<Tunnel> {
        let mut tunnels = match &self.websocket {
            Some(backend) => backend.registry.get_all().await,
            None => Vec::new(),
        };
        tunnels.extend(self.direct.get_all().await);
        tunnels
    }

    pub async fn get_tunnel_by_id(&self, tunnel_id: &str) -> Option<Tunnel> {
        if let Some(backend) = &self.websocket {
            if let Some(tunnel) = backend.registry.get_by_id(tunnel_id).await {
                return Some(tunnel);
            }
        }
        self.direct.get_by_id(tunnel_id).await
    }

    /// Watch a direct-TCP tunnel for server-side port reassignment.
    pub async fn set_port_change_callback(
        &self,
        tunnel_id: &str,
        callback: PortChangeCallback,
    ) -> bool {
        self.direct.set_port_change_callback(tunnel_id, callback).await
    }

    /// Tear everything down: close registered tunnels, stop direct
    /// instances, drop the session.
    pub async fn shutdown(&self) {
        for tunnel in self.get_all_tunnels().await {
            if let Err(e) = self.close_tunnel(&tunnel.id).await {
                warn!("Failed to close tunnel {}: {e}", tunnel.id);
            }
        }
        self.direct.stop_all().await;
        if let Some(backend) = &self.websocket {
            backend.session.close().await;
        }
    }
}

fn map_session(e: SessionError) -> TunnelError {
    if e.is_admission() {
        TunnelError::Admission(e.to_string())
    } else {
        TunnelError::Session(e)
    }
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum TunnelError {
    /// Bad or missing configuration; no network attempt was made.
    Config(String),
    /// Token rejected or quota exhausted; not retried.
    Admission(String),
    /// Token validation could not complete (network, bad endpoint).
    Validation(AuthError),
    Session(SessionError),
    Direct(DirectError),
    NotFound(String),
}

impl TunnelError {
    /// A short user-facing suggestion for recoverable categories.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            TunnelError::Config(_) => {
                Some("edit the configuration file (haxorport.toml) and fix the offending option")
            }
            TunnelError::Admission(_) => Some(
                "obtain a valid token from the dashboard, or reduce the number of active tunnels",
            ),
            TunnelError::Validation(_) => {
                Some("check that the validation endpoint is reachable and retry")
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::Config(e) => write!(f, "configuration error: {e}"),
            TunnelError::Admission(e) => write!(f, "{e}"),
            TunnelError::Validation(e) => write!(f, "{e}"),
            TunnelError::Session(e) => write!(f, "{e}"),
            TunnelError::Direct(e) => write!(f, "{e}"),
            TunnelError::NotFound(id) => write!(f, "tunnel not found: {id}"),
        }
    }
}

impl std::error::Error for TunnelError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ResourceLimit;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn direct_config(server_port: u16, token: &str) -> Arc<Config> {
        let mut config = Config::default();
        config.server_address = "127.0.0.1".into();
        config.control_port = server_port;
        config.connection_mode = ConnectionMode::DirectTcp;
        config.auth_token = token.into();
        config.auth_validation_url = format!("http://127.0.0.1:{server_port}/AuthToken/validate");
        Arc::new(config)
    }

    #[tokio::test]
    async fn empty_token_tcp_tunnel_fails_before_any_network_io() {
        // Any dial or HTTP request would hit this listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let touched = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&touched);
        tokio::spawn(async move {
            let _ = listener.accept().await;
            flag.store(true, Ordering::SeqCst);
        });

        let supervisor = TunnelSupervisor::new(direct_config(port, ""));
        let config: TunnelConfig =
            toml::from_str("type = \"tcp\"\nlocal_port = 22").unwrap();
        match supervisor.create_tcp_tunnel(config).await {
            Err(TunnelError::Config(msg)) => {
                assert!(msg.contains("token"));
            }
            other => panic!("expected Config error, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!touched.load(Ordering::SeqCst), "network I/O happened");
    }

    #[tokio::test]
    async fn http_tunnel_requires_websocket_mode() {
        let supervisor = TunnelSupervisor::new(direct_config(1, "hxp_tok"));
        match supervisor.create_http_tunnel(8080, "demo", None).await {
            Err(TunnelError::Config(msg)) => assert!(msg.contains("websocket")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_local_port_is_rejected() {
        let supervisor = TunnelSupervisor::new(direct_config(1, "hxp_tok"));
        let config: TunnelConfig = toml::from_str("type = \"tcp\"\nlocal_port = 0").unwrap();
        assert!(matches!(
            supervisor.create_tcp_tunnel(config).await,
            Err(TunnelError::Config(_))
        ));
    }

    #[test]
    fn quota_exhaustion_is_an_admission_error() {
        let supervisor = TunnelSupervisor::new(direct_config(1, "hxp_tok"));
        let mut user = AuthData::default();
        user.subscription.limits.tunnels = ResourceLimit {
            limit: 2,
            used: 2,
            reached: true,
        };
        match supervisor.enforce_quota(Some(&user)) {
            Err(TunnelError::Admission(msg)) => assert!(msg.contains("2/2")),
            other => panic!("expected Admission error, got {other:?}"),
        }
        assert!(supervisor.enforce_quota(None).is_ok());
    }

    #[tokio::test]
    async fn close_of_unknown_tunnel_reports_not_found() {
        let supervisor = TunnelSupervisor::new(direct_config(1, "hxp_tok"));
        assert!(matches!(
            supervisor.close_tunnel("tunnel-missing").await,
            Err(TunnelError::NotFound(_))
        ));
    }
}
