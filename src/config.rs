//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `HAXORPORT_SERVER`, `HAXORPORT_TOKEN`,
//!    `HAXORPORT_MODE`
//! 2. **Config file** — path via `--config <path>`, or `haxorport.toml`
//!    in CWD
//! 3. **Compiled defaults** — see each field below
//!
//! The TOML file is flat, plus a `[[tunnels]]` array for startup tunnels:
//!
//! ```toml
//! server_address = "control.haxorport.online"
//! control_port = 443
//! connection_mode = "websocket"     # or "direct_tcp"
//! auth_enabled = true
//! auth_token = "hxp_your_token_here"
//! tls_enabled = true
//! base_domain = "haxorport.online"
//! log_level = "info"
//!
//! [[tunnels]]
//! name = "web"
//! type = "http"
//! local_port = 8080
//! subdomain = "demo"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::auth;
use crate::tunnel::TunnelConfig;

/// Transport used for the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Message-framed WebSocket session (HTTP and TCP tunnels).
    #[default]
    Websocket,
    /// Raw-TCP reverse tunnel (TCP tunnels only).
    DirectTcp,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Websocket => write!(f, "websocket"),
            ConnectionMode::DirectTcp => write!(f, "direct_tcp"),
        }
    }
}

/// Client configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Host of both the WebSocket control plane and the direct-TCP
    /// control endpoint.
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Control-plane port (default 443).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Data-plane port (reserved, default 8081).
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    #[serde(default)]
    pub connection_mode: ConnectionMode,
    /// Whether to present a token on the WebSocket session. TCP tunnels
    /// validate the token regardless of this flag.
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default)]
    pub auth_token: String,
    /// Token validation endpoint. Empty = derive from `server_address`.
    #[serde(default = "default_validation_url")]
    pub auth_validation_url: String,
    /// TLS on the WebSocket transport (`wss://`).
    #[serde(default)]
    pub tls_enabled: bool,
    /// Client certificate path. Empty cert/key = skip peer verification.
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
    /// Base domain used to synthesize hostnames for HTML URL rewriting.
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    /// tracing filter level (default `warn`). `RUST_LOG` overrides.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log file path; empty = stderr only.
    #[serde(default)]
    pub log_file: String,
    /// Tunnels started at launch.
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

fn default_server_address() -> String {
    "control.haxorport.online".to_string()
}
fn default_control_port() -> u16 {
    443
}
fn default_data_port() -> u16 {
    8081
}
fn default_validation_url() -> String {
    "https://haxorport.online/AuthToken/validate".to_string()
}
fn default_base_domain() -> String {
    "haxorport.online".to_string()
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("defaults deserialize")
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `haxorport.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("haxorport.toml").exists() {
            let content =
                std::fs::read_to_string("haxorport.toml").expect("Failed to read haxorport.toml");
            toml::from_str(&content).expect("Failed to parse haxorport.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(server) = std::env::var("HAXORPORT_SERVER") {
            config.server_address = server;
        }
        if let Ok(token) = std::env::var("HAXORPORT_TOKEN") {
            config.auth_token = token;
        }
        if let Ok(mode) = std::env::var("HAXORPORT_MODE") {
            match mode.as_str() {
                "websocket" => config.connection_mode = ConnectionMode::Websocket,
                "direct_tcp" => config.connection_mode = ConnectionMode::DirectTcp,
                other => panic!("Unsupported HAXORPORT_MODE: {other}"),
            }
        }

        config
    }

    /// The validation endpoint, deriving the default when unset.
    #[must_use]
    pub fn validation_url(&self) -> String {
        if self.auth_validation_url.is_empty() {
            auth::default_validation_url(&self.server_address, self.tls_enabled)
        } else {
            self.auth_validation_url.clone()
        }
    }

    /// WebSocket control URL: `{ws|wss}://{server}:{control_port}/control`.
    #[must_use]
    pub fn control_url(&self) -> String {
        let scheme = if self.tls_enabled { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}/control",
            self.server_address, self.control_port
        )
    }
}
