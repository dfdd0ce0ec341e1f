//! Tunnel domain model: configuration, live records, per-tunnel auth.
//!
//! A [`TunnelConfig`] describes what the user asked for; a [`Tunnel`] is the
//! live record after the server accepted the registration. The server is
//! authoritative for the public endpoint: an HTTP tunnel gets its `url`
//! filled in, a TCP tunnel may come back with a different `remote_port`
//! than requested.

use serde::{Deserialize, Serialize};

/// Tunnel kind, also the `tunnel_type` value on the registration wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Http,
    Tcp,
}

impl std::fmt::Display for TunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelType::Http => write!(f, "http"),
            TunnelType::Tcp => write!(f, "tcp"),
        }
    }
}

/// How an HTTP tunnel authenticates its visitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelAuthType {
    /// HTTP Basic with username/password.
    Basic,
    /// A custom header name/value pair.
    Header,
}

/// Per-tunnel visitor authentication (HTTP tunnels only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelAuth {
    #[serde(rename = "type")]
    pub auth_type: TunnelAuthType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub header_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub header_value: String,
}

/// What the user asked for. Also the shape of `[[tunnels]]` entries in the
/// configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Display name; informational only.
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    /// Port of the local service to expose.
    pub local_port: u16,
    /// Host of the local service (default `127.0.0.1`).
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    /// Requested subdomain (HTTP tunnels).
    #[serde(default)]
    pub subdomain: String,
    /// Requested remote port (TCP tunnels; 0 = server assigns).
    #[serde(default)]
    pub remote_port: u16,
    /// Visitor authentication (HTTP tunnels).
    #[serde(default)]
    pub auth: Option<TunnelAuth>,
}

fn default_local_addr() -> String {
    "127.0.0.1".to_string()
}

impl TunnelConfig {
    /// `host:port` of the local service this tunnel forwards to.
    #[must_use]
    pub fn local_target(&self) -> String {
        let host = if self.local_addr.is_empty() {
            "127.0.0.1"
        } else {
            &self.local_addr
        };
        format!("{}:{}", host, self.local_port)
    }
}

/// A registered tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct Tunnel {
    /// Server-assigned id in WebSocket mode, locally minted for direct-TCP.
    pub id: String,
    pub config: TunnelConfig,
    /// Public URL; HTTP tunnels only, filled on successful registration.
    pub url: Option<String>,
    /// Public port; TCP tunnels only. May differ from the requested port.
    pub remote_port: u16,
    pub active: bool,
}

impl Tunnel {
    #[must_use]
    pub fn new(id: impl Into<String>, config: TunnelConfig) -> Self {
        Self {
            id: id.into(),
            config,
            url: None,
            remote_port: 0,
            active: false,
        }
    }

    /// Record a successful HTTP registration.
    pub fn set_http_info(&mut self, url: impl Into<String>) {
        self.url = Some(url.into());
        self.active = true;
    }

    /// Record a successful TCP registration, adopting the server's port.
    pub fn set_tcp_info(&mut self, remote_port: u16) {
        self.remote_port = remote_port;
        self.config.remote_port = remote_port;
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_target_defaults_to_loopback() {
        let config: TunnelConfig =
            toml::from_str("type = \"tcp\"\nlocal_port = 22").expect("parse");
        assert_eq!(config.local_target(), "127.0.0.1:22");
        assert_eq!(config.remote_port, 0);
    }

    #[test]
    fn tcp_info_updates_record_and_config() {
        let config: TunnelConfig =
            toml::from_str("type = \"tcp\"\nlocal_port = 22\nremote_port = 20000").expect("parse");
        let mut tunnel = Tunnel::new("t1", config);
        tunnel.set_tcp_info(20777);
        assert_eq!(tunnel.remote_port, 20777);
        assert_eq!(tunnel.config.remote_port, 20777);
        assert!(tunnel.active);
    }

    #[test]
    fn tunnel_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TunnelType::Http).unwrap(), "\"http\"");
        assert_eq!(serde_json::to_string(&TunnelType::Tcp).unwrap(), "\"tcp\"");
    }
}
