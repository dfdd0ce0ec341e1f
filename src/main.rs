//! # haxorport
//!
//! Client for the haxorport tunneling service: exposes a local TCP or
//! HTTP service through a public relay without opening any inbound
//! listener on the user's network.
//!
//! Two transports carry the tunnels:
//!
//! - **WebSocket session** — one persistent message-framed connection to
//!   the relay's `/control` endpoint, multiplexing tunnel registration,
//!   HTTP request/response proxying, and per-connection byte streams.
//! - **Direct TCP** — a raw-TCP reverse tunnel: the client registers over
//!   an outbound connection and answers the server's reverse `CONNECT`
//!   requests by splicing sockets to the local target.
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap args, tracing setup, signal shutdown
//! config.rs      — TOML + env-var configuration
//! supervisor.rs  — tunnel lifecycle orchestration across both backends
//! auth.rs        — token validation, subscription limits
//! protocol.rs    — message envelope and payload codec
//! backoff.rs     — shared retry policy (exponential/linear, jitter)
//! tunnel.rs      — tunnel domain model
//! util.rs        — socket tuning, outbound IP discovery
//! session/
//!   mod.rs       — WebSocket session: read pump, keepalive, reconnect
//!   registry.rs  — tunnels + connections maps, per-connection forwarders
//!   http_proxy.rs— local replay of forwarded HTTP requests, HTML rewrite
//! direct/
//!   mod.rs       — direct-TCP handshake, control loop, socket splicing
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use haxorport_client::config::Config;
use haxorport_client::supervisor::{TunnelError, TunnelSupervisor};
use haxorport_client::tunnel::{TunnelAuth, TunnelConfig, TunnelType};

/// Expose local services through the haxorport relay.
#[derive(Parser)]
#[command(name = "haxorport", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an HTTP tunnel to a local port.
    Http {
        /// Local port to expose.
        #[arg(short, long)]
        port: u16,
        /// Requested subdomain (server assigns one when omitted).
        #[arg(short, long, default_value = "")]
        subdomain: String,
    },
    /// Create a TCP tunnel to a local port.
    Tcp {
        /// Local port to expose.
        #[arg(short, long)]
        port: u16,
        /// Requested remote port (0 = server assigns).
        #[arg(short, long, default_value_t = 0)]
        remote_port: u16,
        /// Local address to forward to.
        #[arg(short, long, default_value = "127.0.0.1")]
        local_addr: String,
    },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if !config.log_file.is_empty() {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
        {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(e) => eprintln!("Failed to open log file {}: {e}", config.log_file),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());
    init_tracing(&config);

    info!("haxorport v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Server: {}:{} ({})",
        config.server_address, config.control_port, config.connection_mode
    );

    if let Err(e) = run(config, cli.command).await {
        eprintln!("Error: {e}");
        if let Some(hint) = e.hint() {
            eprintln!("Hint: {hint}");
        }
        std::process::exit(1);
    }
}

async fn run(config: Config, command: Option<Commands>) -> Result<(), TunnelError> {
    let config = Arc::new(config);
    let supervisor = Arc::new(TunnelSupervisor::new(Arc::clone(&config)));

    match command {
        Some(Commands::Http { port, subdomain }) => {
            start_http_tunnel(&supervisor, port, &subdomain, None).await?;
        }
        Some(Commands::Tcp {
            port,
            remote_port,
            local_addr,
        }) => {
            let tunnel_config = TunnelConfig {
                name: String::new(),
                tunnel_type: TunnelType::Tcp,
                local_port: port,
                local_addr,
                subdomain: String::new(),
                remote_port,
                auth: None,
            };
            start_tcp_tunnel(&supervisor, &config, tunnel_config).await?;
        }
        None => {
            if config.tunnels.is_empty() {
                return Err(TunnelError::Config(
                    "no tunnels configured; add a [[tunnels]] entry or use the http/tcp subcommands"
                        .to_string(),
                ));
            }
            for tunnel_config in config.tunnels.clone() {
                match tunnel_config.tunnel_type {
                    TunnelType::Http => {
                        start_http_tunnel(
                            &supervisor,
                            tunnel_config.local_port,
                            &tunnel_config.subdomain,
                            tunnel_config.auth.clone(),
                        )
                        .await?;
                    }
                    TunnelType::Tcp => {
                        start_tcp_tunnel(&supervisor, &config, tunnel_config).await?;
                    }
                }
            }
        }
    }

    info!("Tunnels active, press Ctrl+C to exit");
    shutdown_signal().await;

    info!("Shutting down...");
    supervisor.shutdown().await;
    info!("Goodbye");
    Ok(())
}

async fn start_http_tunnel(
    supervisor: &Arc<TunnelSupervisor>,
    port: u16,
    subdomain: &str,
    auth: Option<TunnelAuth>,
) -> Result<(), TunnelError> {
    let tunnel = supervisor.create_http_tunnel(port, subdomain, auth).await?;
    info!(
        "HTTP tunnel ready: {} -> localhost:{port}",
        tunnel.url.as_deref().unwrap_or("<pending>")
    );
    Ok(())
}

async fn start_tcp_tunnel(
    supervisor: &Arc<TunnelSupervisor>,
    config: &Arc<Config>,
    tunnel_config: TunnelConfig,
) -> Result<(), TunnelError> {
    let tunnel = supervisor.create_tcp_tunnel(tunnel_config).await?;
    let server = config.server_address.clone();
    info!(
        "TCP tunnel ready: {} -> {server}:{}",
        tunnel.config.local_target(),
        tunnel.remote_port
    );
    info!("SSH access: ssh -p {} user@{server}", tunnel.remote_port);

    // The server may move the tunnel to another port after a reconnect.
    let announced = supervisor
        .set_port_change_callback(
            &tunnel.id,
            Box::new(move |port| {
                warn!("Server reassigned remote port: {port}");
                info!("SSH access: ssh -p {port} user@{server}");
            }),
        )
        .await;
    if !announced {
        warn!("Tunnel {} disappeared before callback setup", tunnel.id);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
