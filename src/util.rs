//! Socket tuning and address helpers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::warn;

/// Apply the latency/throughput options every tunneled socket gets:
/// `TCP_NODELAY`, keepalive at `keepalive_period`, and symmetric
/// `buffer_size` read/write buffers.
pub fn tune_stream(stream: &TcpStream, buffer_size: usize, keepalive_period: Duration) {
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {e}");
    }
    let keepalive = TcpKeepalive::new().with_time(keepalive_period);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!("Failed to enable TCP keepalive: {e}");
    }
    if let Err(e) = sock.set_recv_buffer_size(buffer_size) {
        warn!("Failed to set read buffer size: {e}");
    }
    if let Err(e) = sock.set_send_buffer_size(buffer_size) {
        warn!("Failed to set write buffer size: {e}");
    }
}

/// Port of a `host:port` target, if it parses.
pub fn target_port(target_addr: &str) -> Option<u16> {
    target_addr
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
}

/// Best-effort source IP for outbound traffic.
///
/// Tries, in order: the local address of an existing server connection, a
/// throwaway UDP socket "connected" to a public resolver (no packets are
/// sent), the first non-loopback IPv4 interface, and finally loopback.
pub fn outbound_ip(existing: Option<SocketAddr>) -> IpAddr {
    if let Some(addr) = existing {
        if usable(addr.ip()) {
            return addr.ip();
        }
    }

    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:53").is_ok() {
            if let Ok(local) = socket.local_addr() {
                if usable(local.ip()) {
                    return local.ip();
                }
            }
        }
    }

    if let Some(ip) = first_interface_ipv4() {
        return IpAddr::V4(ip);
    }

    warn!("Failed to determine outbound IP, falling back to loopback");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn usable(ip: IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

/// First non-loopback IPv4 address among the host's interfaces.
fn first_interface_ipv4() -> Option<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for interface in addrs {
        if let Some(storage) = interface.address {
            if let Some(sin) = storage.as_sockaddr_in() {
                let ip = sin.ip();
                if !ip.is_loopback() {
                    return Some(ip);
                }
            }
        }
    }
    None
}
