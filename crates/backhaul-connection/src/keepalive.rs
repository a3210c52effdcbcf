//! TCP keepalive for long-lived tunnel connections

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;

/// Idle time before the first keepalive probe
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Interval between keepalive probes
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Enable TCP keepalive on a tunnel connection so NAT mappings stay warm and
/// dead peers are detected without application traffic.
pub fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
