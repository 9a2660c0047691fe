use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

/// Check if a local port is accepting connections (tunnel is healthy).
pub fn check_port(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok()
}

/// Ask the OS for an unused loopback port: bind port 0, read it back, release it.
///
/// The port is free only at the instant of the probe; another process may take
/// it before the caller binds it again.
pub fn probe_ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Probe a list of local ports with retries over a timeout period.
/// Returns true if all ports became reachable within the timeout.
pub fn wait_healthy_ports(ports: &[u16], timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if ports.iter().all(|&p| check_port(p)) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(250));
    }
}
