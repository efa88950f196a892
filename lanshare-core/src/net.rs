//! Network helpers: local address, broadcast address, port probing, reachability.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use tokio::net::TcpStream;

/// Best-effort local IPv4 address of the interface used for outbound traffic.
/// Falls back to loopback when nothing better is known.
pub fn local_ip() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// Broadcast address for discovery probes.
///
/// Without netmask information, a `192.168.x.y` host uses its `/24` broadcast;
/// everything else uses the limited broadcast `255.255.255.255`.
pub fn broadcast_address() -> Ipv4Addr {
    match local_ip() {
        IpAddr::V4(ip) => broadcast_for(ip),
        IpAddr::V6(_) => Ipv4Addr::BROADCAST,
    }
}

fn broadcast_for(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    if a == 192 && b == 168 {
        Ipv4Addr::new(a, b, c, 255)
    } else {
        Ipv4Addr::BROADCAST
    }
}

/// True if a TCP listener could bind `0.0.0.0:port` right now.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// First available port in `range`, if any.
pub fn find_available_port(range: RangeInclusive<u16>) -> Option<u16> {
    range.into_iter().find(|&p| is_port_available(p))
}

/// Syntactically valid IPv4 or IPv6 literal.
pub fn is_valid_ip(s: &str) -> bool {
    s.trim().parse::<IpAddr>().is_ok()
}

/// True if a TCP connection to `addr` completes within `timeout`.
pub async fn can_connect(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
