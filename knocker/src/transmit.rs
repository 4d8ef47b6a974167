use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};

use knock_proto::carrier::{self, Endpoints};
use knock_proto::WireToken;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

// IPPROTO_RAW: the kernel takes our IPv4 header as-is
const IPPROTO_RAW: i32 = 255;
const EPHEMERAL_LOW: u16 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error("resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("{0} has no IPv4 address")]
    NoIpv4(String),
    #[error("no route to {0}: {1}")]
    NoRoute(Ipv4Addr, io::Error),
    #[error("entropy source failed: {0}")]
    Entropy(getrandom::Error),
    #[error("raw socket: {0}")]
    Socket(io::Error),
}

pub fn resolve(host: &str, port: u16) -> Result<Ipv4Addr, TransmitError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransmitError::Resolve {
            host: host.to_string(),
            source,
        })?;
    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| TransmitError::NoIpv4(host.to_string()))
}

/// Local address the kernel would use to reach `destination`. Connecting a
/// UDP socket sends nothing.
pub fn source_for(destination: Ipv4Addr, port: u16) -> Result<Ipv4Addr, TransmitError> {
    let no_route = |e| TransmitError::NoRoute(destination, e);
    let sock = UdpSocket::bind("0.0.0.0:0").map_err(no_route)?;
    sock.connect((destination, port)).map_err(no_route)?;
    match sock.local_addr().map_err(no_route)? {
        SocketAddr::V4(local) => Ok(*local.ip()),
        SocketAddr::V6(_) => Err(TransmitError::NoIpv4(destination.to_string())),
    }
}

/// SYN packet carrying `token` with a random source port and sequence.
pub fn build(
    token: &WireToken,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    port: u16,
) -> Result<Vec<u8>, TransmitError> {
    let mut random = [0u8; 6];
    getrandom::getrandom(&mut random).map_err(TransmitError::Entropy)?;
    let spread = u16::from_be_bytes([random[0], random[1]]) % (u16::MAX - EPHEMERAL_LOW);
    let endpoints = Endpoints {
        source,
        destination,
        source_port: EPHEMERAL_LOW + spread,
        destination_port: port,
        sequence: u32::from_be_bytes([random[2], random[3], random[4], random[5]]),
    };
    Ok(carrier::encapsulate(token, &endpoints))
}

/// Resolves `host` and sends one knock to it.
pub fn send(
    token: &WireToken,
    host: &str,
    port: u16,
    iface: Option<&str>,
) -> Result<(), TransmitError> {
    let destination = resolve(host, port)?;
    let source = source_for(destination, port)?;
    let packet = build(token, source, destination, port)?;

    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))
        .map_err(TransmitError::Socket)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(name) = iface {
        socket
            .bind_device(Some(name.as_bytes()))
            .map_err(TransmitError::Socket)?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = iface;

    let target = SockAddr::from(SocketAddrV4::new(destination, 0));
    let sent = socket
        .send_to(&packet, &target)
        .map_err(TransmitError::Socket)?;
    debug!(%source, %destination, port, bytes = sent, "knock transmitted");
    Ok(())
}
