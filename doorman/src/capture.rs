//! Link-layer capture feeding knocks to the orchestrator.
//!
//! On Linux the socket is an `AF_PACKET` datagram socket: frames arrive with
//! the link header already removed and before netfilter has filtered them,
//! so knocks are seen even when the INPUT chain drops them.

use std::fs;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use knock_proto::carrier;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, trace};

use crate::orchestrator::Event;

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_PACKET: usize = 65535;
// ETH_P_IP
#[cfg(any(target_os = "linux", target_os = "android"))]
const ETHERTYPE_IPV4: u16 = 0x0800;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("open capture socket on {iface}: {source}")]
    Open { iface: String, source: io::Error },
    #[error("could not determine default route interface: {0}")]
    NoDefaultRoute(String),
}

/// Sees every inbound IPv4 packet on one interface.
pub struct RawCapture {
    socket: Socket,
    iface: String,
}

impl RawCapture {
    pub fn open(iface: &str) -> Result<Self, CaptureError> {
        let open_err = |source| CaptureError::Open {
            iface: iface.to_string(),
            source,
        };
        let socket = capture_socket(iface).map_err(open_err)?;
        socket.set_read_timeout(Some(READ_TIMEOUT)).map_err(open_err)?;
        Ok(Self {
            socket,
            iface: iface.to_string(),
        })
    }

    /// Starts the capture thread. It stops when `stop` is set, when the
    /// orchestrator hangs up, or on a socket error (after requesting
    /// shutdown).
    pub fn spawn(self, events: Sender<Event>, stop: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run(&events, &stop))
    }

    fn run(mut self, events: &Sender<Event>, stop: &AtomicBool) {
        let mut buf = vec![0u8; MAX_PACKET];
        while !stop.load(Ordering::Relaxed) {
            match self.socket.read(&mut buf) {
                Ok(n) => match carrier::extract(&buf[..n]) {
                    Ok(captured) => {
                        if events.send(Event::Packet(captured)).is_err() {
                            break;
                        }
                    }
                    Err(reason) => trace!(%reason, "not a knock"),
                },
                Err(ref e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(iface = %self.iface, error = %e, "capture failed");
                    let _ = events.send(Event::Shutdown);
                    break;
                }
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn capture_socket(iface: &str) -> io::Result<Socket> {
    // DGRAM strips the link header whatever the interface's link type is.
    let socket = Socket::new(Domain::PACKET, Type::DGRAM, Some(packet_protocol()))?;
    socket.bind_device(Some(iface.as_bytes()))?;
    Ok(socket)
}

// A packet socket's protocol is the ethertype in network byte order.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn packet_protocol() -> Protocol {
    Protocol::from(i32::from(ETHERTYPE_IPV4.to_be()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn capture_socket(_iface: &str) -> io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))
}

/// Interface carrying the IPv4 default route, from `/proc/net/route`.
pub fn default_route_interface() -> Result<String, CaptureError> {
    let table = fs::read_to_string("/proc/net/route")
        .map_err(|e| CaptureError::NoDefaultRoute(e.to_string()))?;
    parse_default_route(&table)
        .ok_or_else(|| CaptureError::NoDefaultRoute("no default route".into()))
}

fn parse_default_route(table: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Iface Destination Gateway Flags RefCnt Use Metric Mask ...
        match fields.as_slice() {
            [iface, "00000000", _, _, _, _, _, "00000000", ..] if *iface != "lo" => {
                Some((*iface).to_string())
            }
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_default_route_interface() {
        let table = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth1\t0002A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
wlan0\t00000000\t0102A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0
";
        assert_eq!(parse_default_route(table).as_deref(), Some("wlan0"));
    }

    #[test]
    fn no_default_route() {
        let table = "Iface\tDestination\tGateway\n\
                     eth0\t0002A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0\n";
        assert_eq!(parse_default_route(table), None);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn packet_socket_filters_on_ipv4_ethertype() {
        let protocol = i32::from(packet_protocol()) as u16;
        assert_eq!(protocol.to_ne_bytes(), [0x08, 0x00]);
    }

    #[test]
    fn open_failure_names_the_interface() {
        // Fails either for lack of privilege or because the device is absent.
        match RawCapture::open("knock-no-such0") {
            Err(CaptureError::Open { iface, .. }) => assert_eq!(iface, "knock-no-such0"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("capture opened on a missing interface"),
        }
    }
}
