//! TCP SYN carrier for knock tokens.
//!
//! The token rides as the payload of an IPv4 TCP SYN whose only option is a
//! timestamps option with zeroed values, followed by two NOPs. The receive
//! side reports the IPv4 source address from the header; the credential
//! itself never carries an address.

use std::net::{IpAddr, Ipv4Addr};

use crate::credential::{WireToken, TOKEN_LEN};

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20 + TCP_OPTIONS.len();
pub const PACKET_LEN: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN + TOKEN_LEN;

const TCP_WINDOW: u16 = 14600;
const IP_TTL: u8 = 64;
const PROTO_TCP: u8 = 6;
const FLAG_SYN: u8 = 0x02;
const FLAG_ACK: u8 = 0x10;
// kind 8 (timestamps), len 10, TSval/TSecr zeroed, NOP, NOP
const TCP_OPTIONS: [u8; 12] = [8, 10, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CarrierError {
    #[error("truncated packet")]
    Truncated,
    #[error("not an IPv4 packet")]
    NotIpv4,
    #[error("not a TCP segment")]
    NotTcp,
    #[error("not a bare SYN")]
    NotSyn,
    #[error("payload is {0} bytes, expected {TOKEN_LEN}")]
    PayloadLength(usize),
}

/// Addressing for one outgoing knock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
}

/// A token lifted out of a captured packet, with the sender's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Captured {
    pub token: WireToken,
    pub source: IpAddr,
}

/// Builds a complete IPv4 packet (header included) carrying the token.
pub fn encapsulate(token: &WireToken, endpoints: &Endpoints) -> Vec<u8> {
    let mut packet = Vec::with_capacity(PACKET_LEN);

    // IPv4 header, DF set, identification taken from the sequence number
    let ident = (endpoints.sequence & 0xffff) as u16;
    packet.push(0x45);
    packet.push(0x00);
    packet.extend_from_slice(&(PACKET_LEN as u16).to_be_bytes());
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&[0x40, 0x00]);
    packet.push(IP_TTL);
    packet.push(PROTO_TCP);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&endpoints.source.octets());
    packet.extend_from_slice(&endpoints.destination.octets());
    let ip_sum = checksum(&[&packet[..IPV4_HEADER_LEN]]);
    packet[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    // TCP header
    let tcp_start = packet.len();
    packet.extend_from_slice(&endpoints.source_port.to_be_bytes());
    packet.extend_from_slice(&endpoints.destination_port.to_be_bytes());
    packet.extend_from_slice(&endpoints.sequence.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.push(((TCP_HEADER_LEN / 4) as u8) << 4);
    packet.push(FLAG_SYN);
    packet.extend_from_slice(&TCP_WINDOW.to_be_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&TCP_OPTIONS);
    packet.extend_from_slice(token.as_bytes());

    let segment_len = (packet.len() - tcp_start) as u16;
    let mut pseudo = [0u8; 12];
    pseudo[..4].copy_from_slice(&endpoints.source.octets());
    pseudo[4..8].copy_from_slice(&endpoints.destination.octets());
    pseudo[9] = PROTO_TCP;
    pseudo[10..].copy_from_slice(&segment_len.to_be_bytes());
    let tcp_sum = checksum(&[&pseudo, &packet[tcp_start..]]);
    packet[tcp_start + 16..tcp_start + 18].copy_from_slice(&tcp_sum.to_be_bytes());

    packet
}

/// Pulls the token and source address out of a captured IPv4 packet.
pub fn extract(packet: &[u8]) -> Result<Captured, CarrierError> {
    if packet.len() < IPV4_HEADER_LEN {
        return Err(CarrierError::Truncated);
    }
    if packet[0] >> 4 != 4 {
        return Err(CarrierError::NotIpv4);
    }
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    let total = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    if ihl < IPV4_HEADER_LEN || total < ihl || total > packet.len() {
        return Err(CarrierError::Truncated);
    }
    if packet[9] != PROTO_TCP {
        return Err(CarrierError::NotTcp);
    }

    let segment = &packet[ihl..total];
    if segment.len() < 20 {
        return Err(CarrierError::Truncated);
    }
    let flags = segment[13];
    if flags & FLAG_SYN == 0 || flags & FLAG_ACK != 0 {
        return Err(CarrierError::NotSyn);
    }
    let data_offset = usize::from(segment[12] >> 4) * 4;
    if data_offset < 20 || data_offset > segment.len() {
        return Err(CarrierError::Truncated);
    }

    let payload = &segment[data_offset..];
    let raw: [u8; TOKEN_LEN] = payload
        .try_into()
        .map_err(|_| CarrierError::PayloadLength(payload.len()))?;
    let source = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);

    Ok(Captured {
        token: WireToken::from_bytes(raw),
        source: IpAddr::V4(source),
    })
}

// RFC 1071 ones' complement sum over the concatenated parts.
fn checksum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut pending: Option<u8> = None;
    for byte in parts.iter().flat_map(|p| p.iter().copied()) {
        match pending.take() {
            Some(high) => sum += u32::from(u16::from_be_bytes([high, byte])),
            None => pending = Some(byte),
        }
    }
    if let Some(high) = pending {
        sum += u32::from(u16::from_be_bytes([high, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints {
            source: Ipv4Addr::new(192, 0, 2, 10),
            destination: Ipv4Addr::new(198, 51, 100, 1),
            source_port: 40123,
            destination_port: 80,
            sequence: 0xDEAD_BEEF,
        }
    }

    fn token() -> WireToken {
        let mut raw = [0u8; TOKEN_LEN];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        WireToken::from_bytes(raw)
    }

    #[test]
    fn syn_carries_token_and_source() {
        let packet = encapsulate(&token(), &endpoints());
        assert_eq!(packet.len(), PACKET_LEN);

        let captured = extract(&packet).unwrap();
        assert_eq!(captured.token, token());
        assert_eq!(captured.source, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)));
    }

    #[test]
    fn headers_are_well_formed() {
        let packet = encapsulate(&token(), &endpoints());
        // A correct checksum sums to zero when recomputed over the header.
        assert_eq!(checksum(&[&packet[..IPV4_HEADER_LEN]]), 0);

        let tcp = &packet[IPV4_HEADER_LEN..];
        let mut pseudo = [0u8; 12];
        pseudo[..4].copy_from_slice(&packet[12..16]);
        pseudo[4..8].copy_from_slice(&packet[16..20]);
        pseudo[9] = PROTO_TCP;
        pseudo[10..].copy_from_slice(&(tcp.len() as u16).to_be_bytes());
        assert_eq!(checksum(&[&pseudo, tcp]), 0);

        assert_eq!(&tcp[20..22], &[8, 10]);
        assert_eq!(&tcp[22..30], &[0u8; 8]);
        assert_eq!(tcp[13], FLAG_SYN);
    }

    #[test]
    fn rejects_non_knock_traffic() {
        let packet = encapsulate(&token(), &endpoints());

        let mut syn_ack = packet.clone();
        syn_ack[IPV4_HEADER_LEN + 13] |= FLAG_ACK;
        assert_eq!(extract(&syn_ack), Err(CarrierError::NotSyn));

        let mut udp = packet.clone();
        udp[9] = 17;
        assert_eq!(extract(&udp), Err(CarrierError::NotTcp));

        let mut v6 = packet.clone();
        v6[0] = 0x60;
        assert_eq!(extract(&v6), Err(CarrierError::NotIpv4));

        assert_eq!(extract(&packet[..30]), Err(CarrierError::Truncated));
    }

    #[test]
    fn link_trailer_after_total_length_is_ignored() {
        let mut frame = encapsulate(&token(), &endpoints());
        frame.extend_from_slice(&[0xAA; 4]);
        assert_eq!(extract(&frame).unwrap().token, token());
    }

    #[test]
    fn rejects_wrong_payload_size() {
        let mut packet = encapsulate(&token(), &endpoints());
        packet.truncate(PACKET_LEN - 1);
        packet[2..4].copy_from_slice(&((PACKET_LEN - 1) as u16).to_be_bytes());
        assert_eq!(
            extract(&packet),
            Err(CarrierError::PayloadLength(TOKEN_LEN - 1))
        );
    }
}
