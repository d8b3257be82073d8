//! PROXY protocol v1/v2 ingestion and v2 generation.
//!
//! Inbound: a frontend may require a PROXY header from configured source
//! networks before the first DNS message. Parsing is incremental — the
//! caller reads a minimum prefix, and the parser answers either with the
//! parsed header or with the exact number of additional bytes it needs.
//!
//! Outbound: backends configured for PROXY protocol get a v2 payload,
//! carrying the proxied addresses and any TLVs captured from the client,
//! prepended once per backend connection.
//!
//! Wire format (HAProxy PROXY protocol spec):
//! - v2: 12-byte signature, 1 byte version/command, 1 byte family and
//!   transport, 2 bytes address length, addresses and ports, TLVs.
//! - v1: `PROXY TCP4 <src> <dst> <sport> <dport>\r\n` in ASCII.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// PROXY protocol v2 signature.
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command.
const V2_CMD_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command (health checks and the like).
const V2_CMD_LOCAL: u8 = 0x20;

/// Address family AF_INET with STREAM transport.
const V2_FAM_TCP4: u8 = 0x11;

/// Address family AF_INET6 with STREAM transport.
const V2_FAM_TCP6: u8 = 0x21;

/// Fixed part of a v2 header: signature + version/command + family + length.
pub const V2_FIXED_SIZE: usize = 16;

/// Smallest read that can hold a complete header start for either version.
pub const MINIMUM_HEADER_SIZE: usize = V2_FIXED_SIZE;

/// Longest permitted v1 line, terminator included.
const V1_MAX_LINE: usize = 107;

/// A type-length-value entry from a v2 header.
///
/// Once a TLV set has been sent over a backend connection it defines that
/// connection's identity for reuse, so equality must be exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTlv {
    /// TLV type byte.
    pub kind: u8,

    /// Raw value bytes.
    pub value: Vec<u8>,
}

/// A parsed PROXY header.
#[derive(Debug, Clone)]
pub struct ProxyHeader {
    /// Source address the load balancer saw.
    pub source: Option<SocketAddr>,

    /// Destination address the load balancer saw.
    pub destination: Option<SocketAddr>,

    /// TLVs carried by a v2 header, in wire order.
    pub tlvs: Vec<ProxyTlv>,

    /// True for v2 LOCAL commands (no address override).
    pub local: bool,
}

/// Outcome of an incremental parse attempt.
#[derive(Debug)]
pub enum ProxyParse {
    /// A complete header, occupying `consumed` bytes of the input.
    Complete {
        header: ProxyHeader,
        consumed: usize,
    },

    /// The input is a valid prefix; exactly `need` more bytes are required.
    Incomplete { need: usize },

    /// The input can never become a valid header.
    Invalid,
}

/// Attempts to parse a PROXY v1 or v2 header from the start of `data`.
pub fn parse_header(data: &[u8]) -> ProxyParse {
    if data.len() < MINIMUM_HEADER_SIZE {
        return ProxyParse::Incomplete {
            need: MINIMUM_HEADER_SIZE - data.len(),
        };
    }

    if data[..12] == V2_SIGNATURE {
        parse_v2(data)
    } else if data.starts_with(b"PROXY ") {
        parse_v1(data)
    } else {
        ProxyParse::Invalid
    }
}

fn parse_v2(data: &[u8]) -> ProxyParse {
    let version_command = data[12];
    let family = data[13];
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;

    let total = V2_FIXED_SIZE + addr_len;
    if data.len() < total {
        return ProxyParse::Incomplete {
            need: total - data.len(),
        };
    }

    match version_command {
        V2_CMD_LOCAL => {
            return ProxyParse::Complete {
                header: ProxyHeader {
                    source: None,
                    destination: None,
                    tlvs: Vec::new(),
                    local: true,
                },
                consumed: total,
            };
        }
        V2_CMD_PROXY => {}
        _ => return ProxyParse::Invalid,
    }

    let body = &data[V2_FIXED_SIZE..total];
    let (source, destination, addr_size) = match family {
        V2_FAM_TCP4 => {
            if body.len() < 12 {
                return ProxyParse::Invalid;
            }
            let src = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let dst = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
            let sport = u16::from_be_bytes([body[8], body[9]]);
            let dport = u16::from_be_bytes([body[10], body[11]]);
            (
                SocketAddr::new(IpAddr::V4(src), sport),
                SocketAddr::new(IpAddr::V4(dst), dport),
                12,
            )
        }
        V2_FAM_TCP6 => {
            if body.len() < 36 {
                return ProxyParse::Invalid;
            }
            let src_octets: [u8; 16] = body[0..16].try_into().expect("length checked");
            let dst_octets: [u8; 16] = body[16..32].try_into().expect("length checked");
            let sport = u16::from_be_bytes([body[32], body[33]]);
            let dport = u16::from_be_bytes([body[34], body[35]]);
            (
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), sport),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dport),
                36,
            )
        }
        _ => return ProxyParse::Invalid,
    };

    let mut tlvs = Vec::new();
    let mut rest = &body[addr_size..];
    while !rest.is_empty() {
        if rest.len() < 3 {
            return ProxyParse::Invalid;
        }
        let kind = rest[0];
        let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
        if rest.len() < 3 + len {
            return ProxyParse::Invalid;
        }
        tlvs.push(ProxyTlv {
            kind,
            value: rest[3..3 + len].to_vec(),
        });
        rest = &rest[3 + len..];
    }

    ProxyParse::Complete {
        header: ProxyHeader {
            source: Some(source),
            destination: Some(destination),
            tlvs,
            local: false,
        },
        consumed: total,
    }
}

fn parse_v1(data: &[u8]) -> ProxyParse {
    let end = match data.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => pos,
        None => {
            if data.len() >= V1_MAX_LINE {
                return ProxyParse::Invalid;
            }
            // The terminator has not arrived; ask for it one byte at a time.
            return ProxyParse::Incomplete { need: 1 };
        }
    };

    let line = match std::str::from_utf8(&data[..end]) {
        Ok(s) => s,
        Err(_) => return ProxyParse::Invalid,
    };

    let mut parts = line.split(' ');
    let _proxy = parts.next();
    let family = parts.next();

    let header = match family {
        Some("TCP4") | Some("TCP6") => {
            let (src, dst, sport, dport) = match (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) {
                (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
                _ => return ProxyParse::Invalid,
            };

            let src_ip: IpAddr = match src.parse() {
                Ok(ip) => ip,
                Err(_) => return ProxyParse::Invalid,
            };
            let dst_ip: IpAddr = match dst.parse() {
                Ok(ip) => ip,
                Err(_) => return ProxyParse::Invalid,
            };
            let sport: u16 = match sport.parse() {
                Ok(p) => p,
                Err(_) => return ProxyParse::Invalid,
            };
            let dport: u16 = match dport.parse() {
                Ok(p) => p,
                Err(_) => return ProxyParse::Invalid,
            };

            ProxyHeader {
                source: Some(SocketAddr::new(src_ip, sport)),
                destination: Some(SocketAddr::new(dst_ip, dport)),
                tlvs: Vec::new(),
                local: false,
            }
        }
        Some("UNKNOWN") => ProxyHeader {
            source: None,
            destination: None,
            tlvs: Vec::new(),
            local: true,
        },
        _ => return ProxyParse::Invalid,
    };

    ProxyParse::Complete {
        header,
        consumed: end + 2,
    }
}

/// Encodes a PROXY v2 payload for a backend connection.
///
/// Mixed address families fall back to the source family with an
/// unspecified peer, which keeps the header well-formed.
pub fn encode_v2(source: SocketAddr, destination: SocketAddr, tlvs: &[ProxyTlv]) -> Vec<u8> {
    let tlv_len: usize = tlvs.iter().map(|t| 3 + t.value.len()).sum();

    let mut out = Vec::with_capacity(V2_FIXED_SIZE + 36 + tlv_len);
    out.extend_from_slice(&V2_SIGNATURE);
    out.push(V2_CMD_PROXY);

    match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), dst) => {
            let dst = match dst {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            out.push(V2_FAM_TCP4);
            out.extend_from_slice(&((12 + tlv_len) as u16).to_be_bytes());
            out.extend_from_slice(&src.octets());
            out.extend_from_slice(&dst.octets());
            out.extend_from_slice(&source.port().to_be_bytes());
            out.extend_from_slice(&destination.port().to_be_bytes());
        }
        (IpAddr::V6(src), dst) => {
            let dst = match dst {
                IpAddr::V6(v6) => v6,
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            };
            out.push(V2_FAM_TCP6);
            out.extend_from_slice(&((36 + tlv_len) as u16).to_be_bytes());
            out.extend_from_slice(&src.octets());
            out.extend_from_slice(&dst.octets());
            out.extend_from_slice(&source.port().to_be_bytes());
            out.extend_from_slice(&destination.port().to_be_bytes());
        }
    }

    for tlv in tlvs {
        out.push(tlv.kind);
        out.extend_from_slice(&(tlv.value.len() as u16).to_be_bytes());
        out.extend_from_slice(&tlv.value);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_roundtrip_with_tlvs() {
        let src: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let dst: SocketAddr = "198.51.100.1:53".parse().unwrap();
        let tlvs = vec![
            ProxyTlv {
                kind: 0x01,
                value: b"h2".to_vec(),
            },
            ProxyTlv {
                kind: 0xE0,
                value: vec![1, 2, 3, 4],
            },
        ];

        let wire = encode_v2(src, dst, &tlvs);
        match parse_header(&wire) {
            ProxyParse::Complete { header, consumed } => {
                assert_eq!(consumed, wire.len());
                assert_eq!(header.source, Some(src));
                assert_eq!(header.destination, Some(dst));
                assert_eq!(header.tlvs, tlvs);
                assert!(!header.local);
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn v2_ipv6_roundtrip() {
        let src: SocketAddr = "[2001:db8::1]:4242".parse().unwrap();
        let dst: SocketAddr = "[2001:db8::2]:53".parse().unwrap();

        let wire = encode_v2(src, dst, &[]);
        match parse_header(&wire) {
            ProxyParse::Complete { header, consumed } => {
                assert_eq!(consumed, wire.len());
                assert_eq!(header.source, Some(src));
                assert_eq!(header.destination, Some(dst));
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn v2_incomplete_reports_exact_need() {
        let src: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let dst: SocketAddr = "198.51.100.1:53".parse().unwrap();
        let wire = encode_v2(src, dst, &[]);

        // Cut inside the address block: the parser must ask for the rest.
        match parse_header(&wire[..V2_FIXED_SIZE + 5]) {
            ProxyParse::Incomplete { need } => {
                assert_eq!(need, wire.len() - V2_FIXED_SIZE - 5)
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }

        // One delivery of exactly `need` bytes completes the parse.
        match parse_header(&wire) {
            ProxyParse::Complete { consumed, .. } => assert_eq!(consumed, wire.len()),
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn v2_local_command() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&V2_SIGNATURE);
        wire.push(V2_CMD_LOCAL);
        wire.push(0x00);
        wire.extend_from_slice(&0u16.to_be_bytes());

        match parse_header(&wire) {
            ProxyParse::Complete { header, consumed } => {
                assert!(header.local);
                assert_eq!(consumed, 16);
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn v1_parse() {
        let wire = b"PROXY TCP4 203.0.113.4 192.0.2.9 56324 53\r\n";
        match parse_header(wire) {
            ProxyParse::Complete { header, consumed } => {
                assert_eq!(consumed, wire.len());
                assert_eq!(header.source, Some("203.0.113.4:56324".parse().unwrap()));
                assert_eq!(header.destination, Some("192.0.2.9:53".parse().unwrap()));
            }
            other => panic!("unexpected parse outcome: {other:?}"),
        }
    }

    #[test]
    fn v1_needs_terminator() {
        let wire = b"PROXY TCP4 203.0.113.4 1";
        assert!(matches!(
            parse_header(wire),
            ProxyParse::Incomplete { need: 1 }
        ));
    }

    #[test]
    fn garbage_is_invalid() {
        let wire = [0xAAu8; 32];
        assert!(matches!(parse_header(&wire), ProxyParse::Invalid));
    }

    #[test]
    fn tlv_equality_is_exact() {
        let a = ProxyTlv {
            kind: 1,
            value: b"x".to_vec(),
        };
        let b = ProxyTlv {
            kind: 1,
            value: b"y".to_vec(),
        };
        assert_ne!(a, b);
    }
}
