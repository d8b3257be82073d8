//! DNS query/record types.
//!
//! Only the types the dataplane cares about are named; everything else is
//! carried as a raw `u16`. The proxy never interprets record data, but it
//! must recognize zone-transfer query types to switch a connection into
//! streaming mode.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

/// Well-known DNS record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum RecordType {
    /// IPv4 address.
    A = 1,

    /// Authoritative name server.
    NS = 2,

    /// Canonical name.
    CNAME = 5,

    /// Start of authority.
    SOA = 6,

    /// Domain name pointer.
    PTR = 12,

    /// Mail exchange.
    MX = 15,

    /// Text strings.
    TXT = 16,

    /// IPv6 address.
    AAAA = 28,

    /// Service locator.
    SRV = 33,

    /// EDNS0 pseudo-record.
    OPT = 41,

    /// Incremental zone transfer.
    IXFR = 251,

    /// Full zone transfer.
    AXFR = 252,

    /// Any record type.
    ANY = 255,
}

impl RecordType {
    /// Returns true if `qtype` is a zone-transfer query (AXFR or IXFR).
    ///
    /// Zone transfers invert the request/response cadence: a single query
    /// elicits a stream of response messages on one connection.
    #[inline]
    pub fn is_zone_transfer(qtype: u16) -> bool {
        qtype == u16::from(Self::AXFR) || qtype == u16::from(Self::IXFR)
    }

    /// Formats a raw qtype, falling back to `TYPExx` for unknown values.
    pub fn name_of(qtype: u16) -> String {
        match Self::try_from(qtype) {
            Ok(rt) => format!("{rt}"),
            Err(_) => format!("TYPE{qtype}"),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::A => "A",
            Self::NS => "NS",
            Self::CNAME => "CNAME",
            Self::SOA => "SOA",
            Self::PTR => "PTR",
            Self::MX => "MX",
            Self::TXT => "TXT",
            Self::AAAA => "AAAA",
            Self::SRV => "SRV",
            Self::OPT => "OPT",
            Self::IXFR => "IXFR",
            Self::AXFR => "AXFR",
            Self::ANY => "ANY",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_transfer_detection() {
        assert!(RecordType::is_zone_transfer(252));
        assert!(RecordType::is_zone_transfer(251));
        assert!(!RecordType::is_zone_transfer(1));
        assert!(!RecordType::is_zone_transfer(255));
    }

    #[test]
    fn unknown_type_formatting() {
        assert_eq!(RecordType::name_of(1), "A");
        assert_eq!(RecordType::name_of(64999), "TYPE64999");
    }
}
