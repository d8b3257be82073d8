//! DNS message header.
//!
//! The fixed 12-byte structure at the start of every DNS message. The
//! proxy parses it to dispatch queries, patch self-generated answers in
//! place, and classify response codes; opcode and rcode are kept as raw
//! values so unknown codes pass through untouched.

use crate::error::{Error, Result};
use crate::rcode::ResponseCode;
use bitflags::bitflags;
use std::fmt;

/// Size of the DNS header in bytes.
pub const HEADER_SIZE: usize = 12;

bitflags! {
    /// DNS header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u16 {
        /// Query/Response flag: 0 = query, 1 = response.
        const QR = 0x8000;

        /// Authoritative Answer.
        const AA = 0x0400;

        /// Truncation.
        const TC = 0x0200;

        /// Recursion Desired.
        const RD = 0x0100;

        /// Recursion Available.
        const RA = 0x0080;

        /// Authentic Data (DNSSEC).
        const AD = 0x0020;

        /// Checking Disabled.
        const CD = 0x0010;
    }
}

impl Default for HeaderFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// DNS message header.
///
/// # Wire Format
///
/// ```text
///                                 1  1  1  1  1  1
///   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                      ID                       |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |QR|   Opcode  |AA|TC|RD|RA| Z|AD|CD|   RCODE   |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                    QDCOUNT                    |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                    ANCOUNT                    |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                    NSCOUNT                    |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                    ARCOUNT                    |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Message identifier for matching requests to responses.
    pub id: u16,

    /// Header flag bits.
    pub flags: HeaderFlags,

    /// Operation code, raw 4-bit value.
    pub opcode: u8,

    /// Response code, raw 4-bit value.
    pub rcode: u8,

    /// Number of questions.
    pub qd_count: u16,

    /// Number of answer records.
    pub an_count: u16,

    /// Number of authority records.
    pub ns_count: u16,

    /// Number of additional records.
    pub ar_count: u16,
}

/// Standard QUERY opcode.
pub const OPCODE_QUERY: u8 = 0;

impl Header {
    /// Returns true if this is a query.
    #[inline]
    pub fn is_query(&self) -> bool {
        !self.flags.contains(HeaderFlags::QR)
    }

    /// Returns true if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.flags.contains(HeaderFlags::QR)
    }

    /// Returns the response code as a known variant, if defined.
    #[inline]
    pub fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::try_from(self.rcode as u16).ok()
    }

    /// Parses a header from the first [`HEADER_SIZE`] bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::buffer_too_short(HEADER_SIZE, data.len()));
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let raw_flags = u16::from_be_bytes([data[2], data[3]]);

        Ok(Self {
            id,
            flags: HeaderFlags::from_bits_truncate(raw_flags),
            opcode: ((raw_flags >> 11) & 0x0F) as u8,
            rcode: (raw_flags & 0x0F) as u8,
            qd_count: u16::from_be_bytes([data[4], data[5]]),
            an_count: u16::from_be_bytes([data[6], data[7]]),
            ns_count: u16::from_be_bytes([data[8], data[9]]),
            ar_count: u16::from_be_bytes([data[10], data[11]]),
        })
    }

    /// Serializes the header into the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::buffer_too_short(HEADER_SIZE, buf.len()));
        }

        let mut raw_flags = self.flags.bits();
        raw_flags |= ((self.opcode & 0x0F) as u16) << 11;
        raw_flags |= (self.rcode & 0x0F) as u16;

        buf[0..2].copy_from_slice(&self.id.to_be_bytes());
        buf[2..4].copy_from_slice(&raw_flags.to_be_bytes());
        buf[4..6].copy_from_slice(&self.qd_count.to_be_bytes());
        buf[6..8].copy_from_slice(&self.an_count.to_be_bytes());
        buf[8..10].copy_from_slice(&self.ns_count.to_be_bytes());
        buf[10..12].copy_from_slice(&self.ar_count.to_be_bytes());

        Ok(())
    }

    /// Rewrites `message` in place as a response carrying `rcode`.
    ///
    /// Only the flags word is touched; counts and payload are preserved so
    /// the original question section survives in the answer.
    pub fn patch_as_response(message: &mut [u8], rcode: ResponseCode) -> Result<()> {
        let mut header = Self::parse(message)?;
        header.flags.insert(HeaderFlags::QR);
        header.rcode = u16::from(rcode) as u8;
        header.write_to(message)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id:{:04x} {} opcode:{} rcode:{} qd:{} an:{} ns:{} ar:{}",
            self.id,
            if self.is_query() { "query" } else { "response" },
            self.opcode,
            self.rcode,
            self.qd_count,
            self.an_count,
            self.ns_count,
            self.ar_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header {
            id: 0x1234,
            flags: HeaderFlags::RD,
            opcode: OPCODE_QUERY,
            rcode: 0,
            qd_count: 1,
            ..Default::default()
        };

        let mut wire = [0u8; HEADER_SIZE];
        header.write_to(&mut wire).unwrap();
        let parsed = Header::parse(&wire).unwrap();

        assert_eq!(header, parsed);
        assert!(parsed.is_query());
    }

    #[test]
    fn parse_too_short() {
        assert!(matches!(
            Header::parse(&[0; 10]),
            Err(Error::BufferTooShort { .. })
        ));
    }

    #[test]
    fn patch_as_response_sets_qr_and_rcode() {
        let mut msg = vec![0u8; HEADER_SIZE + 5];
        msg[0] = 0xAB;
        msg[1] = 0xCD;
        msg[12..].copy_from_slice(b"hello");

        Header::patch_as_response(&mut msg, ResponseCode::NotImp).unwrap();

        let header = Header::parse(&msg).unwrap();
        assert!(header.is_response());
        assert_eq!(header.rcode, 4);
        assert_eq!(header.id, 0xABCD);
        assert_eq!(&msg[12..], b"hello");
    }

    #[test]
    fn unknown_rcode_preserved() {
        let mut wire = [0u8; HEADER_SIZE];
        wire[3] = 0x0B; // unassigned rcode 11
        let header = Header::parse(&wire).unwrap();
        assert_eq!(header.rcode, 11);
        assert_eq!(header.response_code(), None);
    }
}
