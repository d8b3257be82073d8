//! DNS response codes.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

/// DNS response code (the 4-bit header RCODE field).
///
/// See RFC 1035 and RFC 6895. Codes the proxy does not recognize are
/// carried through as raw values by [`crate::Header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ResponseCode {
    /// No error condition.
    NoError = 0,

    /// The server was unable to interpret the query.
    FormErr = 1,

    /// The server was unable to process the query.
    ServFail = 2,

    /// The queried name does not exist.
    NXDomain = 3,

    /// The server does not support the requested kind of query.
    NotImp = 4,

    /// The server refuses to perform the operation.
    Refused = 5,

    /// Name exists when it should not (RFC 2136).
    YXDomain = 6,

    /// RR set exists when it should not (RFC 2136).
    YXRRSet = 7,

    /// RR set that should exist does not (RFC 2136).
    NXRRSet = 8,

    /// Server not authoritative / not authorized (RFC 2136, RFC 8945).
    NotAuth = 9,

    /// Name not contained in zone (RFC 2136).
    NotZone = 10,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "NOERROR",
            Self::FormErr => "FORMERR",
            Self::ServFail => "SERVFAIL",
            Self::NXDomain => "NXDOMAIN",
            Self::NotImp => "NOTIMP",
            Self::Refused => "REFUSED",
            Self::YXDomain => "YXDOMAIN",
            Self::YXRRSet => "YXRRSET",
            Self::NXRRSet => "NXRRSET",
            Self::NotAuth => "NOTAUTH",
            Self::NotZone => "NOTZONE",
        };
        f.write_str(name)
    }
}
