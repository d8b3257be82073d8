//! The question section, as far as dispatch needs it.

use crate::error::{Error, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::name::Name;
use std::fmt;

/// The Internet class.
pub const CLASS_IN: u16 = 1;

/// The first question of a DNS message.
///
/// Queries the proxy accepts carry exactly one question; responses are
/// matched against the question of the query they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// The domain name being queried.
    pub qname: Name,

    /// Query type, raw.
    pub qtype: u16,

    /// Query class, raw.
    pub qclass: u16,
}

impl Question {
    /// Parses the first question of `message`.
    ///
    /// `message` must be a full DNS message starting at the header.
    pub fn parse(message: &[u8]) -> Result<Self> {
        let (qname, name_len) = Name::parse(message, HEADER_SIZE)?;

        let fixed = HEADER_SIZE + name_len;
        if fixed + 4 > message.len() {
            return Err(Error::buffer_too_short(fixed + 4, message.len()));
        }

        Ok(Self {
            qname,
            qtype: u16::from_be_bytes([message[fixed], message[fixed + 1]]),
            qclass: u16::from_be_bytes([message[fixed + 2], message[fixed + 3]]),
        })
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.qname,
            crate::qtype::RecordType::name_of(self.qtype)
        )
    }
}

/// Checks that a backend response answers the query it is matched to.
///
/// A response matches when its id equals `id` and its first question
/// carries the same qname (case-insensitive), qtype and qclass as the
/// original query. Responses with `qdcount == 0` are accepted as is:
/// some servers strip the question on failure and there is nothing left
/// to verify.
pub fn response_content_matches(
    response: &[u8],
    id: u16,
    qname: &Name,
    qtype: u16,
    qclass: u16,
) -> bool {
    let header = match Header::parse(response) {
        Ok(h) => h,
        Err(_) => return false,
    };

    if header.id != id {
        return false;
    }

    if header.qd_count == 0 {
        return true;
    }

    match Question::parse(response) {
        Ok(q) => q.qtype == qtype && q.qclass == qclass && &q.qname == qname,
        Err(_) => false,
    }
}
