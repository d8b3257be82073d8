//! # Reeve DNS wire subset
//!
//! The slice of the DNS wire format the TCP dataplane actually needs:
//! the fixed 12-byte header, the first question (qname, qtype, qclass),
//! and the 2-byte length framing used by DNS over stream transports.
//!
//! Full message parsing is deliberately out of scope. The proxy relays
//! messages byte-for-byte; it only ever looks at the header and the
//! question section to dispatch queries and match responses.

pub mod error;
pub mod frame;
pub mod header;
pub mod name;
pub mod qtype;
pub mod question;
pub mod rcode;

pub use error::{Error, Result};
pub use frame::FrameCodec;
pub use header::{Header, HeaderFlags, HEADER_SIZE};
pub use name::Name;
pub use qtype::RecordType;
pub use question::{response_content_matches, Question, CLASS_IN};
pub use rcode::ResponseCode;

/// Maximum size of a DNS message over a stream transport.
pub const MAX_MESSAGE_SIZE: usize = 65535;
