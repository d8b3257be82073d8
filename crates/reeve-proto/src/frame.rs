//! Length framing for DNS over stream transports.
//!
//! Every DNS message on a stream is prefixed by a 16-bit big-endian
//! length. The codec accumulates bytes across partial reads and yields
//! complete messages; all partial-I/O state lives here, so a read may be
//! abandoned at any point and resumed later without losing data.

use crate::error::{Error, Result};
use crate::header::HEADER_SIZE;
use bytes::{Buf, BufMut, BytesMut};

/// Size of the length prefix.
pub const PREFIX_SIZE: usize = 2;

/// Incremental decoder for length-prefixed DNS messages.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Accumulated bytes not yet consumed.
    buf: BytesMut,

    /// Declared length of the message currently being read.
    expected: Option<usize>,
}

impl FrameCodec {
    /// Creates a codec with a reasonable initial capacity.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            expected: None,
        }
    }

    /// The accumulation buffer, for feeding reads into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Tries to extract the next complete message.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A declared length
    /// below the DNS header size is a protocol violation and fails with
    /// [`Error::MessageTooShort`].
    pub fn decode(&mut self) -> Result<Option<BytesMut>> {
        let expected = match self.expected {
            Some(len) => len,
            None => {
                if self.buf.len() < PREFIX_SIZE {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
                if len < HEADER_SIZE {
                    return Err(Error::MessageTooShort { length: len });
                }
                self.buf.advance(PREFIX_SIZE);
                self.buf.reserve(len.saturating_sub(self.buf.len()));
                self.expected = Some(len);
                len
            }
        };

        if self.buf.len() < expected {
            return Ok(None);
        }

        self.expected = None;
        Ok(Some(self.buf.split_to(expected)))
    }

    /// True when a length prefix has been read but the body is incomplete.
    pub fn mid_message(&self) -> bool {
        self.expected.is_some()
    }
}

/// Prepends the 2-byte length prefix to `message`.
///
/// `message.len()` must fit in a `u16`; stream DNS cannot carry more.
pub fn prefix_message(message: &[u8]) -> BytesMut {
    debug_assert!(message.len() <= u16::MAX as usize);
    let mut out = BytesMut::with_capacity(PREFIX_SIZE + message.len());
    out.put_u16(message.len() as u16);
    out.extend_from_slice(message);
    out
}
