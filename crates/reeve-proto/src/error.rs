//! Wire parsing error types.

use thiserror::Error;

/// Result type alias for wire format operations.
pub type Result<T> = std::result::Result<T, Error>;

/// DNS wire format errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer is too short to contain the expected data.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort {
        /// Expected minimum size.
        expected: usize,
        /// Actual buffer size.
        actual: usize,
    },

    /// A frame length below the fixed DNS header size.
    #[error("message length {length} below the DNS header size")]
    MessageTooShort {
        /// Declared message length.
        length: usize,
    },

    /// A label exceeding the 63-byte limit.
    #[error("label too long: {length} bytes")]
    LabelTooLong {
        /// Actual label length.
        length: usize,
    },

    /// A name exceeding the 255-byte wire limit.
    #[error("name too long")]
    NameTooLong,

    /// A compression pointer that points forward or loops.
    #[error("invalid compression pointer at offset {offset}")]
    InvalidPointer {
        /// Byte offset of the offending pointer.
        offset: usize,
    },

    /// Invalid data encountered during parsing.
    #[error("invalid data at offset {offset}: {message}")]
    InvalidData {
        /// Byte offset of the invalid data.
        offset: usize,
        /// Description of the problem.
        message: &'static str,
    },
}

impl Error {
    /// Shorthand for a [`Error::BufferTooShort`].
    pub fn buffer_too_short(expected: usize, actual: usize) -> Self {
        Self::BufferTooShort { expected, actual }
    }
}
