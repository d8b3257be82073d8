//! Wire-format domain names.
//!
//! A [`Name`] holds the label sequence of a domain name as read off the
//! wire. Comparison is case-insensitive, as DNS requires; the original
//! spelling is preserved for logging.

use crate::error::{Error, Result};
use std::fmt;

/// Maximum length of a single label.
const MAX_LABEL_LEN: usize = 63;

/// Maximum wire length of a name, including the root label.
const MAX_NAME_LEN: usize = 255;

/// Maximum number of compression pointers followed per name.
const MAX_POINTERS: usize = 64;

/// A domain name read from a DNS message.
#[derive(Debug, Clone, Default)]
pub struct Name {
    /// Labels in wire order, original case.
    labels: Vec<Vec<u8>>,
}

impl Name {
    /// The root name.
    pub fn root() -> Self {
        Self { labels: Vec::new() }
    }

    /// Returns the number of labels.
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Returns true if this is the root name.
    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Parses a name from `message` starting at `offset`.
    ///
    /// Compression pointers are followed (they may appear in responses even
    /// inside the question section). Returns the name and the number of
    /// bytes the name occupies at `offset` — pointers count as two bytes,
    /// not the length of their target.
    pub fn parse(message: &[u8], offset: usize) -> Result<(Self, usize)> {
        let mut labels = Vec::new();
        let mut pos = offset;
        let mut consumed = None;
        let mut jumps = 0usize;
        let mut wire_len = 0usize;

        loop {
            let len_byte = *message
                .get(pos)
                .ok_or(Error::buffer_too_short(pos + 1, message.len()))?
                as usize;

            match len_byte {
                0 => {
                    let end = pos + 1;
                    return Ok((
                        Self { labels },
                        consumed.unwrap_or(end - offset),
                    ));
                }
                1..=MAX_LABEL_LEN => {
                    let start = pos + 1;
                    let end = start + len_byte;
                    let label = message
                        .get(start..end)
                        .ok_or(Error::buffer_too_short(end, message.len()))?;

                    wire_len += len_byte + 1;
                    if wire_len >= MAX_NAME_LEN {
                        return Err(Error::NameTooLong);
                    }

                    labels.push(label.to_vec());
                    pos = end;
                }
                0xC0..=0xFF => {
                    let second = *message
                        .get(pos + 1)
                        .ok_or(Error::buffer_too_short(pos + 2, message.len()))?
                        as usize;
                    let target = ((len_byte & 0x3F) << 8) | second;

                    // Pointers must go backwards, and chains must terminate.
                    if target >= pos {
                        return Err(Error::InvalidPointer { offset: pos });
                    }
                    jumps += 1;
                    if jumps > MAX_POINTERS {
                        return Err(Error::InvalidPointer { offset: pos });
                    }

                    if consumed.is_none() {
                        consumed = Some(pos + 2 - offset);
                    }
                    pos = target;
                }
                _ => {
                    return Err(Error::InvalidData {
                        offset: pos,
                        message: "unsupported label type",
                    })
                }
            }
        }
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(other.labels.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for Name {}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return f.write_str(".");
        }
        for label in &self.labels {
            for &b in label {
                match b {
                    b'.' | b'\\' => write!(f, "\\{}", b as char)?,
                    0x21..=0x7E => write!(f, "{}", b as char)?,
                    _ => write!(f, "\\{b:03}")?,
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(labels: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for label in labels {
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
        out.push(0);
        out
    }

    #[test]
    fn parse_simple() {
        let data = wire(&[b"example", b"com"]);
        let (name, consumed) = Name::parse(&data, 0).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(name.label_count(), 2);
        assert_eq!(name.to_string(), "example.com.");
    }

    #[test]
    fn parse_root() {
        let (name, consumed) = Name::parse(&[0], 0).unwrap();
        assert!(name.is_root());
        assert_eq!(consumed, 1);
        assert_eq!(name.to_string(), ".");
    }

    #[test]
    fn case_insensitive_equality() {
        let (a, _) = Name::parse(&wire(&[b"Example", b"COM"]), 0).unwrap();
        let (b, _) = Name::parse(&wire(&[b"example", b"com"]), 0).unwrap();
        let (c, _) = Name::parse(&wire(&[b"other", b"com"]), 0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parse_with_pointer() {
        // "com." at offset 0, "www" + pointer to 0 at offset 5.
        let mut data = wire(&[b"com"]);
        let target = 0u16;
        data.push(3);
        data.extend_from_slice(b"www");
        data.extend_from_slice(&(0xC000u16 | target).to_be_bytes());

        let (name, consumed) = Name::parse(&data, 5).unwrap();
        assert_eq!(name.to_string(), "www.com.");
        // label byte + "www" + 2-byte pointer
        assert_eq!(consumed, 6);
    }

    #[test]
    fn forward_pointer_rejected() {
        let data = [0xC0, 0x10];
        assert!(matches!(
            Name::parse(&data, 0),
            Err(Error::InvalidPointer { .. })
        ));
    }

    #[test]
    fn truncated_label_rejected() {
        let data = [5, b'a', b'b'];
        assert!(matches!(
            Name::parse(&data, 0),
            Err(Error::BufferTooShort { .. })
        ));
    }
}
