//! Decode errors.
//!
//! Both variants mean the same thing to a receiver: the frame is malformed
//! and must be discarded. They are kept separate so logs can distinguish a
//! garbage tag (likely a foreign writer on the stream) from a short read.

use thiserror::Error;

/// Errors produced by [`Frame::decode`](crate::Frame::decode).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The leading tag byte does not name any frame variant.
    #[error("unknown frame tag {tag:#04x}")]
    UnknownTag {
        /// The unrecognized tag byte.
        tag: u8,
    },

    /// The buffer ended before the variant's fixed fields were complete.
    #[error("truncated frame: need {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum length the tagged variant requires.
        expected: usize,
        /// Length actually available.
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_tag() {
        let err = ProtocolError::UnknownTag { tag: 0x7f };
        assert!(err.to_string().contains("0x7f"));
    }
}
