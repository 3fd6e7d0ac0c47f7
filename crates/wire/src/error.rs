//! Error type for wire encoding and decoding.

use thiserror::Error;

/// Errors that can occur while decoding wire data.
///
/// Encoding is infallible; every error here is a property of untrusted
/// input. The overlay maps any `WireError` to a malformed-message session
/// drop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the value was complete.
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    /// A union tag did not name a known variant.
    #[error("unknown {context} tag {tag}")]
    UnknownTag {
        /// The union being decoded.
        context: &'static str,
        /// The offending tag value.
        tag: u32,
    },

    /// A declared length exceeds the bytes actually available.
    #[error("declared length {declared} exceeds remaining input {remaining}")]
    LengthOverrun {
        /// Length claimed by the input.
        declared: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A value was outside its canonical range (e.g. a port above 65535
    /// or a boolean word that is neither 0 nor 1).
    #[error("value out of range for {0}")]
    OutOfRange(&'static str),

    /// String contents were not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// A top-level decode left unconsumed bytes.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// Nested quorum sets exceeded the decoder's depth cap.
    #[error("quorum set nesting exceeds depth {0}")]
    NestingTooDeep(u32),
}
