//! Error types for overlay operations.

use thiserror::Error;

use concord_wire::WireError;

/// Errors that can occur in the overlay.
///
/// Most of these terminate the session they occur on: the overlay treats
/// each session as single-shot and performs no retries.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// A frame failed to decode. The session carrying it is dropped.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] WireError),

    /// The peer broke the session protocol (non-HELLO before handshake,
    /// duplicate HELLO, version mismatch). The session is dropped.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer never completed the handshake in time.
    #[error("handshake timeout")]
    HandshakeTimeout,

    /// Read or write failure on the underlying transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A frame exceeded the transport's size cap.
    #[error("oversized frame: {0} bytes")]
    OversizedFrame(usize),

    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A configuration value was outside its allowed range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal channel was closed (its task has exited).
    #[error("channel closed")]
    ChannelClosed,
}
