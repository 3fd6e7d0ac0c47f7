//! Length-prefixed message framing.
//!
//! Each wire message is a four-byte big-endian length `L` followed by `L`
//! bytes of canonical payload:
//!
//! ```text
//! +-------------------+---------------------+
//! | Length (4 bytes)  | Message body        |
//! +-------------------+---------------------+
//! ```
//!
//! The decoder alternates between reading headers and bodies. Any decode
//! failure is surfaced as an error, which the session layer answers by
//! dropping the connection.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use concord_wire::{Message, WireDecode, WireEncode};

use crate::{OverlayError, Result};

/// Maximum message body size (16 MiB). Prevents memory exhaustion from a
/// hostile length prefix.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Minimum body size: at least the four-byte type tag.
const MIN_MESSAGE_SIZE: usize = 4;

/// Codec for length-prefixed canonical messages.
///
/// Implements tokio's `Encoder`/`Decoder` so a TCP stream can be wrapped
/// with `Framed::new(stream, FrameCodec::new())`.
#[derive(Debug, Default)]
pub struct FrameCodec {
    state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    /// Waiting for the 4-byte length prefix.
    #[default]
    ReadingLength,
    /// Have the length, waiting for the body.
    ReadingBody {
        /// Expected body length.
        len: usize,
    },
}

impl FrameCodec {
    /// Create a codec in its initial state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a message body (without the length prefix).
    ///
    /// This is what travels through the loopback transport, which frames
    /// per message rather than per byte stream.
    pub fn encode_body(message: &Message) -> Vec<u8> {
        message.to_bytes()
    }

    /// Decode a message body (without the length prefix).
    pub fn decode_body(bytes: &[u8]) -> Result<Message> {
        Ok(Message::from_bytes(bytes)?)
    }

    /// Encode a message with its length prefix, as sent on a stream.
    pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
        let body = Self::encode_body(message);
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(OverlayError::OversizedFrame(body.len()));
        }
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.state {
                DecodeState::ReadingLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }

                    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    if len < MIN_MESSAGE_SIZE {
                        return Err(OverlayError::ProtocolViolation(format!(
                            "frame too small: {} bytes",
                            len
                        )));
                    }
                    if len > MAX_MESSAGE_SIZE {
                        return Err(OverlayError::OversizedFrame(len));
                    }

                    src.advance(4);
                    src.reserve(len);
                    self.state = DecodeState::ReadingBody { len };
                }
                DecodeState::ReadingBody { len } => {
                    if src.len() < len {
                        return Ok(None);
                    }

                    let body = src.split_to(len);
                    self.state = DecodeState::ReadingLength;
                    return Ok(Some(Self::decode_body(&body)?));
                }
            }
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = OverlayError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let body = Self::encode_body(&message);
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(OverlayError::OversizedFrame(body.len()));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_wire::{Hello, Message};

    fn hello() -> Message {
        Message::Hello(Hello {
            protocol_version: 1,
            version_str: "test".to_string(),
            listening_port: 4444,
        })
    }

    #[test]
    fn frame_round_trip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(hello(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, hello());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_reads_resume() {
        let frame = FrameCodec::encode_frame(&hello()).unwrap();
        let mut codec = FrameCodec::new();

        // Header split across reads.
        let mut buf = BytesMut::from(&frame[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Body split across reads.
        buf.extend_from_slice(&frame[2..frame.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 3..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), hello());
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(hello(), &mut buf).unwrap();
        codec.encode(Message::GetPeers, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), hello());
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::GetPeers);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(OverlayError::OversizedFrame(_))
        ));
    }

    #[test]
    fn garbage_body_is_malformed() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());

        assert!(matches!(
            codec.decode(&mut buf),
            Err(OverlayError::MalformedMessage(_))
        ));
    }
}
