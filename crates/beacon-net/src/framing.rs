//! Message framing for the gossip transport.
//!
//! Provides length-prefixed tagged frames over a byte stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("empty frame")]
    Empty,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A tagged frame. The tag is the gossip message tag; the codec carries it
/// opaquely and message decoding validates it.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

impl Frame {
    pub fn new(tag: u8, body: impl Into<Bytes>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes tag byte)
/// - 1 byte: tag
/// - N bytes: body
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 tag)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        // The length covers at least the tag byte.
        if length == 0 {
            return Err(FrameError::Empty);
        }

        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        let tag = src[0];
        src.advance(1);
        let body = src.split_to(length - 1).freeze();

        Ok(Some(Frame { tag, body }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.body.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.put_u32(length as u32);
        dst.put_u8(item.tag);
        dst.put_slice(&item.body);

        Ok(())
    }
}
