//! Length-prefixed frame codec.
//!
//! Every protocol version moves its messages in frames:
//! - 4 bytes: big-endian body length
//! - N bytes: body (bincode for V9/V10, protobuf for V11)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{P2pError, P2pResult};

/// Largest frame body accepted or sent (128 MiB).
pub const MAX_FRAME_SIZE: usize = 134_217_728;

/// Header size: 4 bytes length.
pub const HEADER_SIZE: usize = 4;

/// Codec for length-prefixed frames.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Expected length of the current frame (if header has been read).
    current_length: Option<usize>,
}

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self {
            current_length: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Self::Item>> {
        let length = match self.current_length {
            Some(length) => length,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                if length > MAX_FRAME_SIZE {
                    return Err(P2pError::MessageTooLarge {
                        size: length,
                        max: MAX_FRAME_SIZE,
                    });
                }

                self.current_length = Some(length);
                length
            }
        };

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(length);
        self.current_length = None;

        Ok(Some(body))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = P2pError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> P2pResult<()> {
        let length = body.len();
        if length > MAX_FRAME_SIZE {
            return Err(P2pError::MessageTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_u32(length as u32);
        dst.put_slice(&body);

        Ok(())
    }
}
