//! Wire framing for chunks
//!
//! A frame is the chunk index as a little endian `u32` followed by the
//! payload. There is no length field: the transport delivers one frame per
//! message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::audio::chunk::AudioChunk;
use crate::error::FramingError;

/// Size of the index header
pub const FRAME_HEADER_LEN: usize = 4;

pub fn encode_frame(chunk: &AudioChunk) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + chunk.payload.len());
    frame.put_u32_le(chunk.index);
    frame.extend_from_slice(&chunk.payload);
    frame.freeze()
}

/// Split a frame back into index and payload without copying the payload
pub fn decode_frame(mut frame: Bytes) -> Result<AudioChunk, FramingError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(FramingError::Truncated(frame.len()));
    }
    let index = frame.get_u32_le();
    Ok(AudioChunk {
        index,
        payload: frame,
    })
}
