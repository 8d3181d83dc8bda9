//! Indexed audio chunk

use std::time::Duration;

use bytes::Bytes;

/// A fixed-duration slice of PCM or encoded audio
///
/// `index` is the real-time slot the chunk occupies since its source started,
/// so `index * chunk_duration` is the chunk's position in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub index: u32,
    pub payload: Bytes,
}

impl AudioChunk {
    pub fn new(index: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            index,
            payload: payload.into(),
        }
    }

    /// Same index, payload copied into a fresh allocation
    pub fn deep_copy(&self) -> Self {
        Self {
            index: self.index,
            payload: Bytes::copy_from_slice(&self.payload),
        }
    }

    /// Stream position of this chunk
    pub fn stream_offset(&self, chunk_duration: Duration) -> Duration {
        chunk_duration * self.index
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Reinterpret s16le PCM bytes as samples
pub fn pcm_bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Serialize samples as s16le bytes
pub fn i16_to_pcm_bytes(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}

/// Serialize f32 samples as little endian bytes
pub fn f32_to_bytes(samples: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}

pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
