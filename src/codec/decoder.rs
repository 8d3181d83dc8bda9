//! Opus decoder wrapper
//!
//! Output is copied out of the decoder's scratch buffer, which is reused
//! across calls.

use opus::Decoder;

use crate::audio::chunk::{f32_to_bytes, AudioChunk};
use crate::codec::encoder::opus_channels;
use crate::error::CodecError;

/// 120ms at 48kHz stereo
const MAX_DECODED_SAMPLES: usize = 48000 * 2 * 120 / 1000;

pub struct OpusDecoder {
    decoder: Decoder,
    channels: u16,
    decode_buffer: Vec<f32>,
    /// Samples per channel of the last decoded packet, the length of a concealed frame
    last_frame_size: usize,
    frames_decoded: u64,
    frames_concealed: u64,
    /// Index of the last chunk handed to `decode_chunk`
    last_index: Option<u32>,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let opus_channels = opus_channels(channels)
            .ok_or_else(|| CodecError::DecoderInit(format!("Unsupported channel count: {}", channels)))?;

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            channels,
            decode_buffer: vec![0.0f32; MAX_DECODED_SAMPLES],
            // 10ms until a real packet says otherwise
            last_frame_size: sample_rate as usize / 100,
            frames_decoded: 0,
            frames_concealed: 0,
            last_index: None,
        })
    }

    /// Decode one packet into owned interleaved samples
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        let samples = self
            .decoder
            .decode_float(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_decoded += 1;
        self.last_frame_size = samples;
        Ok(self.decode_buffer[..samples * self.channels as usize].to_vec())
    }

    /// Packet loss concealment for a frame that never arrived
    ///
    /// libopus conceals as many samples as the output holds, so the output is
    /// cut to one frame of the current packet size.
    pub fn decode_plc(&mut self) -> Result<Vec<f32>, CodecError> {
        let len = (self.last_frame_size * self.channels as usize).min(self.decode_buffer.len());
        let samples = self
            .decoder
            .decode_float(&[], &mut self.decode_buffer[..len], false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_concealed += 1;
        Ok(self.decode_buffer[..samples * self.channels as usize].to_vec())
    }

    /// Opus chunk in, f32 PCM chunk out, index untouched
    ///
    /// A single missing index right before this one is concealed and returned
    /// first, so the caller sees a gap-free sequence where possible.
    pub fn decode_chunk(&mut self, chunk: &AudioChunk) -> Result<Vec<AudioChunk>, CodecError> {
        let mut out = Vec::with_capacity(2);
        if let Some(last) = self.last_index {
            if chunk.index == last.wrapping_add(2) {
                let concealed = self.decode_plc()?;
                out.push(AudioChunk::new(last.wrapping_add(1), f32_to_bytes(&concealed)));
            }
        }
        let samples = self.decode(&chunk.payload)?;
        out.push(AudioChunk::new(chunk.index, f32_to_bytes(&samples)));
        self.last_index = Some(chunk.index);
        Ok(out)
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_concealed: self.frames_concealed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_concealed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chunk::{bytes_to_f32, i16_to_pcm_bytes};
    use crate::codec::OpusEncoder;
    use crate::config::OpusConfig;

    fn sine_chunk(index: u32, frames: usize) -> AudioChunk {
        let mut samples = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let t = (index as usize * frames + i) as f32 / 48000.0;
            let v = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 12000.0) as i16;
            samples.push(v);
            samples.push(v);
        }
        AudioChunk::new(index, i16_to_pcm_bytes(&samples))
    }

    #[test]
    fn test_encode_decode_roundtrip_shape() {
        let mut encoder = OpusEncoder::new(OpusConfig::music()).unwrap();
        let mut decoder = OpusDecoder::new(48000, 2).unwrap();

        let encoded = encoder.encode_chunk(&sine_chunk(5, 480)).unwrap();
        let decoded = decoder.decode_chunk(&encoded).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].index, 5);
        let samples = bytes_to_f32(&decoded[0].payload);
        // lossy: same channel layout and frame length, not the same values
        assert_eq!(samples.len() % 2, 0);
        assert_eq!(samples.len() / 2, 480);
        assert!(samples.iter().all(|s| s.is_finite() && s.abs() <= 1.5));
    }

    #[test]
    fn test_single_gap_is_concealed() {
        let mut encoder = OpusEncoder::new(OpusConfig::music()).unwrap();
        let mut decoder = OpusDecoder::new(48000, 2).unwrap();

        let first = encoder.encode_chunk(&sine_chunk(1, 480)).unwrap();
        let _lost = encoder.encode_chunk(&sine_chunk(2, 480)).unwrap();
        let third = encoder.encode_chunk(&sine_chunk(3, 480)).unwrap();

        decoder.decode_chunk(&first).unwrap();
        let out = decoder.decode_chunk(&third).unwrap();
        assert_eq!(out.iter().map(|c| c.index).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(decoder.stats().frames_concealed, 1);
        // the concealed chunk covers exactly one 10ms slot
        assert_eq!(bytes_to_f32(&out[0].payload).len(), 480 * 2);
        assert_eq!(bytes_to_f32(&out[1].payload).len(), 480 * 2);
    }

    #[test]
    fn test_concealment_before_any_packet_is_one_slot() {
        let mut decoder = OpusDecoder::new(48000, 1).unwrap();
        assert_eq!(decoder.decode_plc().unwrap().len(), 480);
    }

    #[test]
    fn test_decoder_output_is_owned() {
        let mut encoder = OpusEncoder::new(OpusConfig::music()).unwrap();
        let mut decoder = OpusDecoder::new(48000, 2).unwrap();

        let a = decoder.decode(&encoder.encode_chunk(&sine_chunk(1, 480)).unwrap().payload).unwrap();
        let snapshot = a.clone();
        let _b = decoder.decode(&encoder.encode_chunk(&sine_chunk(2, 480)).unwrap().payload).unwrap();
        assert_eq!(a, snapshot);
    }
}
