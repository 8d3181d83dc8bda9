//! Opus encoder wrapper
//!
//! Encodes one fixed-size s16 PCM chunk into exactly one Opus frame.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::audio::chunk::{pcm_bytes_to_i16, AudioChunk};
use crate::config::{OpusApplication, OpusConfig};
use crate::constants::MAX_OPUS_PACKET;
use crate::error::CodecError;

pub struct OpusEncoder {
    encoder: Encoder,
    config: OpusConfig,
    /// Reused between calls, output is copied out
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    pub fn new(config: OpusConfig) -> Result<Self, CodecError> {
        config
            .validate()
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        let channels = opus_channels(config.channels)
            .ok_or_else(|| CodecError::EncoderInit(format!("Unsupported channel count: {}", config.channels)))?;

        let application = match config.application {
            OpusApplication::Audio => Application::Audio,
            OpusApplication::Voip => Application::Voip,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = Encoder::new(config.sample_rate, channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        Self::configure_encoder(&mut encoder, &config)?;

        Ok(Self {
            encoder,
            config,
            encode_buffer: vec![0u8; MAX_OPUS_PACKET],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        if config.vbr && config.cvbr {
            encoder
                .set_vbr_constraint(true)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set CVBR: {}", e)))?;
        }

        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if config.fec {
            encoder
                .set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    /// Encode interleaved samples, `frame_size * channels` of them
    pub fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        if samples.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// PCM chunk in, Opus chunk out, index untouched
    pub fn encode_chunk(&mut self, chunk: &AudioChunk) -> Result<AudioChunk, CodecError> {
        let samples = pcm_bytes_to_i16(&chunk.payload);
        let frame = self.encode(&samples)?;
        Ok(AudioChunk::new(chunk.index, frame))
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }

    pub fn samples_per_frame(&self) -> usize {
        self.config.frame_size * self.config.channels as usize
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

pub(crate) fn opus_channels(channels: u16) -> Option<Channels> {
    match channels {
        1 => Some(Channels::Mono),
        2 => Some(Channels::Stereo),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
