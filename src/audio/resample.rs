//! Sample rate conversion ahead of the chunker
//!
//! Producers run at their native rate; the transcoder only accepts its fixed
//! working rate. The resampler sits between the producer's byte stream and
//! the chunker and does not know about chunk indices.

use bytes::Bytes;
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;

use crate::audio::chunk::{i16_to_pcm_bytes, pcm_bytes_to_i16};
use crate::error::AudioError;

/// Input frames fed to rubato per call
const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// Converts interleaved s16le PCM between two rates
pub struct PcmResampler {
    resampler: FftFixedIn<f32>,
    channels: usize,
    from_rate: u32,
    to_rate: u32,
    frames_in: u64,
    frames_out: u64,
    /// Planar input waiting for a full resampler chunk
    input: Vec<Vec<f32>>,
    /// Odd trailing byte from the previous push
    carry: Option<u8>,
    /// Partial frame (fewer samples than channels) from the previous push
    partial_frame: Vec<i16>,
}

impl PcmResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Result<Self, AudioError> {
        if channels == 0 {
            return Err(AudioError::UnsupportedFormat("zero channels".into()));
        }
        let resampler = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            RESAMPLER_CHUNK_FRAMES,
            2,
            channels as usize,
        )
        .map_err(|e| AudioError::Resampler(e.to_string()))?;

        Ok(Self {
            resampler,
            channels: channels as usize,
            from_rate,
            to_rate,
            frames_in: 0,
            frames_out: 0,
            input: vec![Vec::with_capacity(RESAMPLER_CHUNK_FRAMES * 2); channels as usize],
            carry: None,
            partial_frame: Vec::new(),
        })
    }

    /// Feed PCM bytes, get back whatever output is ready
    pub fn push(&mut self, bytes: &[u8]) -> Result<Bytes, AudioError> {
        let mut raw = Vec::with_capacity(bytes.len() + 1);
        if let Some(byte) = self.carry.take() {
            raw.push(byte);
        }
        raw.extend_from_slice(bytes);
        if raw.len() % 2 == 1 {
            self.carry = raw.pop();
        }

        let mut samples = std::mem::take(&mut self.partial_frame);
        samples.extend(pcm_bytes_to_i16(&raw));
        let whole = samples.len() - samples.len() % self.channels;
        self.partial_frame = samples.split_off(whole);

        for frame in samples.chunks_exact(self.channels) {
            for (channel, sample) in frame.iter().enumerate() {
                self.input[channel].push(*sample as f32 / 32768.0);
            }
        }
        self.frames_in += (samples.len() / self.channels) as u64;

        let mut output = Vec::new();
        while self.input[0].len() >= self.resampler.input_frames_next() {
            let needed = self.resampler.input_frames_next();
            let block: Vec<Vec<f32>> = self
                .input
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            let planar = self
                .resampler
                .process(&block, None)
                .map_err(|e| AudioError::Resampler(e.to_string()))?;
            self.frames_out += interleave_into(&planar, usize::MAX, &mut output) as u64;
        }

        Ok(i16_to_pcm_bytes(&output))
    }

    /// Resample whatever is still buffered once input has ended
    ///
    /// Output is cut so that the total emitted matches the input length
    /// converted to the target rate. A trailing partial frame is discarded.
    pub fn flush(&mut self) -> Result<Bytes, AudioError> {
        let target = self.frames_in * self.to_rate as u64 / self.from_rate as u64;
        let mut pending: Vec<Vec<f32>> = self.input.iter_mut().map(std::mem::take).collect();
        self.partial_frame.clear();
        self.carry = None;

        let mut output = Vec::new();
        while self.frames_out < target {
            let planar = self
                .resampler
                .process_partial(Some(pending.as_slice()), None)
                .map_err(|e| AudioError::Resampler(e.to_string()))?;
            pending.iter_mut().for_each(Vec::clear);

            let wanted = (target - self.frames_out) as usize;
            let written = interleave_into(&planar, wanted, &mut output);
            if written == 0 {
                break;
            }
            self.frames_out += written as u64;
        }

        Ok(i16_to_pcm_bytes(&output))
    }
}

/// Append at most `limit` frames, returns how many were written
fn interleave_into(planar: &[Vec<f32>], limit: usize, out: &mut Vec<i16>) -> usize {
    let frames = planar.first().map_or(0, |c| c.len()).min(limit);
    out.reserve(frames * planar.len());
    for i in 0..frames {
        for channel in planar {
            out.push((channel[i].clamp(-1.0, 1.0) * 32767.0) as i16);
        }
    }
    frames
}

/// Spawn a task resampling `upstream` into a new byte stream
pub fn spawn_resample_stage(
    mut upstream: mpsc::Receiver<Bytes>,
    mut resampler: PcmResampler,
    capacity: usize,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        while let Some(bytes) = upstream.recv().await {
            match resampler.push(&bytes) {
                Ok(out) if out.is_empty() => {}
                Ok(out) => {
                    if tx.send(out).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("Resampling failed, closing stream: {}", e);
                    return;
                }
            }
        }

        match resampler.flush() {
            Ok(tail) if tail.is_empty() => {}
            Ok(tail) => {
                tracing::debug!(bytes = tail.len(), "flushed resampler tail");
                let _ = tx.send(tail).await;
            }
            Err(e) => tracing::warn!("Failed to flush resampler tail: {}", e),
        }
    });
    rx
}
