//! Device playback addressed by stream position
//!
//! Decoded chunks are stored by index. The output callback derives which
//! stream position should be audible from the device clock plus the offset
//! pushed by the sink, and keeps reading sequentially as long as it stays
//! within the skew tolerance. A larger skew snaps the read position (an
//! audible glitch, but all sinks land in phase again).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use parking_lot::Mutex;

use crate::audio::device::resolve_device;
use crate::constants::{MIN_SKEW_TO_RESYNC_MS, OPUS_CHUNK_SAMPLES, OPUS_ENCODER_RATE};
use crate::error::SinkError;
use crate::sink::RenderBackend;

/// Chunks older than this many chunks behind the read cursor are discarded
const KEEP_BEHIND_CHUNKS: u64 = 4;

/// Index-addressed sample store with a read cursor
#[derive(Debug)]
pub struct PlayoutBuffer {
    channels: usize,
    rate: u32,
    chunk_frames: u64,
    min_skew_frames: u64,
    chunks: BTreeMap<u32, Vec<f32>>,
    offset_ms: Option<f64>,
    /// Stream position in frames of the next frame to play
    cursor: Option<u64>,
    snaps: u64,
    underruns: u64,
}

impl PlayoutBuffer {
    pub fn new(channels: u16, rate: u32, chunk_frames: usize, min_skew_ms: f64) -> Self {
        Self {
            channels: channels.max(1) as usize,
            rate,
            chunk_frames: chunk_frames as u64,
            min_skew_frames: (min_skew_ms * rate as f64 / 1000.0) as u64,
            chunks: BTreeMap::new(),
            offset_ms: None,
            cursor: None,
            snaps: 0,
            underruns: 0,
        }
    }

    pub fn push(&mut self, index: u32, samples: Vec<f32>) {
        self.chunks.insert(index, samples);
    }

    pub fn set_offset(&mut self, offset_ms: f64) {
        self.offset_ms = Some(offset_ms);
    }

    pub fn offset_ms(&self) -> Option<f64> {
        self.offset_ms
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Times the read position jumped to catch up with the clock
    pub fn snaps(&self) -> u64 {
        self.snaps
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    pub fn buffered_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Fill `out` (interleaved) for a device buffer starting at `clock_ms`
    pub fn render(&mut self, out: &mut [f32], clock_ms: f64) {
        let Some(offset) = self.offset_ms else {
            out.fill(0.0);
            return;
        };

        let expected_ms = clock_ms + offset;
        let expected = if expected_ms <= 0.0 {
            0
        } else {
            (expected_ms * self.rate as f64 / 1000.0) as u64
        };

        match self.cursor {
            Some(cursor) if cursor.abs_diff(expected) <= self.min_skew_frames => {}
            Some(cursor) => {
                tracing::debug!(from = cursor, to = expected, "playout position snapped");
                self.snaps += 1;
                self.cursor = Some(expected);
            }
            None => self.cursor = Some(expected),
        }

        let mut cursor = self.cursor.unwrap_or(expected);
        let mut missing = false;
        for frame in out.chunks_mut(self.channels) {
            let index = (cursor / self.chunk_frames) as u32;
            let within = (cursor % self.chunk_frames) as usize * self.channels;
            match self.chunks.get(&index) {
                Some(samples) if within + frame.len() <= samples.len() => {
                    frame.copy_from_slice(&samples[within..within + frame.len()]);
                }
                _ => {
                    frame.fill(0.0);
                    missing = true;
                }
            }
            cursor += 1;
        }
        if missing {
            self.underruns += 1;
        }
        self.cursor = Some(cursor);

        let oldest_kept = (cursor / self.chunk_frames).saturating_sub(KEEP_BEHIND_CHUNKS) as u32;
        self.chunks = self.chunks.split_off(&oldest_kept);
    }
}

struct PlaybackShared {
    buffer: Mutex<PlayoutBuffer>,
    gain: AtomicU32,
    frames_played: AtomicU64,
    running: AtomicBool,
}

/// cpal output device driven through the render backend contract
pub struct CpalRenderer {
    device_id: Option<String>,
    min_skew_ms: f64,
    rate: u32,
    shared: Option<Arc<PlaybackShared>>,
    latency_ms: f64,
    pending_gain: f32,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalRenderer {
    /// `None` renders to the default output device
    pub fn new(device_id: Option<&str>) -> Self {
        Self {
            device_id: device_id.map(str::to_string),
            min_skew_ms: MIN_SKEW_TO_RESYNC_MS,
            rate: OPUS_ENCODER_RATE,
            shared: None,
            latency_ms: 0.0,
            pending_gain: 1.0,
            thread_handle: None,
        }
    }

    pub fn with_min_skew_ms(mut self, min_skew_ms: f64) -> Self {
        self.min_skew_ms = min_skew_ms;
        self
    }
}

impl RenderBackend for CpalRenderer {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open(&mut self, channels: u16, rate: u32) -> Result<(), SinkError> {
        if self.shared.is_some() {
            return Err(SinkError::Render("renderer already open".into()));
        }

        let device = resolve_device(self.device_id.as_deref(), false)
            .map_err(|e| SinkError::Render(e.to_string()))?;
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let chunk_frames = (rate as usize * OPUS_CHUNK_SAMPLES) / OPUS_ENCODER_RATE as usize;
        let shared = Arc::new(PlaybackShared {
            buffer: Mutex::new(PlayoutBuffer::new(channels, rate, chunk_frames, self.min_skew_ms)),
            gain: AtomicU32::new(self.pending_gain.to_bits()),
            frames_played: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });

        let callback_shared = shared.clone();
        let thread_shared = shared.clone();
        let frames_per_ms = rate as f64 / 1000.0;
        let frame_width = channels.max(1) as usize;

        // the stream is built on its own thread; wait for it to report back
        let (init_tx, init_rx) = sync_channel::<Result<(), SinkError>>(1);

        let handle = thread::Builder::new()
            .name("device-playback".to_string())
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let played = callback_shared.frames_played.load(Ordering::Relaxed);
                        let clock_ms = played as f64 / frames_per_ms;
                        callback_shared.buffer.lock().render(data, clock_ms);

                        let gain = f32::from_bits(callback_shared.gain.load(Ordering::Relaxed));
                        for sample in data.iter_mut() {
                            *sample *= gain;
                        }
                        let frames = (data.len() / frame_width) as u64;
                        callback_shared.frames_played.fetch_add(frames, Ordering::Relaxed);
                    },
                    |err| tracing::error!("Playback stream error: {}", err),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = init_tx.send(Err(SinkError::Render(format!(
                            "failed to build playback stream: {}",
                            e
                        ))));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = init_tx.send(Err(SinkError::Render(format!(
                        "failed to start playback stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = init_tx.send(Ok(()));

                while thread_shared.running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| SinkError::Render(e.to_string()))?;

        let started = init_rx
            .recv()
            .unwrap_or_else(|_| Err(SinkError::Render("playback thread died".into())));
        if let Err(e) = started {
            let _ = handle.join();
            tracing::error!("Failed to open playback device: {}", e);
            return Err(e);
        }
        tracing::info!(channels, rate, "Playback stream started");

        // cpal does not report device latency portably, assume one default period
        self.latency_ms = 10.0;
        self.rate = rate;
        self.shared = Some(shared);
        self.thread_handle = Some(handle);
        Ok(())
    }

    fn push_buffer(&mut self, index: u32, samples: &[f32]) -> Result<(), SinkError> {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| SinkError::Render("renderer not open".into()))?;
        shared.buffer.lock().push(index, samples.to_vec());
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) {
        self.pending_gain = gain;
        if let Some(shared) = &self.shared {
            shared.gain.store(gain.to_bits(), Ordering::Relaxed);
        }
    }

    fn output_clock_ms(&self) -> f64 {
        self.shared.as_ref().map_or(0.0, |shared| {
            shared.frames_played.load(Ordering::Relaxed) as f64 * 1000.0 / self.rate as f64
        })
    }

    fn output_latency_ms(&self) -> f64 {
        self.latency_ms
    }

    fn set_stream_offset(&mut self, offset_ms: f64) {
        if let Some(shared) = &self.shared {
            shared.buffer.lock().set_offset(offset_ms);
        }
    }

    fn disconnect(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.running.store(false, Ordering::SeqCst);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalRenderer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_fails_when_stream_cannot_be_built() {
        let mut renderer = CpalRenderer::new(None);
        // zero channels never yields a stream, with or without a device
        assert!(matches!(renderer.open(0, 48_000), Err(SinkError::Render(_))));
        assert!(renderer.shared.is_none());
        assert!(matches!(renderer.push_buffer(0, &[0.0; 4]), Err(SinkError::Render(_))));
        renderer.disconnect();
    }

    // 1 channel, 1kHz, 10 frames per chunk: one frame per ms
    fn buffer() -> PlayoutBuffer {
        PlayoutBuffer::new(1, 1000, 10, 10.0)
    }

    fn ramp(index: u32) -> Vec<f32> {
        (0..10).map(|i| (index * 10 + i) as f32).collect()
    }

    #[test]
    fn test_silence_before_offset_known() {
        let mut playout = buffer();
        playout.push(0, ramp(0));
        let mut out = [1.0f32; 5];
        playout.render(&mut out, 0.0);
        assert_eq!(out, [0.0; 5]);
        assert!(playout.cursor().is_none());
    }

    #[test]
    fn test_reads_position_from_clock_and_offset() {
        let mut playout = buffer();
        for i in 0..5 {
            playout.push(i, ramp(i));
        }
        playout.set_offset(20.0);
        let mut out = [0.0f32; 5];
        playout.render(&mut out, 3.0);
        // stream position 23ms
        assert_eq!(out, [23.0, 24.0, 25.0, 26.0, 27.0]);

        // sequential continuation
        playout.render(&mut out, 8.0);
        assert_eq!(out, [28.0, 29.0, 30.0, 31.0, 32.0]);
        assert_eq!(playout.snaps(), 0);
    }

    #[test]
    fn test_small_skew_is_tolerated_large_skew_snaps() {
        let mut playout = buffer();
        for i in 0..10 {
            playout.push(i, ramp(i));
        }
        playout.set_offset(0.0);
        let mut out = [0.0f32; 5];
        playout.render(&mut out, 10.0);
        assert_eq!(out[0], 10.0);

        // clock says 19ms but cursor is at 15: within 10ms, keep reading
        playout.render(&mut out, 19.0);
        assert_eq!(out[0], 15.0);
        assert_eq!(playout.snaps(), 0);

        // offset jumps by 40ms: snap
        playout.set_offset(40.0);
        playout.render(&mut out, 25.0);
        assert_eq!(out[0], 65.0);
        assert_eq!(playout.snaps(), 1);
    }

    #[test]
    fn test_missing_chunk_plays_silence() {
        let mut playout = buffer();
        playout.push(0, ramp(0));
        playout.set_offset(0.0);
        let mut out = [9.0f32; 15];
        playout.render(&mut out, 0.0);
        assert_eq!(out[9], 9.0);
        assert_eq!(out[10], 0.0);
        assert_eq!(playout.underruns(), 1);
    }

    #[test]
    fn test_old_chunks_are_pruned() {
        let mut playout = buffer();
        for i in 0..20 {
            playout.push(i, ramp(i));
        }
        playout.set_offset(150.0);
        let mut out = [0.0f32; 10];
        playout.render(&mut out, 0.0);
        assert!(playout.buffered_chunks() <= 20 - 12 + 1);
    }
}
