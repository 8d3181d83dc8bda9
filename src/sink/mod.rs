//! Audio sinks
//!
//! A sink plays one source at a time through a [`RenderBackend`] and keeps
//! the backend's position aligned with the synchronized clock.

pub mod descriptor;
pub mod memory;
pub mod synchronizer;

pub use descriptor::{SinkDescriptor, SinkPatch};
pub use memory::MemoryRenderer;
pub use synchronizer::{AudioSink, SinkState};

use crate::error::SinkError;

/// The narrow contract a sink needs from an output device
///
/// Samples are interleaved f32 at the rate given to `open`. The backend plays
/// stream position `output_clock_ms() + offset`, where the offset is the last
/// value passed to `set_stream_offset`, and chunk `i` covers stream position
/// `i * chunk_duration`.
pub trait RenderBackend: Send {
    /// Short backend name published in the sink descriptor
    fn name(&self) -> &str;

    fn open(&mut self, channels: u16, rate: u32) -> Result<(), SinkError>;

    fn push_buffer(&mut self, index: u32, samples: &[f32]) -> Result<(), SinkError>;

    fn set_gain(&mut self, gain: f32);

    /// Hardware clock in milliseconds since `open`
    fn output_clock_ms(&self) -> f64;

    fn output_latency_ms(&self) -> f64;

    fn set_stream_offset(&mut self, offset_ms: f64);

    /// Release the device; safe to call when not open
    fn disconnect(&mut self);
}
