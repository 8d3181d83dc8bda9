//! Render backend that keeps everything in memory
//!
//! Useful headless and in tests: clones share state, so one clone can be
//! handed to a sink while another observes what the sink did.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SinkError;
use crate::sink::RenderBackend;

#[derive(Debug, Default)]
struct MemoryState {
    format: Option<(u16, u32)>,
    pushed: Vec<u32>,
    samples: usize,
    gain: f32,
    offsets: Vec<f64>,
    clock_ms: f64,
    latency_ms: f64,
    disconnects: u32,
}

#[derive(Debug, Clone)]
pub struct MemoryRenderer {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryRenderer {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl MemoryRenderer {
    pub fn new(latency_ms: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                gain: 1.0,
                latency_ms,
                ..Default::default()
            })),
        }
    }

    /// Move the simulated hardware clock
    pub fn set_clock_ms(&self, clock_ms: f64) {
        self.state.lock().clock_ms = clock_ms;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().format.is_some()
    }

    pub fn format(&self) -> Option<(u16, u32)> {
        self.state.lock().format
    }

    pub fn pushed_indices(&self) -> Vec<u32> {
        self.state.lock().pushed.clone()
    }

    pub fn samples_pushed(&self) -> usize {
        self.state.lock().samples
    }

    pub fn gain(&self) -> f32 {
        self.state.lock().gain
    }

    pub fn offsets(&self) -> Vec<f64> {
        self.state.lock().offsets.clone()
    }

    pub fn disconnects(&self) -> u32 {
        self.state.lock().disconnects
    }
}

impl RenderBackend for MemoryRenderer {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&mut self, channels: u16, rate: u32) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if state.format.is_some() {
            return Err(SinkError::Render("renderer already open".into()));
        }
        state.format = Some((channels, rate));
        Ok(())
    }

    fn push_buffer(&mut self, index: u32, samples: &[f32]) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if state.format.is_none() {
            return Err(SinkError::Render("renderer not open".into()));
        }
        state.pushed.push(index);
        state.samples += samples.len();
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) {
        self.state.lock().gain = gain;
    }

    fn output_clock_ms(&self) -> f64 {
        self.state.lock().clock_ms
    }

    fn output_latency_ms(&self) -> f64 {
        self.state.lock().latency_ms
    }

    fn set_stream_offset(&mut self, offset_ms: f64) {
        self.state.lock().offsets.push(offset_ms);
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock();
        state.format = None;
        state.disconnects += 1;
    }
}
