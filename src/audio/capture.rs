//! Audio capture from input devices
//!
//! The cpal stream lives on its own thread for as long as the capture runs.
//! Captured f32 frames are converted to s16le and handed to the pipeline as a
//! plain byte stream.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::audio::device::resolve_device;
use crate::error::AudioError;

/// Byte stream queue depth between the cpal callback and the chunker
const CAPTURE_QUEUE_LEN: usize = 256;

/// Capture of one input device as an s16le PCM byte stream
pub struct DeviceCapture {
    device_id: Option<String>,
    config: StreamConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    bytes_captured: Arc<AtomicU64>,
    overflows: Arc<AtomicU64>,
}

impl DeviceCapture {
    /// `None` captures the default input device at its default config
    pub fn new(device_id: Option<&str>, channels: Option<u16>) -> Result<Self, AudioError> {
        let device = resolve_device(device_id, true)?;
        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        let config = StreamConfig {
            channels: channels.unwrap_or(default_config.channels()),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device_id: device_id.map(str::to_string),
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            bytes_captured: Arc::new(AtomicU64::new(0)),
            overflows: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Start the stream; the returned receiver ends when capture stops
    pub fn start(&mut self) -> Result<mpsc::Receiver<Bytes>, AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::StreamError("capture already running".into()));
        }

        let device = resolve_device(self.device_id.as_deref(), true)?;
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (pcm_tx, pcm_rx) = mpsc::channel::<Bytes>(CAPTURE_QUEUE_LEN);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let bytes_captured = self.bytes_captured.clone();
        let overflows = self.overflows.clone();
        let config = self.config.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("device-capture".to_string())
            .spawn(move || {
                let stream_error_tx = error_tx.clone();
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let mut pcm = Vec::with_capacity(data.len() * 2);
                        for sample in data {
                            let s = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                            pcm.extend_from_slice(&s.to_le_bytes());
                        }
                        bytes_captured.fetch_add(pcm.len() as u64, Ordering::Relaxed);
                        // never block the audio callback
                        if pcm_tx.try_send(Bytes::from(pcm)).is_err() {
                            overflows.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    move |err| {
                        let _ = stream_error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start capture stream: {}", e);
                            let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                            return;
                        }
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                        // dropping the stream ends capture and closes the byte stream
                    }
                    Err(e) => {
                        tracing::error!("Failed to build capture stream: {}", e);
                        let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(pcm_rx)
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        if let Some(errors) = self.error_rx.take() {
            for e in errors.try_iter() {
                tracing::warn!("Capture stream error: {}", e);
            }
        }
        tracing::debug!(
            bytes = self.bytes_captured.load(Ordering::Relaxed),
            overflows = self.overflows.load(Ordering::Relaxed),
            "Device capture stopped"
        );
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
