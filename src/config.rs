//! Application configuration
//!
//! Everything here is plain serde data so it can be loaded from a TOML file
//! once at process start and handed to the components that need it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub peer: PeerConfig,
    pub stream: StreamSettings,
    pub opus: OpusConfig,
    pub sink: SinkSettings,
}

/// Identity of the local peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub uuid: Uuid,
    pub name: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: "audio-peer".to_string(),
        }
    }
}

/// Chunking parameters shared by every source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Duration of a single chunk in milliseconds
    pub chunk_duration_ms: u64,
    /// Default latency budget announced by sources
    pub source_latency_ms: u32,
    /// Capacity of every per-consumer chunk queue
    pub consumer_queue_len: usize,
    /// Capacity of the chunker -> encoder hop
    pub pipeline_queue_len: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            chunk_duration_ms: OPUS_CHUNK_DURATION_MS,
            source_latency_ms: DEFAULT_SOURCE_LATENCY_MS,
            consumer_queue_len: DEFAULT_CONSUMER_QUEUE_LEN,
            pipeline_queue_len: DEFAULT_PIPELINE_QUEUE_LEN,
        }
    }
}

impl StreamSettings {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_duration_ms)
    }

    /// Chunks must be exactly one opus frame long and every queue must hold something
    pub fn validate(&self, opus: &OpusConfig) -> Result<()> {
        if self.chunk_duration_ms == 0 {
            return Err(Error::Config("chunk duration must be > 0".into()));
        }
        let opus_ms = opus.frame_duration_ms();
        if (opus_ms - self.chunk_duration_ms as f32).abs() > f32::EPSILON {
            return Err(Error::Config(format!(
                "chunk duration {}ms does not match opus frame {}ms",
                self.chunk_duration_ms, opus_ms
            )));
        }
        if self.consumer_queue_len == 0 || self.pipeline_queue_len == 0 {
            return Err(Error::Config("queue lengths must be > 0".into()));
        }
        Ok(())
    }
}

/// Playback-side synchronization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// How often the playback offset is recomputed
    pub resync_interval_ms: u64,
    /// Skew under which the renderer keeps playing without snapping
    pub min_skew_ms: f64,
    /// How long to wait for the first clock handshake before giving up
    pub time_sync_timeout_ms: u64,
    /// Initial volume for new sinks
    pub volume: f32,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            resync_interval_ms: RESYNC_INTERVAL_MS,
            min_skew_ms: MIN_SKEW_TO_RESYNC_MS,
            time_sync_timeout_ms: 20_000,
            volume: 1.0,
        }
    }
}

impl SinkSettings {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn time_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.time_sync_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resync_interval_ms == 0 {
            return Err(Error::Config("resync interval must be > 0".into()));
        }
        if !self.min_skew_ms.is_finite() || self.min_skew_ms < 0.0 {
            return Err(Error::Config(format!("min skew {}ms must be >= 0", self.min_skew_ms)));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::Config(format!("volume {} outside [0, 1]", self.volume)));
        }
        Ok(())
    }
}

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    /// General audio, music
    Audio,
    /// Speech
    Voip,
    /// Restricted low delay
    LowDelay,
}

/// Opus encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub application: OpusApplication,
    /// Samples per channel per frame
    pub frame_size: usize,
    pub bitrate: u32,
    pub vbr: bool,
    pub cvbr: bool,
    pub fec: bool,
    pub packet_loss_perc: u8,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self::music()
    }
}

impl OpusConfig {
    /// General audio at the working rate with 10ms frames
    pub fn music() -> Self {
        Self {
            sample_rate: OPUS_ENCODER_RATE,
            channels: DEFAULT_CHANNELS,
            application: OpusApplication::Audio,
            frame_size: OPUS_CHUNK_SAMPLES,
            bitrate: DEFAULT_BITRATE,
            vbr: true,
            cvbr: true,
            fec: false,
            packet_loss_perc: 0,
        }
    }

    /// Speech tuned, mono friendly
    pub fn voice() -> Self {
        Self {
            application: OpusApplication::Voip,
            bitrate: 32_000,
            fec: true,
            packet_loss_perc: 5,
            ..Self::music()
        }
    }

    pub fn low_latency() -> Self {
        Self {
            application: OpusApplication::LowDelay,
            frame_size: Self::frame_size_from_ms(OPUS_ENCODER_RATE, 2.5),
            ..Self::music()
        }
    }

    /// Samples per channel for a frame duration
    pub fn frame_size_from_ms(sample_rate: u32, ms: f32) -> usize {
        (sample_rate as f32 * ms / 1000.0) as usize
    }

    pub fn frame_duration_ms(&self) -> f32 {
        self.frame_size as f32 * 1000.0 / self.sample_rate as f32
    }

    /// Bytes of s16 interleaved PCM making up one frame
    pub fn pcm_frame_bytes(&self) -> usize {
        self.frame_size * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Reject parameters libopus cannot handle
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            return Err(Error::Config(format!(
                "unsupported opus sample rate {}",
                self.sample_rate
            )));
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(Error::Config(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        // 2.5, 5, 10, 20, 40 and 60ms frames
        let tenth_ms = self.frame_size * 10_000 / self.sample_rate as usize;
        if self.frame_size * 10_000 % self.sample_rate as usize != 0
            || !matches!(tenth_ms, 25 | 50 | 100 | 200 | 400 | 600)
        {
            return Err(Error::Config(format!(
                "frame size {} is not a valid opus frame at {}Hz",
                self.frame_size, self.sample_rate
            )));
        }
        if self.packet_loss_perc > 100 {
            return Err(Error::Config(format!(
                "packet loss {}% > 100%",
                self.packet_loss_perc
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Platform config location, e.g. `~/.config/synced-audio-streamer/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "synced-audio-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.opus.validate()?;
        self.stream.validate(&self.opus)?;
        self.sink.validate()
    }
}
