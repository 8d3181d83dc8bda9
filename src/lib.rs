//! # Synced Audio Streamer
//!
//! Real-time core for distributing live audio from producing devices or
//! processes to many playback endpoints across a network of peers, with
//! playback kept in phase through a shared logical clock.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── PRODUCING PEER ─────────────────────────────┐
//! │                                                                              │
//! │  ┌──────────────┐   ┌────────────┐   ┌─────────┐   ┌──────────────┐          │
//! │  │ Device / Proc│──▶│ Resampler  │──▶│ Chunker │──▶│ Opus Encoder │          │
//! │  │  (PCM bytes) │   │ (→ 48kHz)  │   │ (10ms)  │   └──────┬───────┘          │
//! │  └──────────────┘   └────────────┘   └─────────┘          │                  │
//! │                                                           ▼                  │
//! │                      ┌──────────────────────────────────────────────────┐    │
//! │                      │ AudioSource fan-out: one queue per consumer      │    │
//! │                      └───────┬──────────────────┬───────────────┬───────┘    │
//! │                              ▼                  ▼               ▼            │
//! │                        local sink        framing encode    framing encode    │
//! └──────────────────────────────────────────────────┼───────────────┼───────────┘
//!                                                    │ transport     │
//!                                                    ▼               ▼
//! ┌──────────────────────────────── PLAYING PEER ───────────────────────────────┐
//! │  framing decode ─▶ Remote AudioSource ─▶ Opus Decoder ─▶ AudioSink ─▶ device │
//! │                                                         (5s resync)          │
//! └──────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod registry;
pub mod sink;
pub mod source;
pub mod transport;

pub use audio::chunk::AudioChunk;
pub use context::{LocalContext, SyncClock, SystemClock};
pub use error::{Error, Result};
pub use registry::Registry;
pub use sink::{AudioSink, RenderBackend};
pub use source::{AudioSource, ConsumerHandle, SourceDescriptor, SourceKind, SourcePatch};

/// Stream constants
pub mod constants {
    /// Fixed working rate of the Opus transcoder
    pub const OPUS_ENCODER_RATE: u32 = 48000;

    /// Chunks emitted per second
    pub const OPUS_CHUNKS_PER_SECOND: u32 = 100;

    /// Duration of one chunk in milliseconds
    pub const OPUS_CHUNK_DURATION_MS: u64 = 1000 / OPUS_CHUNKS_PER_SECOND as u64;

    /// Samples per channel in one chunk
    pub const OPUS_CHUNK_SAMPLES: usize = (OPUS_ENCODER_RATE / OPUS_CHUNKS_PER_SECOND) as usize;

    /// Producers hand over s16le PCM
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 128_000;

    /// Default latency budget announced by a source
    pub const DEFAULT_SOURCE_LATENCY_MS: u32 = 500;

    /// Extra latency every sink keeps on top of the source budget
    pub const FORCED_STREAM_LATENCY_MS: f64 = 200.0;

    /// Period of the playback drift correction
    pub const RESYNC_INTERVAL_MS: u64 = 5000;

    /// Skew above which the renderer snaps its position (audible glitch)
    pub const MIN_SKEW_TO_RESYNC_MS: f64 = 10.0;

    /// Per-consumer queue capacity in chunks (2s of audio)
    pub const DEFAULT_CONSUMER_QUEUE_LEN: usize = 200;

    /// Chunker -> encoder queue capacity in chunks
    pub const DEFAULT_PIPELINE_QUEUE_LEN: usize = 16;

    /// Largest Opus packet we expect
    pub const MAX_OPUS_PACKET: usize = 4000;
}
