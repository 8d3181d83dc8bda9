//! Error types for the audio streaming core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Resampler error: {0}")]
    Resampler(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Wire frame errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame too short: {0} bytes, need at least 4")]
    Truncated(usize),
}

/// Source lifecycle errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// Unsupported device, codec or stream parameters. Not retried.
    #[error("Invalid source configuration: {0}")]
    Configuration(String),

    /// The upstream producer went away (process exit, device unplug).
    #[error("Producer ended: {0}")]
    ProducerEnded(String),

    #[error("Source was stopped")]
    Stopped,

    #[error("Backend failed to start: {0}")]
    Backend(String),
}

/// Sink lifecycle errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink is already linked to source {0}")]
    AlreadyLinked(uuid::Uuid),

    #[error("Render backend error: {0}")]
    Render(String),

    #[error("Invalid sink configuration: {0}")]
    Configuration(String),

    #[error("Time sync handshake never completed")]
    TimeSyncUnavailable,

    #[error("Source unavailable: {0}")]
    Source(#[from] SourceError),

    #[error("Decoder unavailable: {0}")]
    Codec(#[from] CodecError),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
