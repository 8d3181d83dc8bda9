//! Opus transcoding
//!
//! Per-chunk encoder/decoder wrappers plus the channel stages that run them
//! inside a stream pipeline.

pub mod decoder;
pub mod encoder;
pub mod stage;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use stage::{spawn_decode_stage, spawn_encode_stage};
