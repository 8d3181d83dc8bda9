//! Audio subsystem: chunking, framing, resampling and device I/O

pub mod capture;
pub mod chunk;
pub mod chunker;
pub mod device;
pub mod framing;
pub mod playback;
pub mod resample;

pub use capture::DeviceCapture;
pub use chunk::AudioChunk;
pub use chunker::{Chunker, ChunkerExit, ChunkerStats};
pub use device::{list_devices, DeviceInfo};
pub use framing::{decode_frame, encode_frame};
pub use playback::{CpalRenderer, PlayoutBuffer};
pub use resample::{spawn_resample_stage, PcmResampler};
