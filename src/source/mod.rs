//! Audio sources
//!
//! A source owns the single production pipeline for one logical stream and
//! hands every subscriber its own [`ConsumerHandle`]. The concrete producer
//! is picked by [`SourceKind`].

pub mod backend;
pub mod descriptor;
pub mod multiplexer;

pub use backend::{FrameChannel, NoConsumerPolicy, PcmFeed, SourceKind};
pub use descriptor::{SourceDescriptor, SourcePatch, SourceType, UpdateOutcome};
pub use multiplexer::{AudioSource, ConsumerHandle, SourceState};
