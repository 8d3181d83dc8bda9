//! Lifecycle notifications for sources and sinks
//!
//! Events are informational. Failures inside a stream stage are turned into
//! a clean teardown plus a `Stopped`/`Unlinked` event rather than an error
//! returned to whoever happens to be awaiting.
//!
//! Delivery is in order to every subscriber that exists when the event is
//! sent. A subscriber that falls more than [`EVENT_QUEUE_LEN`] events behind
//! loses the oldest ones.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::sink::SinkDescriptor;
use crate::source::SourceDescriptor;

/// Buffered events per subscriber
pub const EVENT_QUEUE_LEN: usize = 64;

#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// At least one descriptor field changed
    Updated(SourceDescriptor),
    /// The production pipeline is up
    Started { uuid: Uuid },
    /// The production pipeline is gone and the source is idle again
    Stopped { uuid: Uuid, reason: StopReason },
    /// The last consumer detached
    NoMoreConsumers { uuid: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called
    Requested,
    /// The no-consumer policy cut production
    Unattended,
    /// Process exit, device unplug, closed transport
    ProducerEnded(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Requested => write!(f, "requested"),
            StopReason::Unattended => write!(f, "no consumers left"),
            StopReason::ProducerEnded(why) => write!(f, "producer ended: {}", why),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SinkEvent {
    Updated(SinkDescriptor),
    Linked { sink: Uuid, source: Uuid },
    Unlinked { sink: Uuid, source: Uuid },
    /// A drift correction was pushed to the render backend
    Resynced {
        sink: Uuid,
        /// Offset between stream position and the device clock
        delta_ms: f64,
        /// How far ahead of its play time the last rendered chunk arrived
        lead_ms: f64,
        last_index: u32,
    },
}

/// Sending half shared by an entity and its background tasks
#[derive(Debug)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_QUEUE_LEN);
        Self { tx }
    }

    pub fn emit(&self, event: E) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
