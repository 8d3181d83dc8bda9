//! Process-wide context handed explicitly to every component
//!
//! The synchronized clock and the local peer identity are external
//! collaborators. They are built once at startup and passed around by `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use uuid::Uuid;

use crate::config::AppConfig;

/// Estimate of the cluster-wide monotonic millisecond clock
pub trait SyncClock: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// Local wall clock corrected by the offset the clock-sync service computed
#[derive(Debug, Default)]
pub struct SystemClock {
    offset_ms: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset between the local clock and the cluster clock
    pub fn set_offset_ms(&self, offset_ms: f64) {
        self.offset_ms.store(offset_ms.to_bits(), Ordering::Relaxed);
    }

    pub fn offset_ms(&self) -> f64 {
        f64::from_bits(self.offset_ms.load(Ordering::Relaxed))
    }
}

impl SyncClock for SystemClock {
    fn now_ms(&self) -> f64 {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        local + self.offset_ms()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms.to_bits()),
        }
    }

    pub fn set(&self, ms: f64) {
        self.now_ms.store(ms.to_bits(), Ordering::Relaxed);
    }

    pub fn advance(&self, ms: f64) {
        self.set(self.now_ms() + ms);
    }
}

impl SyncClock for ManualClock {
    fn now_ms(&self) -> f64 {
        f64::from_bits(self.now_ms.load(Ordering::Relaxed))
    }
}

/// Readiness of a peer connection's first clock handshake
#[derive(Debug, Clone)]
pub struct TimeSyncReady {
    rx: watch::Receiver<bool>,
}

impl TimeSyncReady {
    /// The sender side is flipped to `true` by the peer layer
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Already synchronized, e.g. the local peer
    pub fn ready() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves `true` once synced, `false` if the peer went away first
    pub async fn wait(&mut self) -> bool {
        if self.is_ready() {
            return true;
        }
        self.rx.wait_for(|synced| *synced).await.is_ok()
    }
}

/// Identity and clock of this process
pub struct LocalContext {
    pub peer_uuid: Uuid,
    pub name: String,
    pub clock: Arc<dyn SyncClock>,
}

impl LocalContext {
    pub fn new(peer_uuid: Uuid, name: impl Into<String>, clock: Arc<dyn SyncClock>) -> Arc<Self> {
        Arc::new(Self {
            peer_uuid,
            name: name.into(),
            clock,
        })
    }

    pub fn from_config(config: &AppConfig, clock: Arc<dyn SyncClock>) -> Arc<Self> {
        Self::new(config.peer.uuid, config.peer.name.clone(), clock)
    }

    pub fn now_ms(&self) -> f64 {
        self.clock.now_ms()
    }
}

impl std::fmt::Debug for LocalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalContext")
            .field("peer_uuid", &self.peer_uuid)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
