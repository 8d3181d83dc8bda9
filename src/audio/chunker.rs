//! Wall-clock driven PCM chunker
//!
//! Slices a continuous byte stream into fixed-size chunks on an independent
//! timer. Each chunk carries the real-time slot it belongs to, so a timer that
//! fires late produces a burst of back-to-back chunks instead of a permanent
//! drift.
//!
//! When upstream has less than a chunk buffered the tick stops without
//! advancing, and the same slot is retried on the next tick. When downstream
//! is full the timer is effectively halted until it drains (the send is
//! awaited), after which the missed slots are caught up in one burst.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{Instant, MissedTickBehavior};

use crate::audio::chunk::AudioChunk;

/// Why the chunker stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkerExit {
    /// Every upstream sender is gone and less than a chunk remains
    UpstreamEnded,
    /// Nobody reads the chunks anymore
    DownstreamClosed,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkerStats {
    pub chunks_emitted: u64,
    /// Ticks that ended early because upstream had too few bytes
    pub starved_ticks: u64,
    /// Chunks that had to wait for downstream room
    pub stalled_sends: u64,
}

pub struct Chunker {
    upstream: mpsc::Receiver<Bytes>,
    pending: BytesMut,
    upstream_closed: bool,
    interval: Duration,
    chunk_bytes: usize,
    created_at: Instant,
    last_emit: Duration,
    stats: ChunkerStats,
}

impl Chunker {
    /// `chunk_bytes` worth of PCM is emitted every `interval`
    pub fn new(upstream: mpsc::Receiver<Bytes>, interval: Duration, chunk_bytes: usize) -> Self {
        assert!(!interval.is_zero(), "chunk interval must be non-zero");
        assert!(chunk_bytes > 0, "chunk size must be non-zero");
        Self {
            upstream,
            pending: BytesMut::with_capacity(chunk_bytes * 4),
            upstream_closed: false,
            interval,
            chunk_bytes,
            created_at: Instant::now(),
            last_emit: Duration::ZERO,
            stats: ChunkerStats::default(),
        }
    }

    pub fn stats(&self) -> &ChunkerStats {
        &self.stats
    }

    /// Bytes received from upstream but not emitted yet
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn is_finished(&self) -> bool {
        self.upstream_closed && self.pending.len() < self.chunk_bytes
    }

    fn fill(&mut self) {
        loop {
            match self.upstream.try_recv() {
                Ok(bytes) => self.pending.extend_from_slice(&bytes),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.upstream_closed = true;
                    break;
                }
            }
        }
    }

    /// Run one timer tick at `elapsed` since creation and return what is due
    pub fn tick(&mut self, elapsed: Duration) -> Vec<AudioChunk> {
        self.fill();

        let interval = self.interval.as_nanos();
        let due = elapsed.saturating_sub(self.last_emit).as_nanos() / interval;
        let mut emitted = Vec::new();

        for _ in 0..due {
            let slot = (self.last_emit.as_nanos() / interval + 1) as u32;
            if self.pending.len() < self.chunk_bytes {
                self.stats.starved_ticks += 1;
                break;
            }
            let payload = self.pending.split_to(self.chunk_bytes).freeze();
            emitted.push(AudioChunk::new(slot, payload));
            self.last_emit = self.interval * slot;
            self.stats.chunks_emitted += 1;
        }

        emitted
    }

    /// Drive the chunker from a timer until upstream ends or downstream closes
    pub async fn run(mut self, downstream: mpsc::Sender<AudioChunk>) -> (ChunkerExit, ChunkerStats) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.last_emit = self.created_at.elapsed();

        loop {
            timer.tick().await;
            let chunks = self.tick(self.created_at.elapsed());

            for chunk in chunks {
                if downstream.capacity() == 0 {
                    self.stats.stalled_sends += 1;
                    tracing::debug!(index = chunk.index, "downstream full, chunk emission paused");
                }
                if downstream.send(chunk).await.is_err() {
                    return (ChunkerExit::DownstreamClosed, self.stats);
                }
            }

            if self.is_finished() {
                if !self.pending.is_empty() {
                    tracing::debug!(bytes = self.pending.len(), "dropping partial trailing chunk");
                }
                return (ChunkerExit::UpstreamEnded, self.stats);
            }
        }
    }
}
