//! One production pipeline per source, fanned out to any number of consumers
//!
//! ```text
//! backend ─▶ [resample] ─▶ Chunker ─▶ encode stage ─▶ pump ─▶ broadcast ─┬─▶ ConsumerHandle
//!                                                                         ├─▶ ConsumerHandle
//! remote frames ─▶ framing decode ──────────────────▶ pump ──────────────┘
//! ```
//!
//! The chunker to encoder hop is a bounded channel whose send is awaited, so
//! a stalled encoder halts chunk emission. Past the pump every consumer reads
//! from its own bounded window; a consumer that falls behind loses its oldest
//! chunks and nobody else notices.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::chunk::AudioChunk;
use crate::audio::chunker::Chunker;
use crate::audio::framing::decode_frame;
use crate::audio::resample::{spawn_resample_stage, PcmResampler};
use crate::codec::spawn_encode_stage;
use crate::config::{AppConfig, OpusConfig, StreamSettings};
use crate::context::LocalContext;
use crate::error::SourceError;
use crate::events::{EventBus, SourceEvent, StopReason};
use crate::source::backend::{
    FrameChannel, NoConsumerPolicy, Production, SourceKind, Teardown, Upstream, UPSTREAM_QUEUE_LEN,
};
use crate::source::descriptor::{SourceDescriptor, SourcePatch, UpdateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    /// Backend is being opened, consumers can already attach
    Starting,
    Running,
    /// Closed for good, `start` is refused
    Stopped,
}

/// A logical audio source
///
/// Cloning is cheap and every clone refers to the same source.
#[derive(Clone)]
pub struct AudioSource {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    ctx: Arc<LocalContext>,
    uuid: Uuid,
    local: bool,
    kind: SourceKind,
    stream: StreamSettings,
    opus: OpusConfig,
    /// Lock order: `state` before `info`
    info: Mutex<SourceDescriptor>,
    state: Mutex<State>,
    policy: Mutex<NoConsumerPolicy>,
    generations: AtomicU64,
    events: EventBus<SourceEvent>,
}

enum State {
    Idle,
    Active(Pipeline),
    Closed,
}

struct Pipeline {
    generation: u64,
    running: bool,
    chunks: broadcast::Sender<AudioChunk>,
    /// Set when consumers must stop reading right away
    closed: Arc<AtomicBool>,
    consumers: usize,
    tasks: Vec<JoinHandle<()>>,
    teardown: Option<Teardown>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(teardown) = self.teardown.take() {
            teardown.run();
        }
    }
}

impl AudioSource {
    /// Source owned by this peer
    pub fn local(
        ctx: Arc<LocalContext>,
        name: impl Into<String>,
        kind: SourceKind,
        rate: u32,
        channels: u16,
        config: &AppConfig,
    ) -> Self {
        let descriptor = SourceDescriptor {
            uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
            kind: kind.source_type(),
            name: name.into(),
            channels,
            rate,
            latency_ms: config.stream.source_latency_ms,
            started_at: None,
            peer_uuid: ctx.peer_uuid,
            volume: None,
        };
        Self::from_descriptor(ctx, descriptor, kind, config)
    }

    /// Mirror of a source announced by another peer
    pub fn remote(
        ctx: Arc<LocalContext>,
        descriptor: SourceDescriptor,
        channel: Arc<dyn FrameChannel>,
        config: &AppConfig,
    ) -> Self {
        Self::from_descriptor(ctx, descriptor, SourceKind::Remote(channel), config)
    }

    /// Ownership follows the descriptor's peer. A locally owned source gets a
    /// fresh instance uuid, since this process is a new incarnation.
    pub fn from_descriptor(
        ctx: Arc<LocalContext>,
        mut descriptor: SourceDescriptor,
        kind: SourceKind,
        config: &AppConfig,
    ) -> Self {
        let local = descriptor.peer_uuid == ctx.peer_uuid;
        if local {
            descriptor.instance_uuid = Uuid::new_v4();
        }
        descriptor.kind = kind.source_type();
        tracing::debug!(source = %descriptor.uuid, local, kind = ?descriptor.kind, "Created audio source");

        Self {
            inner: Arc::new(SourceInner {
                ctx,
                uuid: descriptor.uuid,
                local,
                policy: Mutex::new(kind.default_policy()),
                kind,
                stream: config.stream.clone(),
                opus: config.opus.clone(),
                info: Mutex::new(descriptor),
                state: Mutex::new(State::Idle),
                generations: AtomicU64::new(0),
                events: EventBus::new(),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn instance_uuid(&self) -> Uuid {
        self.inner.info.lock().instance_uuid
    }

    pub fn is_local(&self) -> bool {
        self.inner.local
    }

    pub fn started_at(&self) -> Option<f64> {
        self.inner.info.lock().started_at
    }

    pub fn latency_ms(&self) -> u32 {
        self.inner.info.lock().latency_ms
    }

    pub fn channels(&self) -> u16 {
        self.inner.info.lock().channels
    }

    pub fn chunk_duration_ms(&self) -> u64 {
        self.inner.stream.chunk_duration_ms
    }

    pub fn to_descriptor(&self) -> SourceDescriptor {
        self.inner.info.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SourceState {
        match &*self.inner.state.lock() {
            State::Idle => SourceState::Idle,
            State::Active(pipeline) if pipeline.running => SourceState::Running,
            State::Active(_) => SourceState::Starting,
            State::Closed => SourceState::Stopped,
        }
    }

    pub fn consumer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Active(pipeline) => pipeline.consumers,
            _ => 0,
        }
    }

    /// Identifies the current production pipeline, `None` when idle
    pub fn pipeline_generation(&self) -> Option<u64> {
        match &*self.inner.state.lock() {
            State::Active(pipeline) => Some(pipeline.generation),
            _ => None,
        }
    }

    pub fn set_no_consumer_policy(&self, policy: NoConsumerPolicy) {
        *self.inner.policy.lock() = policy;
    }

    /// Start production if needed and return a new consumer
    ///
    /// Only the first call opens the backend. Calls made while the pipeline
    /// is starting or running only add a consumer.
    pub async fn start(&self) -> Result<ConsumerHandle, SourceError> {
        let (generation, handle) = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Closed => return Err(SourceError::Stopped),
                State::Active(pipeline) => return Ok(self.inner.consumer(pipeline)),
                State::Idle => {}
            }
            self.inner
                .stream
                .validate(&self.inner.opus)
                .map_err(|e| SourceError::Configuration(e.to_string()))?;
            let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
            let (chunks, _) = broadcast::channel(self.inner.stream.consumer_queue_len);
            let mut pipeline = Pipeline {
                generation,
                running: false,
                chunks,
                closed: Arc::new(AtomicBool::new(false)),
                consumers: 0,
                tasks: Vec::new(),
                teardown: None,
            };
            let handle = self.inner.consumer(&mut pipeline);
            *state = State::Active(pipeline);
            (generation, handle)
        };

        tracing::info!(source = %self.inner.uuid, generation, "Starting audio source");
        if self.inner.local {
            self.inner.stamp_started_at();
        }

        let descriptor = self.to_descriptor();
        let wired = match self.inner.kind.open(&descriptor).await {
            Ok(production) => self.inner.wire(generation, production).await,
            Err(e) => Err(e),
        };

        match wired {
            Ok(()) => {
                self.inner.events.emit(SourceEvent::Started { uuid: self.inner.uuid });
                Ok(handle)
            }
            Err(e) => {
                tracing::error!(source = %self.inner.uuid, "Failed to start audio source: {}", e);
                self.inner
                    .finish(generation, StopReason::ProducerEnded(e.to_string()), false);
                Err(e)
            }
        }
    }

    /// New consumer on an already started pipeline
    pub fn attach(&self) -> Option<ConsumerHandle> {
        match &mut *self.inner.state.lock() {
            State::Active(pipeline) => Some(self.inner.consumer(pipeline)),
            _ => None,
        }
    }

    /// Reconcile a patch against the current descriptor
    ///
    /// All differing fields are applied together with a single `Updated`
    /// event. A patch from another incarnation of a locally owned source is
    /// dropped whole.
    pub fn update_info(&self, patch: &SourcePatch) -> UpdateOutcome {
        self.inner.update_info(patch)
    }

    /// Stop production and close every consumer, the source can be started again
    pub fn stop(&self) {
        if let Some(generation) = self.pipeline_generation() {
            self.inner.finish(generation, StopReason::Requested, true);
        }
    }

    /// Stop and refuse any later start
    pub fn close(&self) {
        self.stop();
        *self.inner.state.lock() = State::Closed;
    }
}

impl std::fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSource")
            .field("uuid", &self.inner.uuid)
            .field("local", &self.inner.local)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl SourceInner {
    fn consumer(self: &Arc<Self>, pipeline: &mut Pipeline) -> ConsumerHandle {
        pipeline.consumers += 1;
        ConsumerHandle {
            source: Arc::downgrade(self),
            source_uuid: self.uuid,
            generation: pipeline.generation,
            rx: pipeline.chunks.subscribe(),
            closed: pipeline.closed.clone(),
            lagged: 0,
            released: false,
        }
    }

    fn stamp_started_at(&self) {
        let now = self.ctx.now_ms();
        let stamped = {
            let mut info = self.info.lock();
            if info.started_at.is_some() {
                None
            } else {
                info.started_at = Some(now);
                Some(info.clone())
            }
        };
        if let Some(descriptor) = stamped {
            tracing::debug!(source = %self.uuid, started_at = now, "stamped stream start");
            self.events.emit(SourceEvent::Updated(descriptor));
        }
    }

    fn update_info(&self, patch: &SourcePatch) -> UpdateOutcome {
        let changed = {
            let mut info = self.info.lock();
            if let Some(instance_uuid) = patch.instance_uuid {
                if self.local && instance_uuid != info.instance_uuid {
                    tracing::warn!(
                        source = %self.uuid,
                        current = %info.instance_uuid,
                        received = %instance_uuid,
                        "Ignoring update for another instance of this source"
                    );
                    return UpdateOutcome::Stale;
                }
            }
            if !info.apply(patch) {
                return UpdateOutcome::Unchanged;
            }
            info.clone()
        };
        self.events.emit(SourceEvent::Updated(changed));
        UpdateOutcome::Changed
    }

    /// Build the stages behind an opened backend and install them
    async fn wire(self: &Arc<Self>, generation: u64, production: Production) -> Result<(), SourceError> {
        let Production {
            rate,
            channels,
            upstream,
            teardown,
        } = production;

        let (encoded_rx, chunker_task) = match upstream {
            Upstream::Pcm(pcm) => match self.pcm_stages(pcm, rate, channels).await {
                Ok((rx, task)) => (PumpInput::Encoded(rx), Some(task)),
                Err(e) => {
                    teardown.run();
                    return Err(e);
                }
            },
            Upstream::Framed(frames) => (PumpInput::Framed(frames), None),
        };

        let mut state = self.state.lock();
        let current = matches!(&*state, State::Active(pipeline) if pipeline.generation == generation);
        if !current {
            // stopped while the backend was opening
            drop(state);
            if let Some(task) = chunker_task {
                task.abort();
            }
            teardown.run();
            return Err(SourceError::Stopped);
        }
        if let State::Active(pipeline) = &mut *state {
            pipeline.tasks.extend(chunker_task);
            pipeline.tasks.push(tokio::spawn(pump(
                Arc::downgrade(self),
                generation,
                encoded_rx,
                pipeline.chunks.clone(),
            )));
            pipeline.teardown = Some(teardown);
            pipeline.running = true;
        }
        drop(state);

        if self.local {
            let patch = SourcePatch {
                rate: Some(rate),
                channels: Some(channels),
                ..Default::default()
            };
            self.update_info(&patch);
        }
        Ok(())
    }

    /// resample (if needed) -> chunker -> encoder
    async fn pcm_stages(
        &self,
        pcm: mpsc::Receiver<bytes::Bytes>,
        rate: u32,
        channels: u16,
    ) -> Result<(mpsc::Receiver<AudioChunk>, JoinHandle<()>), SourceError> {
        let mut opus = self.opus.clone();
        opus.channels = channels;
        opus.validate()
            .map_err(|e| SourceError::Configuration(e.to_string()))?;

        let pcm = if rate != opus.sample_rate {
            let resampler = PcmResampler::new(rate, opus.sample_rate, channels)
                .map_err(|e| SourceError::Configuration(e.to_string()))?;
            tracing::debug!(source = %self.uuid, from = rate, to = opus.sample_rate, "resampling source");
            spawn_resample_stage(pcm, resampler, UPSTREAM_QUEUE_LEN)
        } else {
            pcm
        };

        let chunker = Chunker::new(pcm, self.stream.chunk_duration(), opus.pcm_frame_bytes());
        let (chunk_tx, chunk_rx) = mpsc::channel(self.stream.pipeline_queue_len);
        let encoded = spawn_encode_stage(opus, chunk_rx, self.stream.pipeline_queue_len)
            .await
            .map_err(|e| SourceError::Configuration(e.to_string()))?;

        let uuid = self.uuid;
        let task = tokio::spawn(async move {
            let (exit, stats) = chunker.run(chunk_tx).await;
            tracing::debug!(
                source = %uuid,
                ?exit,
                chunks = stats.chunks_emitted,
                starved = stats.starved_ticks,
                stalled = stats.stalled_sends,
                "chunker finished"
            );
            if stats.stalled_sends > 0 {
                tracing::warn!(
                    source = %uuid,
                    "Encoder fell behind, chunk emission paused {} times",
                    stats.stalled_sends
                );
            }
        });
        Ok((encoded, task))
    }

    /// Tear down pipeline `generation` if it is still the current one
    fn finish(&self, generation: u64, reason: StopReason, close_consumers: bool) -> bool {
        self.finish_if(generation, reason, close_consumers, |_| true)
    }

    fn finish_if(
        &self,
        generation: u64,
        reason: StopReason,
        close_consumers: bool,
        condition: impl Fn(&Pipeline) -> bool,
    ) -> bool {
        let pipeline = {
            let mut state = self.state.lock();
            let current = matches!(
                &*state,
                State::Active(pipeline) if pipeline.generation == generation && condition(pipeline)
            );
            if !current {
                return false;
            }
            match std::mem::replace(&mut *state, State::Idle) {
                State::Active(pipeline) => pipeline,
                other => {
                    *state = other;
                    return false;
                }
            }
        };

        if close_consumers {
            pipeline.closed.store(true, Ordering::Release);
        }
        drop(pipeline);

        match &reason {
            StopReason::ProducerEnded(why) => {
                tracing::warn!(source = %self.uuid, generation, "Audio source producer ended: {}", why)
            }
            _ => tracing::info!(source = %self.uuid, generation, %reason, "Audio source stopped"),
        }
        self.events.emit(SourceEvent::Stopped { uuid: self.uuid, reason });
        true
    }

    fn release_consumer(&self, generation: u64) {
        let emptied = match &mut *self.state.lock() {
            State::Active(pipeline) if pipeline.generation == generation => {
                pipeline.consumers = pipeline.consumers.saturating_sub(1);
                pipeline.consumers == 0
            }
            _ => false,
        };
        if emptied {
            self.no_more_consumers(generation);
        }
    }

    fn no_more_consumers(&self, generation: u64) {
        tracing::debug!(source = %self.uuid, generation, "no more consumers");
        self.events.emit(SourceEvent::NoMoreConsumers { uuid: self.uuid });

        if *self.policy.lock() == NoConsumerPolicy::StopProduction {
            // someone may have attached in between
            self.finish_if(generation, StopReason::Unattended, true, |p| p.consumers == 0);
        }
    }
}

enum PumpInput {
    Encoded(mpsc::Receiver<AudioChunk>),
    Framed(mpsc::Receiver<bytes::Bytes>),
}

/// Moves encoded chunks into the fan-out until production ends
async fn pump(
    source: Weak<SourceInner>,
    generation: u64,
    input: PumpInput,
    chunks: broadcast::Sender<AudioChunk>,
) {
    // a send with no consumer attached is fine, production goes on unattended
    match input {
        PumpInput::Encoded(mut rx) => {
            while let Some(chunk) = rx.recv().await {
                let _ = chunks.send(chunk);
            }
        }
        PumpInput::Framed(mut rx) => {
            while let Some(frame) = rx.recv().await {
                match decode_frame(frame) {
                    Ok(chunk) => {
                        let _ = chunks.send(chunk);
                    }
                    Err(e) => tracing::warn!(generation, "Dropping malformed frame: {}", e),
                }
            }
        }
    }

    if let Some(inner) = source.upgrade() {
        inner.finish(
            generation,
            StopReason::ProducerEnded("upstream closed".into()),
            false,
        );
    }
}

/// A subscriber's own view of a source's chunk sequence
///
/// Dropping the handle detaches it.
pub struct ConsumerHandle {
    source: Weak<SourceInner>,
    source_uuid: Uuid,
    generation: u64,
    rx: broadcast::Receiver<AudioChunk>,
    closed: Arc<AtomicBool>,
    lagged: u64,
    released: bool,
}

impl ConsumerHandle {
    /// Next chunk, `None` once the source stopped or production ended
    ///
    /// Chunks lost to lag are skipped; the sequence stays increasing.
    pub async fn recv(&mut self) -> Option<AudioChunk> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            match self.rx.recv().await {
                Ok(chunk) => return Some(chunk.deep_copy()),
                Err(RecvError::Lagged(skipped)) => {
                    self.lagged += skipped;
                    tracing::warn!(
                        source = %self.source_uuid,
                        skipped,
                        total = self.lagged,
                        "Consumer fell behind, dropped oldest chunks"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn source_uuid(&self) -> Uuid {
        self.source_uuid
    }

    /// Chunks dropped because this consumer was too slow
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(source) = self.source.upgrade() {
            source.release_consumer(self.generation);
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("source", &self.source_uuid)
            .field("generation", &self.generation)
            .field("lagged", &self.lagged)
            .finish()
    }
}
