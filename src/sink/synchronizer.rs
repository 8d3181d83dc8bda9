//! Sink playing one source in step with the synchronized clock
//!
//! Once linked, the sink waits for the peer's first clock handshake, opens
//! its render backend and decodes the source's chunks into it. Every resync
//! interval it recomputes which stream position should be audible right now
//! and hands the difference to the backend's hardware clock over as the
//! stream offset.
//!
//! ```text
//! position = now + output_latency - (source_latency + FORCED_STREAM_LATENCY_MS) - started_at
//! offset   = position - output_clock
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::audio::chunk::bytes_to_f32;
use crate::codec::spawn_decode_stage;
use crate::config::{AppConfig, SinkSettings};
use crate::constants::{FORCED_STREAM_LATENCY_MS, OPUS_ENCODER_RATE};
use crate::context::{LocalContext, TimeSyncReady};
use crate::error::SinkError;
use crate::events::{EventBus, SinkEvent};
use crate::sink::descriptor::{SinkDescriptor, SinkPatch};
use crate::sink::RenderBackend;
use crate::source::{AudioSource, ConsumerHandle, UpdateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Idle,
    /// Linked, waiting for the clock handshake
    Syncing,
    Playing,
}

#[derive(Clone)]
pub struct AudioSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    ctx: Arc<LocalContext>,
    uuid: Uuid,
    settings: SinkSettings,
    queue_len: usize,
    info: Mutex<SinkDescriptor>,
    backend: Mutex<Box<dyn RenderBackend>>,
    link: Mutex<Option<Link>>,
    generations: AtomicU64,
    events: EventBus<SinkEvent>,
}

struct Link {
    generation: u64,
    source: Uuid,
    playing: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl AudioSink {
    pub fn new(
        ctx: Arc<LocalContext>,
        name: impl Into<String>,
        backend: Box<dyn RenderBackend>,
        config: &AppConfig,
    ) -> Self {
        let descriptor = SinkDescriptor {
            uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
            kind: backend.name().to_string(),
            name: name.into(),
            peer_uuid: ctx.peer_uuid,
            channels: config.opus.channels,
            volume: config.sink.volume,
            latency_ms: 0.0,
            piped_from: None,
            available: true,
        };

        Self {
            inner: Arc::new(SinkInner {
                ctx,
                uuid: descriptor.uuid,
                settings: config.sink.clone(),
                queue_len: config.stream.pipeline_queue_len,
                info: Mutex::new(descriptor),
                backend: Mutex::new(backend),
                link: Mutex::new(None),
                generations: AtomicU64::new(0),
                events: EventBus::new(),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn to_descriptor(&self) -> SinkDescriptor {
        self.inner.info.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SinkState {
        match &*self.inner.link.lock() {
            None => SinkState::Idle,
            Some(link) if link.playing => SinkState::Playing,
            Some(_) => SinkState::Syncing,
        }
    }

    pub fn linked_source(&self) -> Option<Uuid> {
        self.inner.link.lock().as_ref().map(|link| link.source)
    }

    /// Start playing `source`
    ///
    /// Returns once the sink is attached; syncing and playback continue in
    /// the background. `time_sync` is the owning peer's handshake readiness.
    pub async fn link(&self, source: &AudioSource, time_sync: TimeSyncReady) -> Result<(), SinkError> {
        if let Some(linked) = self.linked_source() {
            return Err(SinkError::AlreadyLinked(linked));
        }
        self.inner
            .settings
            .validate()
            .map_err(|e| SinkError::Configuration(e.to_string()))?;
        if self.inner.queue_len == 0 {
            return Err(SinkError::Configuration("decode queue length must be > 0".into()));
        }

        let handle = source.start().await?;
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut link = self.inner.link.lock();
            if let Some(existing) = link.as_ref() {
                return Err(SinkError::AlreadyLinked(existing.source));
            }
            *link = Some(Link {
                generation,
                source: source.uuid(),
                playing: false,
                tasks: Vec::new(),
            });
        }

        tracing::info!(sink = %self.inner.uuid, source = %source.uuid(), "Linking sink");
        self.inner.set_piped_from(Some(source.uuid()));
        self.inner.events.emit(SinkEvent::Linked {
            sink: self.inner.uuid,
            source: source.uuid(),
        });

        let task = tokio::spawn(run_link(
            Arc::downgrade(&self.inner),
            generation,
            handle,
            source.clone(),
            time_sync,
        ));
        self.inner.add_task(generation, task);
        Ok(())
    }

    pub fn set_volume(&self, volume: f32) {
        self.update_info(&SinkPatch {
            volume: Some(volume),
            ..Default::default()
        });
    }

    pub fn volume(&self) -> f32 {
        self.inner.info.lock().volume
    }

    /// Same reconciliation rules as sources: value equality, one event per
    /// change, patches from another incarnation dropped
    pub fn update_info(&self, patch: &SinkPatch) -> UpdateOutcome {
        let changed = {
            let mut info = self.inner.info.lock();
            if let Some(instance_uuid) = patch.instance_uuid {
                if instance_uuid != info.instance_uuid {
                    tracing::warn!(sink = %self.inner.uuid, "Ignoring update for another instance of this sink");
                    return UpdateOutcome::Stale;
                }
            }
            if !info.apply(patch) {
                return UpdateOutcome::Unchanged;
            }
            info.clone()
        };

        // gain stage only, playback keeps going
        self.inner.backend.lock().set_gain(changed.volume);
        self.inner.events.emit(SinkEvent::Updated(changed));
        UpdateOutcome::Changed
    }

    /// Detach from the source and release the device
    ///
    /// Safe before any link, mid-stream and after a previous stop.
    pub fn stop(&self) {
        let link = self.inner.link.lock().take();
        self.inner.release(link);
    }
}

impl std::fmt::Debug for AudioSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSink")
            .field("uuid", &self.inner.uuid)
            .field("state", &self.state())
            .finish()
    }
}

impl SinkInner {
    fn add_task(&self, generation: u64, task: JoinHandle<()>) {
        match &mut *self.link.lock() {
            Some(link) if link.generation == generation => link.tasks.push(task),
            // unlinked already
            _ => task.abort(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        matches!(&*self.link.lock(), Some(link) if link.generation == generation)
    }

    fn set_playing(&self, generation: u64) {
        if let Some(link) = self.link.lock().as_mut().filter(|l| l.generation == generation) {
            link.playing = true;
        }
    }

    fn set_piped_from(&self, source: Option<Uuid>) {
        let changed = {
            let mut info = self.info.lock();
            if info.piped_from == source {
                return;
            }
            info.piped_from = source;
            info.clone()
        };
        self.events.emit(SinkEvent::Updated(changed));
    }

    /// Drop link `generation` if it is still the current one
    fn unlink(&self, generation: u64, reason: &str) {
        let link = {
            let mut link = self.link.lock();
            if !matches!(&*link, Some(current) if current.generation == generation) {
                return;
            }
            link.take()
        };
        tracing::info!(sink = %self.uuid, reason, "Sink unlinked");
        self.release(link);
    }

    fn release(&self, link: Option<Link>) {
        self.backend.lock().disconnect();
        let Some(link) = link else {
            return;
        };
        self.set_piped_from(None);
        self.events.emit(SinkEvent::Unlinked {
            sink: self.uuid,
            source: link.source,
        });
        // aborts the playback tasks, which detaches the consumer
        drop(link);
    }

    /// Open the backend for `channels` and record its latency
    fn open_backend(&self, channels: u16) -> Result<(), SinkError> {
        let (latency_ms, volume) = {
            let mut backend = self.backend.lock();
            backend.open(channels, OPUS_ENCODER_RATE)?;
            let volume = self.info.lock().volume;
            backend.set_gain(volume);
            (backend.output_latency_ms(), volume)
        };

        let changed = {
            let mut info = self.info.lock();
            if info.latency_ms == latency_ms && info.channels == channels {
                None
            } else {
                info.latency_ms = latency_ms;
                info.channels = channels;
                Some(info.clone())
            }
        };
        if let Some(descriptor) = changed {
            self.events.emit(SinkEvent::Updated(descriptor));
        }
        tracing::debug!(sink = %self.uuid, latency_ms, volume, "render backend open");
        Ok(())
    }

    fn push(&self, index: u32, samples: &[f32]) {
        if let Err(e) = self.backend.lock().push_buffer(index, samples) {
            tracing::warn!(sink = %self.uuid, index, "Failed to push buffer: {}", e);
        }
    }

    /// Recompute and push the stream offset
    fn resync(&self, source: &AudioSource, last_index: Option<u32>) {
        let Some(started_at) = source.started_at() else {
            tracing::debug!(sink = %self.uuid, "stream start unknown, skipping resync");
            return;
        };

        let now = self.ctx.now_ms();
        let output_latency = self.info.lock().latency_ms;
        let target_delay = source.latency_ms() as f64 + FORCED_STREAM_LATENCY_MS;
        let position = now + output_latency - target_delay - started_at;

        let delta_ms = {
            let mut backend = self.backend.lock();
            let delta = position - backend.output_clock_ms();
            backend.set_stream_offset(delta);
            delta
        };

        // how far ahead of its play time the newest chunk arrived
        let lead_ms = last_index.map_or(0.0, |index| {
            let stream_time = index as f64 * source.chunk_duration_ms() as f64 + started_at;
            stream_time - (now - target_delay)
        });

        tracing::debug!(sink = %self.uuid, delta_ms, lead_ms, ?last_index, "resynced playback");
        if lead_ms < 0.0 {
            tracing::warn!(sink = %self.uuid, lead_ms, "Chunks arrive after their play time");
        }
        self.events.emit(SinkEvent::Resynced {
            sink: self.uuid,
            delta_ms,
            lead_ms,
            last_index: last_index.unwrap_or(0),
        });
    }
}

/// Background half of a link, ends with the source or on unlink
async fn run_link(
    sink: Weak<SinkInner>,
    generation: u64,
    mut handle: ConsumerHandle,
    source: AudioSource,
    mut time_sync: TimeSyncReady,
) {
    let Some((timeout, resync_every, queue_len)) = sink
        .upgrade()
        .map(|s| (s.settings.time_sync_timeout(), s.settings.resync_interval(), s.queue_len))
    else {
        return;
    };

    let synced = tokio::time::timeout(timeout, time_sync.wait())
        .await
        .unwrap_or(false);
    let Some(inner) = sink.upgrade() else {
        return;
    };
    if !synced {
        tracing::warn!(sink = %inner.uuid, "{}", SinkError::TimeSyncUnavailable);
        inner.unlink(generation, "time sync unavailable");
        return;
    }
    if !inner.is_current(generation) {
        return;
    }

    let channels = source.channels();
    if let Err(e) = inner.open_backend(channels) {
        tracing::error!(sink = %inner.uuid, "Failed to open render backend: {}", e);
        inner.unlink(generation, "render backend unavailable");
        return;
    }
    if !inner.is_current(generation) {
        // stopped while opening
        inner.backend.lock().disconnect();
        return;
    }

    let (encoded_tx, encoded_rx) = mpsc::channel(queue_len);
    let mut decoded = match spawn_decode_stage(OPUS_ENCODER_RATE, channels, encoded_rx, queue_len).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(sink = %inner.uuid, "{}", SinkError::from(e));
            inner.unlink(generation, "decoder unavailable");
            return;
        }
    };

    inner.add_task(
        generation,
        tokio::spawn(async move {
            while let Some(chunk) = handle.recv().await {
                if encoded_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        }),
    );
    inner.set_playing(generation);
    drop(inner);

    let mut resync = tokio::time::interval(resync_every);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_index = None;

    loop {
        tokio::select! {
            pcm = decoded.recv() => {
                let Some(chunk) = pcm else { break };
                let Some(inner) = sink.upgrade() else { return };
                inner.push(chunk.index, &bytes_to_f32(&chunk.payload));
                last_index = Some(chunk.index);
            }
            _ = resync.tick() => {
                let Some(inner) = sink.upgrade() else { return };
                inner.resync(&source, last_index);
            }
        }
    }

    if let Some(inner) = sink.upgrade() {
        inner.unlink(generation, "source ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chunk::i16_to_pcm_bytes;
    use crate::context::ManualClock;
    use crate::sink::MemoryRenderer;
    use crate::source::{PcmFeed, SourceKind};
    use bytes::Bytes;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        ctx: Arc<LocalContext>,
        config: AppConfig,
    }

    fn fixture(resync_interval_ms: u64) -> Fixture {
        let clock = Arc::new(ManualClock::new(10_000.0));
        let ctx = LocalContext::new(Uuid::new_v4(), "peer", clock.clone());
        let mut config = AppConfig::default();
        config.sink.resync_interval_ms = resync_interval_ms;
        Fixture { clock, ctx, config }
    }

    fn feed_source(f: &Fixture) -> (AudioSource, PcmFeed) {
        let feed = PcmFeed::new();
        let source = AudioSource::local(
            f.ctx.clone(),
            "feed",
            SourceKind::Feed(feed.clone()),
            48_000,
            2,
            &f.config,
        );
        (source, feed)
    }

    fn sink_with(f: &Fixture, renderer: &MemoryRenderer) -> AudioSink {
        AudioSink::new(f.ctx.clone(), "speakers", Box::new(renderer.clone()), &f.config)
    }

    fn pcm(chunks: usize) -> Bytes {
        i16_to_pcm_bytes(&vec![1000i16; chunks * 960])
    }

    async fn next_resync(events: &mut broadcast::Receiver<SinkEvent>) -> (f64, f64, u32) {
        loop {
            if let SinkEvent::Resynced {
                delta_ms,
                lead_ms,
                last_index,
                ..
            } = events.recv().await.unwrap()
            {
                return (delta_ms, lead_ms, last_index);
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_offset_tracks_hardware_clock() {
        let f = fixture(60_000);
        let (source, feed) = feed_source(&f);
        let renderer = MemoryRenderer::new(20.0);
        let sink = sink_with(&f, &renderer);
        let mut events = sink.subscribe();

        sink.link(&source, TimeSyncReady::ready()).await.unwrap();
        assert_eq!(source.started_at(), Some(10_000.0));

        // first resync right after opening: 10000 + 20 - (500 + 200) - 10000 - 0
        let (delta, lead, _) = next_resync(&mut events).await;
        assert_eq!(delta, -680.0);
        assert_eq!(lead, 0.0);
        assert_eq!(renderer.format(), Some((2, 48_000)));
        assert_eq!(sink.to_descriptor().latency_ms, 20.0);

        feed.push(pcm(20)).await.unwrap();
        wait_until(|| renderer.pushed_indices().len() == 20).await;
        let pushed = renderer.pushed_indices();
        assert!(pushed.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(renderer.samples_pushed(), 20 * 960);
        assert_eq!(sink.state(), SinkState::Playing);

        // both clocks moved 5s: same offset
        f.clock.set(15_000.0);
        renderer.set_clock_ms(5_000.0);
        let last = *pushed.last().unwrap();
        sink.inner.resync(&source, Some(last));

        let (delta, lead, last_index) = next_resync(&mut events).await;
        assert_eq!(delta, -680.0);
        assert_eq!(last_index, last);
        assert_eq!(lead, last as f64 * 10.0 + 10_000.0 - (15_000.0 - 700.0));

        // hardware clock drifted 30ms behind
        renderer.set_clock_ms(4_970.0);
        sink.inner.resync(&source, Some(last));
        let (delta, _, _) = next_resync(&mut events).await;
        assert_eq!(delta, -650.0);
        assert_eq!(renderer.offsets(), vec![-680.0, -680.0, -650.0]);
    }

    #[tokio::test]
    async fn test_resync_runs_periodically() {
        let f = fixture(30);
        let (source, _feed) = feed_source(&f);
        let renderer = MemoryRenderer::default();
        let sink = sink_with(&f, &renderer);

        sink.link(&source, TimeSyncReady::ready()).await.unwrap();
        wait_until(|| renderer.offsets().len() >= 3).await;
        assert!(renderer.offsets().iter().all(|offset| *offset == -700.0));
    }

    #[tokio::test]
    async fn test_waits_for_time_sync() {
        let f = fixture(60_000);
        let (source, _feed) = feed_source(&f);
        let renderer = MemoryRenderer::default();
        let sink = sink_with(&f, &renderer);

        let (synced, ready) = TimeSyncReady::channel();
        sink.link(&source, ready).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.state(), SinkState::Syncing);
        assert!(!renderer.is_open());
        assert!(renderer.offsets().is_empty());

        synced.send(true).unwrap();
        wait_until(|| renderer.is_open()).await;
        wait_until(|| !renderer.offsets().is_empty()).await;
        assert_eq!(sink.state(), SinkState::Playing);
    }

    #[tokio::test]
    async fn test_time_sync_never_ready_leaves_sink_idle() {
        let f = fixture(60_000);
        let (source, _feed) = feed_source(&f);
        let sink = sink_with(&f, &MemoryRenderer::default());

        let (synced, ready) = TimeSyncReady::channel();
        sink.link(&source, ready).await.unwrap();
        drop(synced);

        wait_until(|| sink.state() == SinkState::Idle).await;
        wait_until(|| source.consumer_count() == 0).await;
    }

    #[tokio::test]
    async fn test_volume_changes_gain_without_relink() {
        let f = fixture(60_000);
        let (source, _feed) = feed_source(&f);
        let renderer = MemoryRenderer::default();
        let sink = sink_with(&f, &renderer);

        sink.link(&source, TimeSyncReady::ready()).await.unwrap();
        wait_until(|| renderer.is_open()).await;
        let generation = source.pipeline_generation();

        sink.set_volume(0.3);
        assert_eq!(renderer.gain(), 0.3);
        assert_eq!(sink.volume(), 0.3);
        assert_eq!(sink.linked_source(), Some(source.uuid()));
        assert_eq!(source.pipeline_generation(), generation);
        assert_eq!(renderer.disconnects(), 0);

        assert_eq!(
            sink.update_info(&SinkPatch { volume: Some(0.3), ..Default::default() }),
            UpdateOutcome::Unchanged
        );
        assert_eq!(
            sink.update_info(&SinkPatch {
                instance_uuid: Some(Uuid::new_v4()),
                volume: Some(0.9),
                ..Default::default()
            }),
            UpdateOutcome::Stale
        );
        assert_eq!(renderer.gain(), 0.3);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let f = fixture(60_000);
        let (source, _feed) = feed_source(&f);
        let renderer = MemoryRenderer::default();
        let sink = sink_with(&f, &renderer);
        let mut events = sink.subscribe();

        sink.stop();
        sink.link(&source, TimeSyncReady::ready()).await.unwrap();
        wait_until(|| renderer.is_open()).await;
        sink.stop();
        sink.stop();

        assert_eq!(sink.state(), SinkState::Idle);
        assert!(!renderer.is_open());
        assert_eq!(sink.to_descriptor().piped_from, None);

        let unlinked = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SinkEvent::Unlinked { .. }))
            .count();
        assert_eq!(unlinked, 1);

        wait_until(|| source.consumer_count() == 0).await;
    }

    #[tokio::test]
    async fn test_unusable_settings_refuse_link() {
        let f = fixture(0);
        let (source, _feed) = feed_source(&f);
        let renderer = MemoryRenderer::default();
        let sink = sink_with(&f, &renderer);
        assert!(matches!(
            sink.link(&source, TimeSyncReady::ready()).await,
            Err(SinkError::Configuration(_))
        ));

        let mut f = fixture(60_000);
        f.config.stream.pipeline_queue_len = 0;
        let sink = sink_with(&f, &renderer);
        assert!(matches!(
            sink.link(&source, TimeSyncReady::ready()).await,
            Err(SinkError::Configuration(_))
        ));

        // refused before the source was touched
        assert_eq!(sink.state(), SinkState::Idle);
        assert_eq!(source.pipeline_generation(), None);
        assert!(!renderer.is_open());
    }

    #[tokio::test]
    async fn test_source_loss_leaves_sink_relinkable() {
        let f = fixture(60_000);
        let (source, feed) = feed_source(&f);
        let renderer = MemoryRenderer::default();
        let sink = sink_with(&f, &renderer);

        sink.link(&source, TimeSyncReady::ready()).await.unwrap();
        assert!(matches!(
            sink.link(&source, TimeSyncReady::ready()).await,
            Err(SinkError::AlreadyLinked(uuid)) if uuid == source.uuid()
        ));

        feed.push(pcm(3)).await.unwrap();
        feed.close();
        wait_until(|| sink.state() == SinkState::Idle).await;
        assert_eq!(renderer.pushed_indices().len(), 3);

        sink.link(&source, TimeSyncReady::ready()).await.unwrap();
        assert_eq!(sink.linked_source(), Some(source.uuid()));
        wait_until(|| renderer.is_open()).await;
    }
}
