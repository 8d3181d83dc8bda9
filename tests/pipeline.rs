//! End-to-end: local PCM source -> framing -> remote mirror -> sink

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use synced_audio_streamer::audio::chunk::i16_to_pcm_bytes;
use synced_audio_streamer::audio::framing::{decode_frame, encode_frame};
use synced_audio_streamer::config::AppConfig;
use synced_audio_streamer::context::{SystemClock, TimeSyncReady};
use synced_audio_streamer::error::SourceError;
use synced_audio_streamer::events::{SinkEvent, SourceEvent, StopReason};
use synced_audio_streamer::registry::{Reconciled, Registry};
use synced_audio_streamer::sink::{MemoryRenderer, SinkState};
use synced_audio_streamer::source::{FrameChannel, PcmFeed, SourceKind, SourceType};
use synced_audio_streamer::{AudioSink, AudioSource, LocalContext};

const WAIT: Duration = Duration::from_secs(10);

/// Hands out one pre-made frame receiver
struct Loopback {
    pending: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl Loopback {
    fn new() -> (mpsc::Sender<Bytes>, Arc<Self>) {
        let (tx, rx) = mpsc::channel(1024);
        (tx, Arc::new(Self { pending: Mutex::new(Some(rx)) }))
    }
}

impl FrameChannel for Loopback {
    fn open(&self, _source: Uuid) -> Result<mpsc::Receiver<Bytes>, SourceError> {
        self.pending
            .lock()
            .take()
            .ok_or_else(|| SourceError::Backend("frame channel already open".into()))
    }
}

/// `seconds` of a 441Hz square wave, 44.1kHz stereo s16le
fn square_wave_44k(seconds: f64) -> Bytes {
    let frames = (44_100.0 * seconds) as usize;
    let samples: Vec<i16> = (0..frames)
        .flat_map(|n| {
            let v = if (n / 50) % 2 == 0 { 8_000 } else { -8_000 };
            [v, v]
        })
        .collect();
    i16_to_pcm_bytes(&samples)
}

fn peer(clock: &Arc<SystemClock>, name: &str) -> Arc<LocalContext> {
    LocalContext::new(Uuid::new_v4(), name, clock.clone())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resampled_source_plays_on_remote_sink() {
    let clock = Arc::new(SystemClock::new());
    let config = AppConfig::default();

    // producing peer
    let feed = PcmFeed::new();
    let source = AudioSource::local(
        peer(&clock, "producer"),
        "square",
        SourceKind::Feed(feed.clone()),
        44_100,
        2,
        &config,
    );
    let mut handle = source.start().await.unwrap();
    let descriptor = source.to_descriptor();
    assert!(descriptor.started_at.is_some());

    // playing peer
    let (frames_tx, transport) = Loopback::new();
    let registry = Registry::new(peer(&clock, "player"), config.clone(), transport);
    assert_eq!(registry.apply_source_descriptor(descriptor.clone()), Reconciled::Created);
    let mirror = registry.source(&descriptor.uuid).unwrap();
    assert_eq!(mirror.started_at(), descriptor.started_at);
    assert_eq!(mirror.to_descriptor().kind, SourceType::Remote);

    let renderer = MemoryRenderer::new(20.0);
    let sink = AudioSink::new(registry.context().clone(), "out", Box::new(renderer.clone()), &config);
    let mut sink_events = sink.subscribe();
    sink.link(&mirror, TimeSyncReady::ready()).await.unwrap();

    let forward = tokio::spawn(async move {
        let mut sent = Vec::new();
        while let Some(chunk) = handle.recv().await {
            sent.push(chunk.index);
            if frames_tx.send(encode_frame(&chunk)).await.is_err() {
                break;
            }
        }
        sent
    });

    feed.push(square_wave_44k(0.5)).await.unwrap();
    feed.close();

    let unlinked = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SinkEvent::Unlinked { source, .. }) = sink_events.recv().await {
                break source;
            }
        }
    })
    .await
    .expect("sink never unlinked");
    assert_eq!(unlinked, descriptor.uuid);

    let sent = forward.await.unwrap();
    assert!(sent.len() >= 40, "only {} chunks produced", sent.len());

    let played = renderer.pushed_indices();
    assert_eq!(played, sent);
    assert_eq!(renderer.samples_pushed(), played.len() * 480 * 2);
    assert!(!renderer.offsets().is_empty());
    assert_eq!(renderer.disconnects(), 1);
    assert_eq!(sink.state(), SinkState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_consumer_only_sees_later_chunks() {
    let clock = Arc::new(SystemClock::new());
    let feed = PcmFeed::new();
    let source = AudioSource::local(
        peer(&clock, "producer"),
        "feed",
        SourceKind::Feed(feed.clone()),
        48_000,
        2,
        &AppConfig::default(),
    );

    let mut early = source.start().await.unwrap();
    feed.push(i16_to_pcm_bytes(&vec![1_000i16; 960 * 30])).await.unwrap();

    let first = early.recv().await.unwrap();
    let mut late = source.attach().expect("source is running");
    feed.push(i16_to_pcm_bytes(&vec![1_000i16; 960 * 30])).await.unwrap();
    feed.close();

    let mut early_indices = vec![first.index];
    while let Some(chunk) = early.recv().await {
        early_indices.push(chunk.index);
    }
    let mut late_indices = Vec::new();
    while let Some(chunk) = late.recv().await {
        late_indices.push(chunk.index);
    }

    assert_eq!(early_indices.len(), 60);
    assert!(!late_indices.is_empty());
    assert!(late_indices[0] > first.index);
    // the late consumer sees a suffix of the same stream
    assert!(early_indices.ends_with(&late_indices));
}

#[tokio::test]
async fn test_frames_survive_the_wire_unchanged() {
    let clock = Arc::new(SystemClock::new());
    let feed = PcmFeed::new();
    let source = AudioSource::local(
        peer(&clock, "producer"),
        "feed",
        SourceKind::Feed(feed.clone()),
        48_000,
        1,
        &AppConfig::default(),
    );
    let mut handle = source.start().await.unwrap();
    feed.push(i16_to_pcm_bytes(&vec![500i16; 480 * 10])).await.unwrap();
    feed.close();

    let mut count = 0;
    while let Some(chunk) = handle.recv().await {
        let decoded = decode_frame(encode_frame(&chunk)).unwrap();
        assert_eq!(decoded, chunk);
        count += 1;
    }
    assert_eq!(count, 10);
}

#[tokio::test]
async fn test_producer_exit_reported_and_source_restartable() {
    let clock = Arc::new(SystemClock::new());
    let source = AudioSource::local(
        peer(&clock, "producer"),
        "short",
        SourceKind::Process {
            command: "head".into(),
            args: vec!["-c".into(), "19200".into(), "/dev/zero".into()],
        },
        48_000,
        2,
        &AppConfig::default(),
    );
    let mut events = source.subscribe();

    let mut handle = source.start().await.unwrap();
    let mut chunks = 0;
    while handle.recv().await.is_some() {
        chunks += 1;
    }
    assert_eq!(chunks, 5);

    let reason = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SourceEvent::Stopped { reason, .. }) = events.recv().await {
                break reason;
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(reason, StopReason::ProducerEnded(_)));

    // a natural end is not terminal
    let _again = source.start().await.unwrap();
}
