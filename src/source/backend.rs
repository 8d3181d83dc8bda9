//! Production backends, one variant per concrete source kind
//!
//! A backend yields exactly one upstream byte stream per start and knows how
//! to tear it down again. Local kinds produce raw s16le PCM that still needs
//! chunking and encoding; a remote mirror receives frames that are already
//! chunked and encoded by the owning peer.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::DeviceCapture;
use crate::error::SourceError;
use crate::source::descriptor::{SourceDescriptor, SourceType};

/// Queue depth for byte streams a backend hands to the pipeline
pub const UPSTREAM_QUEUE_LEN: usize = 256;

const PROCESS_READ_BYTES: usize = 8192;

/// Peer layer capability: a raw frame channel for one remote source
pub trait FrameChannel: Send + Sync {
    fn open(&self, source: Uuid) -> Result<mpsc::Receiver<Bytes>, SourceError>;
}

/// In-memory PCM producer driven by the caller
#[derive(Clone, Default)]
pub struct PcmFeed {
    tx: Arc<Mutex<Option<mpsc::Sender<Bytes>>>>,
}

impl PcmFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(&self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(UPSTREAM_QUEUE_LEN);
        *self.tx.lock() = Some(tx);
        rx
    }

    /// Hand s16le PCM to the running source, waiting for room
    pub async fn push(&self, pcm: Bytes) -> Result<(), SourceError> {
        let tx = self.tx.lock().clone().ok_or(SourceError::Stopped)?;
        tx.send(pcm).await.map_err(|_| SourceError::Stopped)
    }

    pub fn is_connected(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// End of input; the source drains what is buffered and goes idle
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

impl fmt::Debug for PcmFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmFeed")
            .field("connected", &self.is_connected())
            .finish()
    }
}

pub enum SourceKind {
    /// cpal capture, `None` for the default input
    Device { device_id: Option<String> },
    /// Child process writing s16le PCM at the descriptor's rate on stdout
    Process { command: String, args: Vec<String> },
    Feed(PcmFeed),
    /// Mirror of a source owned by another peer
    Remote(Arc<dyn FrameChannel>),
}

impl SourceKind {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceKind::Device { .. } => SourceType::Device,
            SourceKind::Process { .. } => SourceType::Process,
            SourceKind::Feed(_) => SourceType::Feed,
            SourceKind::Remote(_) => SourceType::Remote,
        }
    }

    pub fn default_policy(&self) -> NoConsumerPolicy {
        match self {
            SourceKind::Remote(_) => NoConsumerPolicy::StopProduction,
            _ => NoConsumerPolicy::KeepRunning,
        }
    }

    pub(crate) async fn open(&self, descriptor: &SourceDescriptor) -> Result<Production, SourceError> {
        match self {
            SourceKind::Device { device_id } => {
                let mut capture = DeviceCapture::new(device_id.as_deref(), Some(descriptor.channels))
                    .map_err(|e| SourceError::Configuration(e.to_string()))?;
                let upstream = capture.start().map_err(|e| SourceError::Backend(e.to_string()))?;
                Ok(Production {
                    rate: capture.sample_rate(),
                    channels: capture.channels(),
                    upstream: Upstream::Pcm(upstream),
                    teardown: Teardown::Capture(capture),
                })
            }
            SourceKind::Process { command, args } => {
                let mut child = Command::new(command)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| SourceError::Backend(format!("{}: {}", command, e)))?;
                let mut stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| SourceError::Backend("child has no stdout".into()))?;

                let (tx, rx) = mpsc::channel(UPSTREAM_QUEUE_LEN);
                let name = command.clone();
                let reader = tokio::spawn(async move {
                    let mut buf = BytesMut::with_capacity(PROCESS_READ_BYTES);
                    loop {
                        match stdout.read_buf(&mut buf).await {
                            Ok(0) => break,
                            Ok(_) => {
                                if tx.send(buf.split().freeze()).await.is_err() {
                                    break;
                                }
                                buf.reserve(PROCESS_READ_BYTES);
                            }
                            Err(e) => {
                                tracing::warn!(command = %name, "Reading producer output failed: {}", e);
                                break;
                            }
                        }
                    }
                    match child.wait().await {
                        Ok(status) => tracing::info!(command = %name, %status, "producer process exited"),
                        Err(e) => tracing::warn!(command = %name, "Failed to reap producer: {}", e),
                    }
                });

                Ok(Production {
                    rate: descriptor.rate,
                    channels: descriptor.channels,
                    upstream: Upstream::Pcm(rx),
                    // aborting drops the child, which kills it
                    teardown: Teardown::Task(reader),
                })
            }
            SourceKind::Feed(feed) => Ok(Production {
                rate: descriptor.rate,
                channels: descriptor.channels,
                upstream: Upstream::Pcm(feed.connect()),
                teardown: Teardown::Feed(feed.clone()),
            }),
            SourceKind::Remote(channel) => Ok(Production {
                rate: descriptor.rate,
                channels: descriptor.channels,
                upstream: Upstream::Framed(channel.open(descriptor.uuid)?),
                teardown: Teardown::None,
            }),
        }
    }
}

impl fmt::Debug for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Device { device_id } => f.debug_struct("Device").field("device_id", device_id).finish(),
            SourceKind::Process { command, args } => {
                f.debug_struct("Process").field("command", command).field("args", args).finish()
            }
            SourceKind::Feed(feed) => f.debug_tuple("Feed").field(feed).finish(),
            SourceKind::Remote(_) => f.write_str("Remote"),
        }
    }
}

/// What happens once the last consumer detaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoConsumerPolicy {
    /// Keep producing unattended (a player process keeps its state)
    KeepRunning,
    /// Stop the pipeline and let the producer go
    StopProduction,
}

pub(crate) struct Production {
    pub rate: u32,
    pub channels: u16,
    pub upstream: Upstream,
    pub teardown: Teardown,
}

pub(crate) enum Upstream {
    /// Raw s16le PCM at `Production::rate`
    Pcm(mpsc::Receiver<Bytes>),
    /// Wire frames carrying encoded chunks
    Framed(mpsc::Receiver<Bytes>),
}

pub(crate) enum Teardown {
    None,
    Capture(DeviceCapture),
    Task(JoinHandle<()>),
    Feed(PcmFeed),
}

impl Teardown {
    pub fn run(self) {
        match self {
            Teardown::None => {}
            Teardown::Capture(mut capture) => capture.stop(),
            Teardown::Task(task) => task.abort(),
            Teardown::Feed(feed) => feed.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: SourceType) -> SourceDescriptor {
        SourceDescriptor {
            uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
            kind,
            name: "test".into(),
            channels: 2,
            rate: 48_000,
            latency_ms: 500,
            started_at: None,
            peer_uuid: Uuid::new_v4(),
            volume: None,
        }
    }

    #[tokio::test]
    async fn test_feed_push_and_close() {
        let feed = PcmFeed::new();
        assert!(matches!(feed.push(Bytes::from_static(&[0, 0])).await, Err(SourceError::Stopped)));

        let kind = SourceKind::Feed(feed.clone());
        let production = kind.open(&descriptor(SourceType::Feed)).await.unwrap();
        let Upstream::Pcm(mut rx) = production.upstream else {
            panic!("feed must produce pcm");
        };

        feed.push(Bytes::from_static(&[1, 2, 3, 4])).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(&[1, 2, 3, 4]));

        production.teardown.run();
        assert!(!feed.is_connected());
        assert!(rx.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_stdout_becomes_upstream() {
        let kind = SourceKind::Process {
            command: "printf".into(),
            args: vec!["abcd".into()],
        };
        let production = kind.open(&descriptor(SourceType::Process)).await.unwrap();
        let Upstream::Pcm(mut rx) = production.upstream else {
            panic!("process must produce pcm");
        };

        let mut received = Vec::new();
        while let Some(bytes) = rx.recv().await {
            received.extend_from_slice(&bytes);
        }
        assert_eq!(received, b"abcd");
    }

    #[tokio::test]
    async fn test_missing_binary_is_backend_error() {
        let kind = SourceKind::Process {
            command: "/nonexistent/producer".into(),
            args: vec![],
        };
        assert!(matches!(
            kind.open(&descriptor(SourceType::Process)).await,
            Err(SourceError::Backend(_))
        ));
    }

    #[test]
    fn test_remote_default_policy_stops() {
        struct Closed;
        impl FrameChannel for Closed {
            fn open(&self, _: Uuid) -> Result<mpsc::Receiver<Bytes>, SourceError> {
                Err(SourceError::Backend("closed".into()))
            }
        }
        let remote = SourceKind::Remote(Arc::new(Closed));
        assert_eq!(remote.default_policy(), NoConsumerPolicy::StopProduction);
        assert_eq!(remote.source_type(), SourceType::Remote);
        assert_eq!(
            SourceKind::Feed(PcmFeed::new()).default_policy(),
            NoConsumerPolicy::KeepRunning
        );
    }
}
