//! Demo UDP transport used by the binaries
//!
//! One datagram carries either a source announcement or one framed chunk:
//!
//! ```text
//! 0x00 | descriptor as JSON
//! 0x01 | source uuid (16 bytes) | index (4 bytes LE) | opus payload
//! ```
//!
//! This is not a protocol, just enough plumbing to run two peers.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SourceError;
use crate::source::backend::UPSTREAM_QUEUE_LEN;
use crate::source::{FrameChannel, SourceDescriptor};

const TAG_DESCRIPTOR: u8 = 0;
const TAG_FRAME: u8 = 1;

/// Largest datagram we read
pub const MAX_DATAGRAM: usize = 8192;

#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Descriptor(SourceDescriptor),
    Frame { source: Uuid, frame: Bytes },
}

impl Datagram {
    pub fn encode(&self) -> Bytes {
        match self {
            Datagram::Descriptor(descriptor) => {
                let mut buf = BytesMut::with_capacity(256);
                buf.put_u8(TAG_DESCRIPTOR);
                // SourceDescriptor only holds plain data
                if let Ok(json) = serde_json::to_vec(descriptor) {
                    buf.put_slice(&json);
                }
                buf.freeze()
            }
            Datagram::Frame { source, frame } => {
                let mut buf = BytesMut::with_capacity(1 + 16 + frame.len());
                buf.put_u8(TAG_FRAME);
                buf.put_slice(source.as_bytes());
                buf.put_slice(frame);
                buf.freeze()
            }
        }
    }

    /// `None` for anything malformed
    pub fn decode(mut datagram: Bytes) -> Option<Self> {
        if datagram.is_empty() {
            return None;
        }
        let tag = datagram.split_to(1)[0];
        match tag {
            TAG_DESCRIPTOR => serde_json::from_slice(&datagram).ok().map(Datagram::Descriptor),
            TAG_FRAME if datagram.len() >= 16 => {
                let source = Uuid::from_slice(&datagram.split_to(16)).ok()?;
                Some(Datagram::Frame { source, frame: datagram })
            }
            _ => None,
        }
    }
}

/// Receiving end: routes frame datagrams to the mirror that opened them
#[derive(Default)]
pub struct UdpFrameRouter {
    routes: DashMap<Uuid, mpsc::Sender<Bytes>>,
}

impl UdpFrameRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver one frame, dropping it when nobody listens or the queue is full
    pub fn route(&self, source: Uuid, frame: Bytes) -> bool {
        let Some(route) = self.routes.get(&source) else {
            return false;
        };
        match route.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(source = %source, "frame queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                drop(route);
                self.routes.remove(&source);
                false
            }
        }
    }

    pub fn is_open(&self, source: &Uuid) -> bool {
        self.routes.get(source).is_some_and(|route| !route.is_closed())
    }
}

impl FrameChannel for UdpFrameRouter {
    fn open(&self, source: Uuid) -> Result<mpsc::Receiver<Bytes>, SourceError> {
        let (tx, rx) = mpsc::channel(UPSTREAM_QUEUE_LEN);
        self.routes.insert(source, tx);
        Ok(rx)
    }
}

/// Receive loop: descriptors go to `on_descriptor`, frames to the router
pub async fn run_receiver<F>(
    socket: UdpSocket,
    router: Arc<UdpFrameRouter>,
    mut on_descriptor: F,
) -> std::io::Result<()>
where
    F: FnMut(SourceDescriptor, SocketAddr),
{
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        match Datagram::decode(Bytes::copy_from_slice(&buf[..len])) {
            Some(Datagram::Descriptor(descriptor)) => on_descriptor(descriptor, from),
            Some(Datagram::Frame { source, frame }) => {
                router.route(source, frame);
            }
            None => tracing::debug!(%from, len, "ignoring malformed datagram"),
        }
    }
}
