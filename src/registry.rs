//! Sources and sinks known to this peer, keyed by uuid
//!
//! Descriptors received from other peers are reconciled here: an unknown
//! remote source becomes a mirror, a known one is patched.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::context::LocalContext;
use crate::sink::{AudioSink, SinkDescriptor};
use crate::source::{AudioSource, FrameChannel, SourceDescriptor, SourcePatch, UpdateOutcome};

/// What `apply_source_descriptor` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A remote mirror was created
    Created,
    Updated(UpdateOutcome),
    /// Claims to be ours but is unknown here, likely a previous incarnation
    Ignored,
}

pub struct Registry {
    ctx: Arc<LocalContext>,
    config: AppConfig,
    transport: Arc<dyn FrameChannel>,
    sources: DashMap<Uuid, AudioSource>,
    sinks: DashMap<Uuid, AudioSink>,
}

impl Registry {
    /// `transport` opens frame channels for remote mirrors
    pub fn new(ctx: Arc<LocalContext>, config: AppConfig, transport: Arc<dyn FrameChannel>) -> Self {
        Self {
            ctx,
            config,
            transport,
            sources: DashMap::new(),
            sinks: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<LocalContext> {
        &self.ctx
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn add_source(&self, source: AudioSource) {
        tracing::info!(source = %source.uuid(), "Registered audio source");
        self.sources.insert(source.uuid(), source);
    }

    pub fn add_sink(&self, sink: AudioSink) {
        tracing::info!(sink = %sink.uuid(), "Registered audio sink");
        self.sinks.insert(sink.uuid(), sink);
    }

    pub fn source(&self, uuid: &Uuid) -> Option<AudioSource> {
        self.sources.get(uuid).map(|entry| entry.value().clone())
    }

    pub fn sink(&self, uuid: &Uuid) -> Option<AudioSink> {
        self.sinks.get(uuid).map(|entry| entry.value().clone())
    }

    /// Unregister and close the source for good
    pub fn remove_source(&self, uuid: &Uuid) -> Option<AudioSource> {
        let (_, source) = self.sources.remove(uuid)?;
        source.close();
        Some(source)
    }

    pub fn remove_sink(&self, uuid: &Uuid) -> Option<AudioSink> {
        let (_, sink) = self.sinks.remove(uuid)?;
        sink.stop();
        Some(sink)
    }

    /// Reconcile a descriptor announced by the peer layer
    pub fn apply_source_descriptor(&self, descriptor: SourceDescriptor) -> Reconciled {
        if let Some(source) = self.source(&descriptor.uuid) {
            return Reconciled::Updated(source.update_info(&SourcePatch::from(&descriptor)));
        }

        if descriptor.peer_uuid == self.ctx.peer_uuid {
            tracing::debug!(source = %descriptor.uuid, "ignoring descriptor for unknown local source");
            return Reconciled::Ignored;
        }

        let source = AudioSource::remote(self.ctx.clone(), descriptor, self.transport.clone(), &self.config);
        self.add_source(source);
        Reconciled::Created
    }

    /// Stop sources whose owning peer went away
    pub fn remove_peer(&self, peer_uuid: &Uuid) -> usize {
        let gone: Vec<Uuid> = self
            .sources
            .iter()
            .filter(|entry| !entry.value().is_local() && entry.value().to_descriptor().peer_uuid == *peer_uuid)
            .map(|entry| *entry.key())
            .collect();
        for uuid in &gone {
            self.remove_source(uuid);
        }
        gone.len()
    }

    pub fn source_descriptors(&self) -> Vec<SourceDescriptor> {
        self.sources.iter().map(|entry| entry.value().to_descriptor()).collect()
    }

    pub fn sink_descriptors(&self) -> Vec<SinkDescriptor> {
        self.sinks.iter().map(|entry| entry.value().to_descriptor()).collect()
    }

    /// Stop everything, used at shutdown
    pub fn stop_all(&self) {
        for sink in self.sinks.iter() {
            sink.value().stop();
        }
        for source in self.sources.iter() {
            source.value().stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::error::SourceError;
    use crate::sink::MemoryRenderer;
    use crate::source::{PcmFeed, SourceKind, SourceType};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct NoTransport;

    impl FrameChannel for NoTransport {
        fn open(&self, _: Uuid) -> Result<mpsc::Receiver<Bytes>, SourceError> {
            Err(SourceError::Backend("no transport".into()))
        }
    }

    fn registry() -> Registry {
        let ctx = LocalContext::new(Uuid::new_v4(), "peer", Arc::new(ManualClock::new(0.0)));
        Registry::new(ctx, AppConfig::default(), Arc::new(NoTransport))
    }

    fn remote_descriptor(peer_uuid: Uuid) -> SourceDescriptor {
        SourceDescriptor {
            uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
            kind: SourceType::Process,
            name: "librespot".into(),
            channels: 2,
            rate: 44_100,
            latency_ms: 500,
            started_at: Some(5_000.0),
            peer_uuid,
            volume: None,
        }
    }

    #[test]
    fn test_unknown_remote_descriptor_creates_mirror() {
        let registry = registry();
        let descriptor = remote_descriptor(Uuid::new_v4());

        assert_eq!(registry.apply_source_descriptor(descriptor.clone()), Reconciled::Created);
        let mirror = registry.source(&descriptor.uuid).unwrap();
        assert!(!mirror.is_local());
        assert_eq!(mirror.to_descriptor().kind, SourceType::Remote);
        assert_eq!(mirror.started_at(), Some(5_000.0));

        assert_eq!(
            registry.apply_source_descriptor(descriptor.clone()),
            Reconciled::Updated(UpdateOutcome::Unchanged)
        );

        let mut renamed = descriptor;
        renamed.name = "spotify".into();
        assert_eq!(
            registry.apply_source_descriptor(renamed),
            Reconciled::Updated(UpdateOutcome::Changed)
        );
        assert_eq!(registry.source_descriptors()[0].name, "spotify");
    }

    #[test]
    fn test_stale_descriptor_for_local_source() {
        let registry = registry();
        let ctx = registry.context().clone();
        let source = AudioSource::local(ctx.clone(), "feed", SourceKind::Feed(PcmFeed::new()), 48_000, 2, registry.config());
        registry.add_source(source.clone());

        let mut stale = source.to_descriptor();
        stale.instance_uuid = Uuid::new_v4();
        stale.name = "old name".into();
        assert_eq!(
            registry.apply_source_descriptor(stale),
            Reconciled::Updated(UpdateOutcome::Stale)
        );
        assert_eq!(source.to_descriptor().name, "feed");

        // a local uuid we never created
        assert_eq!(
            registry.apply_source_descriptor(remote_descriptor(ctx.peer_uuid)),
            Reconciled::Ignored
        );
    }

    #[test]
    fn test_remove_peer_drops_its_mirrors() {
        let registry = registry();
        let peer = Uuid::new_v4();
        registry.apply_source_descriptor(remote_descriptor(peer));
        registry.apply_source_descriptor(remote_descriptor(peer));
        registry.apply_source_descriptor(remote_descriptor(Uuid::new_v4()));

        assert_eq!(registry.remove_peer(&peer), 2);
        assert_eq!(registry.source_descriptors().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_sink_stops_it() {
        let registry = registry();
        let renderer = MemoryRenderer::default();
        let sink = AudioSink::new(registry.context().clone(), "out", Box::new(renderer.clone()), registry.config());
        let uuid = sink.uuid();
        registry.add_sink(sink);
        assert_eq!(registry.sink_descriptors().len(), 1);

        let removed = registry.remove_sink(&uuid).unwrap();
        assert!(registry.sink(&uuid).is_none());
        assert_eq!(renderer.disconnects(), 1);
        assert_eq!(removed.uuid(), uuid);
    }
}
