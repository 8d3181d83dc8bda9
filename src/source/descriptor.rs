//! Public shape of a source and typed patches against it

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Production backend tag as published to other peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Device,
    Process,
    Feed,
    Remote,
}

/// Descriptor exchanged with the rest of the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    /// Stable across restarts
    pub uuid: Uuid,
    /// Unique per running incarnation of the owning process
    pub instance_uuid: Uuid,
    #[serde(rename = "type")]
    pub kind: SourceType,
    pub name: String,
    pub channels: u16,
    pub rate: u32,
    pub latency_ms: u32,
    /// Synchronized clock value at first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    pub peer_uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
}

impl SourceDescriptor {
    /// Apply every field of `patch` that differs, all at once
    ///
    /// Returns whether anything changed.
    pub fn apply(&mut self, patch: &SourcePatch) -> bool {
        let mut next = self.clone();
        if let Some(instance_uuid) = patch.instance_uuid {
            next.instance_uuid = instance_uuid;
        }
        if let Some(name) = &patch.name {
            next.name.clone_from(name);
        }
        if let Some(channels) = patch.channels {
            next.channels = channels;
        }
        if let Some(rate) = patch.rate {
            next.rate = rate;
        }
        if let Some(latency_ms) = patch.latency_ms {
            next.latency_ms = latency_ms;
        }
        if let Some(started_at) = patch.started_at {
            next.started_at = Some(started_at);
        }
        if let Some(volume) = patch.volume {
            next.volume = Some(volume);
        }

        if next == *self {
            return false;
        }
        *self = next;
        true
    }
}

/// Partial update, one optional entry per field a source supports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourcePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
}

impl SourcePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl From<&SourceDescriptor> for SourcePatch {
    fn from(descriptor: &SourceDescriptor) -> Self {
        Self {
            instance_uuid: Some(descriptor.instance_uuid),
            name: Some(descriptor.name.clone()),
            channels: Some(descriptor.channels),
            rate: Some(descriptor.rate),
            latency_ms: Some(descriptor.latency_ms),
            started_at: descriptor.started_at,
            volume: descriptor.volume,
        }
    }
}

/// Result of reconciling a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Every present field already had that value
    Unchanged,
    Changed,
    /// Carried another incarnation's instance uuid and was dropped whole
    Stale,
}
