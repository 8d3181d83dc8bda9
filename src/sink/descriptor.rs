//! Public shape of a sink

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkDescriptor {
    pub uuid: Uuid,
    pub instance_uuid: Uuid,
    /// Render backend name, e.g. `cpal`
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub peer_uuid: Uuid,
    pub channels: u16,
    pub volume: f32,
    /// Output latency reported by the render backend
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub piped_from: Option<Uuid>,
    pub available: bool,
}

impl SinkDescriptor {
    /// Returns whether anything changed
    pub fn apply(&mut self, patch: &SinkPatch) -> bool {
        let mut next = self.clone();
        if let Some(name) = &patch.name {
            next.name.clone_from(name);
        }
        if let Some(volume) = patch.volume {
            next.volume = volume.clamp(0.0, 1.0);
        }
        if next == *self {
            return false;
        }
        *self = next;
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SinkPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_json() {
        let descriptor = SinkDescriptor {
            uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
            kind: "cpal".into(),
            name: "speakers".into(),
            peer_uuid: Uuid::new_v4(),
            channels: 2,
            volume: 1.0,
            latency_ms: 12.5,
            piped_from: None,
            available: true,
        };
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["type"], "cpal");
        assert_eq!(json["latencyMs"], 12.5);
        assert!(json.get("pipedFrom").is_none());
    }

    #[test]
    fn test_volume_is_clamped() {
        let mut descriptor = SinkDescriptor {
            uuid: Uuid::nil(),
            instance_uuid: Uuid::nil(),
            kind: "memory".into(),
            name: "test".into(),
            peer_uuid: Uuid::nil(),
            channels: 2,
            volume: 1.0,
            latency_ms: 0.0,
            piped_from: None,
            available: true,
        };
        assert!(!descriptor.apply(&SinkPatch { volume: Some(3.0), ..Default::default() }));
        assert!(descriptor.apply(&SinkPatch { volume: Some(0.25), ..Default::default() }));
        assert_eq!(descriptor.volume, 0.25);
    }
}
