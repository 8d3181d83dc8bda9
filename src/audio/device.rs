//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Serializable summary of a device, published alongside source/sink state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// `input:<name>` or `output:<name>`
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Rates we probe device ranges against
const COMMON_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// List capture and playback devices of the default host
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = capabilities(&device, true);
            devices.push(DeviceInfo {
                id: format!("input:{}", name),
                is_default: default_input.as_ref() == Some(&name),
                name,
                is_input: true,
                sample_rates,
                channels,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = capabilities(&device, false);
            devices.push(DeviceInfo {
                id: format!("output:{}", name),
                is_default: default_output.as_ref() == Some(&name),
                name,
                is_input: false,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

fn capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    };

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for range in &ranges {
        for rate in COMMON_RATES {
            let r = cpal::SampleRate(rate);
            if r >= range.min_sample_rate() && r <= range.max_sample_rate() && !rates.contains(&rate) {
                rates.push(rate);
            }
        }
        if !channels.contains(&range.channels()) {
            channels.push(range.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Resolve a device id; an id without prefix is looked up among inputs
pub fn get_device_by_id(id: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let (is_input, name) = match id.split_once(':') {
        Some(("input", name)) => (true, name),
        Some(("output", name)) => (false, name),
        _ => (true, id),
    };

    let devices = if is_input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(id.to_string()))
}

pub fn default_input_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceNotFound("no default input device".to_string()))
}

pub fn default_output_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceNotFound("no default output device".to_string()))
}

/// `None` selects the default device of the requested direction
pub fn resolve_device(id: Option<&str>, is_input: bool) -> Result<cpal::Device, AudioError> {
    match id {
        Some(id) => get_device_by_id(id),
        None if is_input => default_input_device(),
        None => default_output_device(),
    }
}
