//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub direction: DeviceDirection,
    pub is_default: bool,
    /// Input only: heuristically the best microphone for the wake detector.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "virtual output",
];

const MIC_KEYWORDS: &[&str] = &["microphone", "mic", "array", "headset", "usb", "i2s"];

/// Capture devices that record system output rather than a microphone.
/// A wake detector listening to its own speaker would trigger itself.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Higher is better.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    score
}

#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut list: Vec<DeviceInfo> = match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    name,
                    direction: DeviceDirection::Input,
                    is_recommended: false,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    };

    if let Some(best) = list
        .iter_mut()
        .max_by_key(|d| mic_preference_score(&d.name) + if d.is_default { 2 } else { 0 })
    {
        best.is_recommended = true;
    }
    list.sort_by_key(|d| (!d.is_recommended, !d.is_default, d.name.to_ascii_lowercase()));
    list
}

#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    match host.output_devices() {
        Ok(devices) => {
            let mut list: Vec<DeviceInfo> = devices
                .enumerate()
                .map(|(idx, device)| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                    DeviceInfo {
                        is_default: default_name.as_deref() == Some(name.as_str()),
                        name,
                        direction: DeviceDirection::Output,
                        is_recommended: false,
                    }
                })
                .collect();
            list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
            list
        }
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Pick a device by exact name, else the host default, else the first one.
#[cfg(feature = "audio-cpal")]
pub(crate) fn select_device<I>(
    preferred: Option<&str>,
    devices: impl FnOnce() -> std::result::Result<I, cpal::DevicesError>,
    default: Option<cpal::Device>,
    kind: &str,
) -> Option<cpal::Device>
where
    I: Iterator<Item = cpal::Device>,
{
    use cpal::traits::DeviceTrait;

    let listed = match devices() {
        Ok(iter) => iter.collect::<Vec<_>>(),
        Err(e) => {
            tracing::warn!("failed to list {kind} devices: {e}");
            Vec::new()
        }
    };

    if let Some(name) = preferred {
        if let Some(found) = listed
            .iter()
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        {
            return Some(found.clone());
        }
        tracing::warn!("preferred {kind} device '{name}' not found, falling back");
    }

    default.or_else(|| {
        let first = listed.into_iter().next();
        if first.is_some() {
            tracing::warn!("no default {kind} device, falling back to first available");
        }
        first
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("USB PnP Microphone"));
    }

    #[test]
    fn scores_mic_higher_than_loopback() {
        let mic = mic_preference_score("Microphone Array (USB PnP Audio Device)");
        let loopback = mic_preference_score("Stereo Mix (Realtek Audio)");
        assert!(mic > loopback);
    }

    #[test]
    fn device_info_serialises_camel_case() {
        let info = DeviceInfo {
            name: "mic".into(),
            direction: DeviceDirection::Input,
            is_default: true,
            is_recommended: false,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"isDefault\":true"));
        assert!(json.contains("\"direction\":\"input\""));
    }
}
