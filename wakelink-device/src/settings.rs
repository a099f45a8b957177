//! Persistent device settings (JSON file in the platform data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wakelink_core::{DetectorMode, EngineConfig, LocationInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DeviceSettings {
    pub upload_url: String,
    pub reply_audio_url: String,
    pub location_url: Option<String>,
    pub api_key: Option<String>,
    pub detector_mode: DetectorMode,
    pub classifier_model_path: Option<String>,
    pub classifier_min_confidence: f32,
    pub vad_energy_threshold: f64,
    pub pattern_static_threshold: f64,
    pub min_utterance_ms: u32,
    pub max_utterance_ms: u32,
    pub cooldown_ms: u64,
    pub record_ms: u32,
    pub upload_chunk_bytes: usize,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub always_fetch_reply_audio: bool,
    pub location: Option<LocationInfo>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            upload_url: "http://127.0.0.1:8000/upload_audio".into(),
            reply_audio_url: "http://127.0.0.1:8000/static/reply.wav".into(),
            location_url: None,
            api_key: None,
            detector_mode: DetectorMode::Pattern,
            classifier_model_path: None,
            classifier_min_confidence: 0.7,
            vad_energy_threshold: 150_000.0,
            pattern_static_threshold: 150_000.0,
            min_utterance_ms: 150,
            max_utterance_ms: 2000,
            cooldown_ms: 3000,
            record_ms: 3000,
            upload_chunk_bytes: 2048,
            preferred_input_device: None,
            preferred_output_device: None,
            always_fetch_reply_audio: false,
            location: None,
        }
    }
}

impl DeviceSettings {
    pub fn normalize(&mut self) {
        let defaults = Self::default();
        self.upload_url = non_empty(&self.upload_url).unwrap_or(defaults.upload_url);
        self.reply_audio_url = self.reply_audio_url.trim().to_string();
        self.location_url = self.location_url.as_deref().and_then(non_empty);
        self.api_key = self.api_key.as_deref().and_then(non_empty);
        self.classifier_model_path = self.classifier_model_path.as_deref().and_then(non_empty);
        self.classifier_min_confidence = self.classifier_min_confidence.clamp(0.05, 1.0);
        self.vad_energy_threshold = self.vad_energy_threshold.clamp(1_000.0, 10_000_000.0);
        self.pattern_static_threshold = self.pattern_static_threshold.clamp(1_000.0, 10_000_000.0);
        self.min_utterance_ms = self.min_utterance_ms.clamp(50, 1000);
        self.max_utterance_ms = self
            .max_utterance_ms
            .clamp(self.min_utterance_ms + 100, 5000);
        self.cooldown_ms = self.cooldown_ms.clamp(0, 30_000);
        self.record_ms = self.record_ms.clamp(500, 10_000);
        self.upload_chunk_bytes = self.upload_chunk_bytes.clamp(256, 16 * 1024);
        self.preferred_input_device = self.preferred_input_device.as_deref().and_then(non_empty);
        self.preferred_output_device = self.preferred_output_device.as_deref().and_then(non_empty);
    }

    /// Apply `WAKELINK_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("WAKELINK_UPLOAD_URL") {
            self.upload_url = v;
        }
        if let Some(v) = lookup("WAKELINK_REPLY_AUDIO_URL") {
            self.reply_audio_url = v;
        }
        if let Some(v) = lookup("WAKELINK_LOCATION_URL") {
            self.location_url = Some(v);
        }
        if let Some(v) = lookup("WAKELINK_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("WAKELINK_DETECTOR") {
            match v.trim().to_ascii_lowercase().as_str() {
                "pattern" => self.detector_mode = DetectorMode::Pattern,
                "classifier" => self.detector_mode = DetectorMode::Classifier,
                other => tracing::warn!(value = other, "ignoring unknown WAKELINK_DETECTOR"),
            }
        }
        if let Some(v) = lookup("WAKELINK_CLASSIFIER_MODEL") {
            self.classifier_model_path = Some(v);
        }
        if let Some(v) = lookup("WAKELINK_INPUT_DEVICE") {
            self.preferred_input_device = Some(v);
        }
        if let Some(v) = lookup("WAKELINK_OUTPUT_DEVICE") {
            self.preferred_output_device = Some(v);
        }
        if let Some(v) = lookup("WAKELINK_VAD_THRESHOLD").and_then(|v| v.trim().parse().ok()) {
            self.vad_energy_threshold = v;
        }
        if let Some(v) = lookup("WAKELINK_RECORD_MS").and_then(|v| v.trim().parse().ok()) {
            self.record_ms = v;
        }
        if let Some(v) = lookup("WAKELINK_COOLDOWN_MS").and_then(|v| v.trim().parse().ok()) {
            self.cooldown_ms = v;
        }
        if let Some(v) = lookup("WAKELINK_ALWAYS_FETCH_REPLY") {
            self.always_fetch_reply_audio = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            detector: self.detector_mode,
            min_utterance_ms: self.min_utterance_ms,
            max_utterance_ms: self.max_utterance_ms,
            cooldown: Duration::from_millis(self.cooldown_ms),
            record_ms: self.record_ms,
            api_key: self.api_key.clone().unwrap_or_default(),
            location: self.location.clone(),
            always_fetch_reply_audio: self.always_fetch_reply_audio,
            input_device: self.preferred_input_device.clone(),
            output_device: self.preferred_output_device.clone(),
            ..EngineConfig::default()
        };
        config.vad.energy_threshold = self.vad_energy_threshold;
        config.matcher.static_threshold = self.pattern_static_threshold;
        config.gate.min_confidence = self.classifier_min_confidence;
        config.upload.chunk_size = self.upload_chunk_bytes;
        config.endpoints.upload_url = self.upload_url.clone();
        config.endpoints.reply_audio_url = self.reply_audio_url.clone();
        config.endpoints.location_url = self.location_url.clone();
        config
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wakelink")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("wakelink")
            .join("settings.json")
    }
}

/// Load settings, falling back to defaults when the file is missing or
/// unreadable. Environment overrides apply in both cases.
pub fn load_settings(path: &Path) -> DeviceSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<DeviceSettings>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(path = ?path, "settings file ignored: {e}");
                None
            }
        })
        .unwrap_or_default();
    settings.apply_env_overrides();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &DeviceSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let raw = r#"{ "uploadUrl": "http://10.0.0.2/upload", "detectorMode": "classifier" }"#;
        let mut s: DeviceSettings = serde_json::from_str(raw).unwrap();
        s.normalize();
        assert_eq!(s.upload_url, "http://10.0.0.2/upload");
        assert_eq!(s.detector_mode, DetectorMode::Classifier);
        assert_eq!(s.record_ms, 3000);
        assert_eq!(s.cooldown_ms, 3000);
    }

    #[test]
    fn normalize_clamps_and_blanks() {
        let mut s = DeviceSettings {
            upload_url: "   ".into(),
            api_key: Some("  ".into()),
            min_utterance_ms: 10,
            max_utterance_ms: 20,
            record_ms: 60_000,
            upload_chunk_bytes: 1,
            preferred_input_device: Some("".into()),
            ..DeviceSettings::default()
        };
        s.normalize();
        assert_eq!(s.upload_url, DeviceSettings::default().upload_url);
        assert_eq!(s.api_key, None);
        assert_eq!(s.min_utterance_ms, 50);
        assert_eq!(s.max_utterance_ms, 150);
        assert_eq!(s.record_ms, 10_000);
        assert_eq!(s.upload_chunk_bytes, 256);
        assert_eq!(s.preferred_input_device, None);
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            ("WAKELINK_API_KEY", "secret"),
            ("WAKELINK_DETECTOR", "Classifier"),
            ("WAKELINK_RECORD_MS", "4000"),
            ("WAKELINK_COOLDOWN_MS", "not-a-number"),
            ("WAKELINK_ALWAYS_FETCH_REPLY", "1"),
        ]
        .into_iter()
        .collect();
        let mut s = DeviceSettings::default();
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.api_key.as_deref(), Some("secret"));
        assert_eq!(s.detector_mode, DetectorMode::Classifier);
        assert_eq!(s.record_ms, 4000);
        assert_eq!(s.cooldown_ms, 3000);
        assert!(s.always_fetch_reply_audio);
    }

    #[test]
    fn engine_config_carries_endpoints_and_thresholds() {
        let s = DeviceSettings {
            api_key: Some("k".into()),
            vad_energy_threshold: 90_000.0,
            cooldown_ms: 1500,
            location: Some(LocationInfo {
                city: "Taichung".into(),
                ..Default::default()
            }),
            ..DeviceSettings::default()
        };
        let config = s.to_engine_config();
        assert_eq!(config.api_key, "k");
        assert_eq!(config.vad.energy_threshold, 90_000.0);
        assert_eq!(config.cooldown, Duration::from_millis(1500));
        assert_eq!(config.cooldown_chunks(), 15);
        assert_eq!(config.endpoints.upload_url, s.upload_url);
        assert_eq!(config.location.map(|l| l.city), Some("Taichung".into()));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("wakelink-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let s = DeviceSettings {
            record_ms: 2500,
            ..DeviceSettings::default()
        };
        save_settings(&path, &s).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"recordMs\": 2500"));
        let loaded: DeviceSettings = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded, s);
        let _ = fs::remove_dir_all(dir);
    }
}
