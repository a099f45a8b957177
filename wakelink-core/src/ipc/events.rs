//! Events broadcast by [`crate::engine::WakeEngine`].
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `EngineStatusEvent` | `subscribe_status()` |
//! | `AudioActivityEvent` | `subscribe_activity()` |
//! | `WakeEvent` | `subscribe_wakes()` |
//! | `ExchangeEvent` | `subscribe_exchanges()` |

use serde::{Deserialize, Serialize};

use crate::wake::DetectionSource;

// ---------------------------------------------------------------------------
// Audio activity events
// ---------------------------------------------------------------------------

/// Emitted for each chunk read while listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Mean squared amplitude of the chunk.
    pub energy: f64,
    /// VAD decision for the chunk.
    pub is_speech: bool,
}

// ---------------------------------------------------------------------------
// Wake and exchange events
// ---------------------------------------------------------------------------

/// Emitted when the wake phrase is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeEvent {
    pub seq: u64,
    pub source: DetectionSource,
    /// Length of the audio the decision was made on.
    pub duration_ms: u32,
    /// Classifier confidence; absent for energy-pattern detections.
    pub confidence: Option<f32>,
}

/// Emitted once per record/upload/reply cycle, successful or not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeEvent {
    pub seq: u64,
    pub transcript: Option<String>,
    pub reply: Option<String>,
    /// HTTP status of the upload, when one was received.
    pub upload_status: Option<u16>,
    pub reply_audio_played: bool,
    pub ok: bool,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Loading and exercising the wake classifier.
    WarmingUp,
    /// Waiting for speech.
    Listening,
    /// Speech detected, gathering the candidate phrase.
    Collecting,
    /// Wake accepted, recording the utterance.
    Recording,
    /// Sending the utterance and waiting for the reply.
    Uploading,
    /// Playing the synthesised reply.
    Playing,
    /// Ignoring input after a detection.
    Cooldown,
    /// Capture stopped; engine may be restarted.
    Stopped,
    /// Unrecoverable error, restart required.
    Error,
}
