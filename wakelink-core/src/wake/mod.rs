//! Wake-phrase detection.
//!
//! Two interchangeable detectors decide whether an utterance is the wake
//! phrase:
//!
//! - [`phrase::PhraseMatcher`]: energy-contour heuristic looking for a
//!   high / low / high shape over a collected utterance.
//! - [`gate::ClassifierGate`]: sliding window fed to a [`WakeClassifier`]
//!   after an energy pre-check.
//!
//! [`WakeClassifier`]: crate::classifier::WakeClassifier

pub mod gate;
pub mod phrase;

pub use gate::{ClassifierGate, GateConfig, WakeLabel};
pub use phrase::{EnergyProfile, PatternMatch, PhraseMatcher, PhraseMatcherConfig};

use serde::{Deserialize, Serialize};

/// Which detector produced a [`Detection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Pattern,
    Classifier,
}

/// An accepted wake phrase.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub source: DetectionSource,
    /// Length of the audio the decision was made on.
    pub duration_ms: u32,
    /// Classifier confidence; `None` for the heuristic.
    pub confidence: Option<f32>,
}
