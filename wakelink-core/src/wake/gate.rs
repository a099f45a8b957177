//! Sliding-window classifier gate.
//!
//! Samples accumulate in a [`SlidingWindow`]. Each time it fills, the window
//! is skipped if its mean energy is at or below `energy_gate`; otherwise it is
//! handed whole to the classifier. A hit clears the window, anything else
//! slides it forward by one hop.

use tracing::{debug, info};

use crate::buffering::SlidingWindow;
use crate::classifier::ClassifierHandle;
use crate::error::Result;
use crate::vad::mean_energy;
use crate::wake::{Detection, DetectionSource};

/// Which classifier output counts as the wake phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeLabel {
    pub index: usize,
    /// Matched case-insensitively as a substring of the label name.
    pub name: Option<String>,
}

impl Default for WakeLabel {
    fn default() -> Self {
        Self {
            index: 0,
            name: Some("hi lemon".into()),
        }
    }
}

impl WakeLabel {
    pub fn matches(&self, index: usize, name: Option<&str>) -> bool {
        if index == self.index {
            return true;
        }
        match (&self.name, name) {
            (Some(wanted), Some(actual)) => actual
                .to_ascii_lowercase()
                .contains(&wanted.to_ascii_lowercase()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub window_ms: u32,
    pub hop_ms: u32,
    /// Windows with mean energy at or below this never reach the classifier.
    pub energy_gate: f64,
    /// Confidence must exceed this.
    pub min_confidence: f32,
    pub wake_label: WakeLabel,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            hop_ms: 500,
            energy_gate: 100_000.0,
            min_confidence: 0.7,
            wake_label: WakeLabel::default(),
        }
    }
}

pub struct ClassifierGate {
    config: GateConfig,
    classifier: ClassifierHandle,
    window: SlidingWindow,
    sample_rate: u32,
    windows_seen: u64,
    windows_classified: u64,
}

impl ClassifierGate {
    pub fn new(config: GateConfig, classifier: ClassifierHandle, sample_rate: u32) -> Self {
        let window_len = (sample_rate as usize * config.window_ms as usize / 1000).max(1);
        let hop_len = (sample_rate as usize * config.hop_ms as usize / 1000).clamp(1, window_len);
        Self {
            window: SlidingWindow::new(window_len, hop_len),
            config,
            classifier,
            sample_rate,
            windows_seen: 0,
            windows_classified: 0,
        }
    }

    /// Feed one chunk. Returns a detection as soon as a window is accepted;
    /// the rest of that chunk is discarded along with the cleared window.
    pub fn push(&mut self, mut chunk: &[i16]) -> Result<Option<Detection>> {
        while !chunk.is_empty() {
            let used = self.window.fill(chunk);
            chunk = &chunk[used..];

            let Some(window) = self.window.full_window() else {
                break;
            };
            self.windows_seen += 1;

            let energy = mean_energy(window);
            if energy > self.config.energy_gate {
                self.windows_classified += 1;
                let inference = self.classifier.infer(window)?;
                let name = self.classifier.label_name(inference.label);
                debug!(
                    energy,
                    label = inference.label,
                    name = name.as_deref().unwrap_or("?"),
                    confidence = inference.confidence,
                    "classified window"
                );

                if inference.confidence > self.config.min_confidence
                    && self
                        .config
                        .wake_label
                        .matches(inference.label, name.as_deref())
                {
                    let duration_ms = (window.len() as u64 * 1000 / self.sample_rate as u64) as u32;
                    info!(
                        confidence = inference.confidence,
                        label = name.as_deref().unwrap_or("?"),
                        "wake phrase classified"
                    );
                    self.window.clear();
                    return Ok(Some(Detection {
                        source: DetectionSource::Classifier,
                        duration_ms,
                        confidence: Some(inference.confidence),
                    }));
                }
            }
            self.window.slide();
        }
        Ok(None)
    }

    /// Drop buffered audio, e.g. after a cooldown.
    pub fn reset(&mut self) {
        self.window.clear();
        self.classifier.0.lock().reset();
    }

    /// `(windows filled, windows sent to the classifier)`.
    pub fn counters(&self) -> (u64, u64) {
        (self.windows_seen, self.windows_classified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Inference, ScriptedClassifier};

    const RATE: u32 = 1000;

    fn gate(script: Vec<Inference>) -> ClassifierGate {
        let classifier = ScriptedClassifier::default().with_script(script);
        ClassifierGate::new(
            GateConfig::default(),
            ClassifierHandle::new(classifier),
            RATE,
        )
    }

    fn loud(len: usize) -> Vec<i16> {
        (0..len).map(|i| if i % 2 == 0 { 2000 } else { -2000 }).collect()
    }

    #[test]
    fn quiet_windows_skip_the_classifier() {
        let mut g = gate(vec![]);
        assert!(g.push(&vec![10; 5000]).unwrap().is_none());
        let (seen, classified) = g.counters();
        assert!(seen >= 9);
        assert_eq!(classified, 0);
    }

    #[test]
    fn confident_wake_label_is_accepted_and_clears() {
        let mut g = gate(vec![
            Inference {
                label: 0,
                confidence: 0.6,
            },
            Inference {
                label: 0,
                confidence: 0.95,
            },
        ]);
        // First window (1000 samples) scores 0.6: rejected, slides by 500.
        assert!(g.push(&loud(1000)).unwrap().is_none());
        // Next 500 samples complete the second window.
        let hit = g.push(&loud(500)).unwrap().unwrap();
        assert_eq!(hit.source, DetectionSource::Classifier);
        assert_eq!(hit.confidence, Some(0.95));
        assert_eq!(hit.duration_ms, 1000);
        // Window was cleared: 500 more samples do not fill it.
        assert!(g.push(&loud(500)).unwrap().is_none());
        assert_eq!(g.counters(), (2, 2));
    }

    #[test]
    fn other_label_is_rejected_even_when_confident() {
        let mut g = gate(vec![Inference {
            label: 1,
            confidence: 0.99,
        }]);
        assert!(g.push(&loud(1000)).unwrap().is_none());
    }

    #[test]
    fn label_matches_by_name() {
        let label = WakeLabel {
            index: 7,
            name: Some("Hi Lemon".into()),
        };
        assert!(label.matches(2, Some("hi lemon")));
        assert!(label.matches(7, None));
        assert!(!label.matches(2, Some("noise")));
    }
}
