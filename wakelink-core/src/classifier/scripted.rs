//! `ScriptedClassifier`: deterministic backend that replays canned results.
//!
//! Lets the classifier detection path run end to end on hosts without a
//! trained model, and gives tests exact control over what each window scores.

use std::collections::VecDeque;

use tracing::debug;

use crate::classifier::{Inference, WakeClassifier};
use crate::error::Result;

/// Replays a queue of inferences, one per call, then a fallback forever.
pub struct ScriptedClassifier {
    labels: Vec<String>,
    script: VecDeque<Inference>,
    fallback: Inference,
    calls: u64,
}

impl ScriptedClassifier {
    pub fn new(labels: Vec<String>) -> Self {
        // "noise" at full confidence unless told otherwise.
        let fallback = Inference {
            label: labels.len().saturating_sub(1),
            confidence: 1.0,
        };
        Self {
            labels,
            script: VecDeque::new(),
            fallback,
            calls: 0,
        }
    }

    /// Queue results to return for the next windows, in order.
    pub fn with_script(mut self, script: impl IntoIterator<Item = Inference>) -> Self {
        self.script.extend(script);
        self
    }

    /// Result returned once the script has run out.
    pub fn with_fallback(mut self, fallback: Inference) -> Self {
        self.fallback = fallback;
        self
    }

    /// Number of `infer` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for ScriptedClassifier {
    fn default() -> Self {
        Self::new(vec!["hi lemon".into(), "noise".into()])
    }
}

impl WakeClassifier for ScriptedClassifier {
    fn warm_up(&mut self) -> Result<()> {
        debug!("ScriptedClassifier::warm_up: no-op");
        Ok(())
    }

    fn infer(&mut self, window: &[i16]) -> Result<Inference> {
        self.calls += 1;
        let result = self.script.pop_front().unwrap_or(self.fallback);
        debug!(
            call = self.calls,
            len = window.len(),
            label = result.label,
            confidence = result.confidence,
            "scripted inference"
        );
        Ok(result)
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn reset(&mut self) {}
}
