//! Listening / collecting / cooldown state machine.
//!
//! ```text
//!             voice                    silence
//! Listening ─────────► Collecting ─────────────► pattern check ──► Listening
//!     ▲                                               │ accept
//!     │ counter exhausted                             ▼
//!     └──────────────── Cooldown ◄──── (record + upload, owned by the pipeline)
//! ```
//!
//! The machine is driven one chunk at a time and never blocks. The record
//! action itself lives in [`super::exchange`]; the pipeline calls
//! [`CaptureStateMachine::enter_cooldown`] once it returns.
//!
//! In classifier mode there is no collecting phase: every listening chunk
//! goes to the [`ClassifierGate`] sliding window.

use tracing::{debug, info};

use crate::{
    buffering::DetectionWindow,
    error::Result,
    vad::{mean_energy, VadDecision, VoiceActivityDetector},
    wake::{ClassifierGate, Detection, DetectionSource, PhraseMatcher},
};

/// Which detector decides whether a candidate is the wake phrase.
pub enum Detector {
    Pattern(PhraseMatcher),
    Classifier(ClassifierGate),
}

impl Detector {
    fn name(&self) -> &'static str {
        match self {
            Detector::Pattern(_) => "pattern",
            Detector::Classifier(_) => "classifier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Listening,
    Collecting,
    Cooldown { remaining: u32 },
}

/// Why a collected candidate was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooShort { duration_ms: u32 },
    TooLong { duration_ms: u32 },
    NoPattern { duration_ms: u32 },
}

/// What happened on one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Listening, nothing of interest.
    Quiet,
    /// Voice started; the chunk is the first one collected.
    CollectStarted,
    Collecting,
    Rejected(Rejection),
    Detected(Detection),
    /// Input discarded; chunks left before listening resumes.
    CoolingDown { remaining: u32 },
    /// Cooldown just ended.
    Resumed,
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub step: Step,
    /// Mean squared amplitude of the chunk.
    pub energy: f64,
    /// VAD decision; `None` while cooling down.
    pub voice: Option<VadDecision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub sample_rate: u32,
    pub min_utterance_ms: u32,
    pub max_utterance_ms: u32,
    /// Chunks discarded after each record action.
    pub cooldown_chunks: u32,
}

pub struct CaptureStateMachine {
    config: MachineConfig,
    state: CaptureState,
    vad: Box<dyn VoiceActivityDetector>,
    detector: Detector,
    window: DetectionWindow,
}

impl CaptureStateMachine {
    pub fn new(config: MachineConfig, vad: Box<dyn VoiceActivityDetector>, detector: Detector) -> Self {
        let capacity = samples_for_ms(config.sample_rate, config.max_utterance_ms).max(1);
        info!(
            detector = detector.name(),
            window_samples = capacity,
            cooldown_chunks = config.cooldown_chunks,
            "capture state machine ready"
        );
        Self {
            config,
            state: CaptureState::Listening,
            vad,
            detector,
            window: DetectionWindow::with_capacity(capacity),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Feed one chunk of raw (unprocessed) samples.
    ///
    /// # Errors
    /// Only classifier failures propagate; the machine stays in `Listening`.
    pub fn on_chunk(&mut self, chunk: &[i16]) -> Result<Tick> {
        let energy = mean_energy(chunk);

        if let CaptureState::Cooldown { remaining } = self.state {
            let remaining = remaining.saturating_sub(1);
            let step = if remaining == 0 {
                self.resume();
                Step::Resumed
            } else {
                self.state = CaptureState::Cooldown { remaining };
                Step::CoolingDown { remaining }
            };
            return Ok(Tick {
                step,
                energy,
                voice: None,
            });
        }

        let decision = self.vad.classify(chunk);
        let step = if let Detector::Classifier(gate) = &mut self.detector {
            match gate.push(chunk)? {
                Some(detection) => Step::Detected(detection),
                None => Step::Quiet,
            }
        } else {
            self.advance_pattern(chunk, decision)
        };
        Ok(Tick {
            step,
            energy,
            voice: Some(decision),
        })
    }

    /// Suppress detection for the configured number of chunks.
    pub fn enter_cooldown(&mut self) {
        self.window.reset();
        if self.config.cooldown_chunks == 0 {
            self.resume();
            return;
        }
        self.state = CaptureState::Cooldown {
            remaining: self.config.cooldown_chunks,
        };
        debug!(chunks = self.config.cooldown_chunks, "cooldown started");
    }

    fn resume(&mut self) {
        self.state = CaptureState::Listening;
        self.window.reset();
        self.vad.reset();
        if let Detector::Classifier(gate) = &mut self.detector {
            gate.reset();
        }
    }

    fn advance_pattern(&mut self, chunk: &[i16], decision: VadDecision) -> Step {
        match (self.state, decision) {
            (CaptureState::Listening, VadDecision::Silence) => Step::Quiet,
            (CaptureState::Listening, VadDecision::Speech) => {
                self.window.reset();
                self.window.append(chunk);
                self.state = CaptureState::Collecting;
                debug!("voice detected, collecting");
                Step::CollectStarted
            }
            (CaptureState::Collecting, VadDecision::Speech) => {
                self.window.append(chunk);
                Step::Collecting
            }
            // The silent chunk that ends collection is not part of the candidate.
            (CaptureState::Collecting, VadDecision::Silence) => {
                let step = self.check_pattern();
                self.window.reset();
                self.state = CaptureState::Listening;
                step
            }
            (CaptureState::Cooldown { .. }, _) => Step::Quiet,
        }
    }

    fn check_pattern(&self) -> Step {
        let rate = self.config.sample_rate.max(1) as u64;
        let duration_ms = (self.window.observed() as u64 * 1000 / rate) as u32;

        if duration_ms < self.config.min_utterance_ms {
            debug!(duration_ms, "candidate too short");
            return Step::Rejected(Rejection::TooShort { duration_ms });
        }
        if duration_ms > self.config.max_utterance_ms {
            debug!(duration_ms, "candidate too long");
            return Step::Rejected(Rejection::TooLong { duration_ms });
        }

        let Detector::Pattern(matcher) = &self.detector else {
            return Step::Rejected(Rejection::NoPattern { duration_ms });
        };
        match matcher.find(self.window.samples(), self.config.sample_rate) {
            Some(found) => {
                info!(
                    duration_ms,
                    first_high = found.first_high,
                    had_pause = found.had_pause,
                    "wake pattern matched"
                );
                Step::Detected(Detection {
                    source: DetectionSource::Pattern,
                    duration_ms,
                    confidence: None,
                })
            }
            None => {
                debug!(duration_ms, "no wake pattern");
                Step::Rejected(Rejection::NoPattern { duration_ms })
            }
        }
    }
}

pub(crate) fn samples_for_ms(sample_rate: u32, ms: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierHandle, Inference, ScriptedClassifier};
    use crate::vad::{EnergyVad, EnergyVadConfig};
    use crate::wake::{GateConfig, PhraseMatcherConfig};

    const RATE: u32 = 16_000;
    const CHUNK: usize = 1_600;

    fn config() -> MachineConfig {
        MachineConfig {
            sample_rate: RATE,
            min_utterance_ms: 150,
            max_utterance_ms: 2000,
            cooldown_chunks: 3,
        }
    }

    fn pattern_machine() -> CaptureStateMachine {
        CaptureStateMachine::new(
            config(),
            Box::new(EnergyVad::new(EnergyVadConfig::default())),
            Detector::Pattern(PhraseMatcher::new(PhraseMatcherConfig::default())),
        )
    }

    fn square(amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn silence() -> Vec<i16> {
        vec![0; CHUNK]
    }

    /// 40 ms burst followed by 60 ms of silence; the VAD still calls it voice.
    fn syllable() -> Vec<i16> {
        let mut chunk = square(8_000, 640);
        chunk.resize(CHUNK, 0);
        chunk
    }

    #[test]
    fn speech_then_silence_runs_the_pattern_check() {
        let mut m = pattern_machine();
        assert_eq!(m.on_chunk(&silence()).unwrap().step, Step::Quiet);

        let first = m.on_chunk(&syllable()).unwrap();
        assert_eq!(first.step, Step::CollectStarted);
        assert_eq!(first.voice, Some(VadDecision::Speech));
        assert_eq!(m.state(), CaptureState::Collecting);

        let second = m.on_chunk(&syllable()).unwrap();
        assert_eq!(second.step, Step::Collecting);

        let end = m.on_chunk(&silence()).unwrap();
        match end.step {
            Step::Detected(d) => {
                assert_eq!(d.source, DetectionSource::Pattern);
                assert_eq!(d.duration_ms, 200);
            }
            other => panic!("expected detection, got {other:?}"),
        }
        assert_eq!(m.state(), CaptureState::Listening);
    }

    #[test]
    fn single_chunk_is_too_short() {
        let mut m = pattern_machine();
        m.on_chunk(&square(8_000, CHUNK)).unwrap();
        let end = m.on_chunk(&silence()).unwrap();
        assert_eq!(
            end.step,
            Step::Rejected(Rejection::TooShort { duration_ms: 100 })
        );
    }

    #[test]
    fn overlong_speech_is_rejected_and_window_resets() {
        let mut m = pattern_machine();
        for _ in 0..25 {
            m.on_chunk(&square(8_000, CHUNK)).unwrap();
        }
        let end = m.on_chunk(&silence()).unwrap();
        assert_eq!(
            end.step,
            Step::Rejected(Rejection::TooLong { duration_ms: 2500 })
        );
        assert!(m.window.is_empty());
        assert_eq!(m.window.observed(), 0);
    }

    #[test]
    fn cooldown_discards_input_then_resumes() {
        let mut m = pattern_machine();
        m.enter_cooldown();
        let loud = square(8_000, CHUNK);

        let t = m.on_chunk(&loud).unwrap();
        assert_eq!(t.step, Step::CoolingDown { remaining: 2 });
        assert_eq!(t.voice, None);
        assert_eq!(m.on_chunk(&loud).unwrap().step, Step::CoolingDown { remaining: 1 });
        assert_eq!(m.on_chunk(&loud).unwrap().step, Step::Resumed);
        assert_eq!(m.state(), CaptureState::Listening);

        assert_eq!(m.on_chunk(&loud).unwrap().step, Step::CollectStarted);
    }

    #[test]
    fn classifier_mode_detects_from_sliding_window() {
        let classifier = ScriptedClassifier::default().with_script(vec![Inference {
            label: 0,
            confidence: 0.95,
        }]);
        let gate = ClassifierGate::new(
            GateConfig::default(),
            ClassifierHandle::new(classifier),
            RATE,
        );
        let mut m = CaptureStateMachine::new(
            config(),
            Box::new(EnergyVad::new(EnergyVadConfig::default())),
            Detector::Classifier(gate),
        );

        let loud = square(8_000, CHUNK);
        let mut detected = None;
        for i in 0..10 {
            if let Step::Detected(d) = m.on_chunk(&loud).unwrap().step {
                detected = Some((i, d));
                break;
            }
        }
        let (index, detection) = detected.expect("classifier should accept the first window");
        assert_eq!(index, 9);
        assert_eq!(detection.source, DetectionSource::Classifier);
        assert_eq!(detection.confidence, Some(0.95));
    }
}
