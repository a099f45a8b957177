//! Energy-contour wake-phrase heuristic.
//!
//! ## Algorithm
//!
//! 1. Split the utterance into fixed chunks (40 ms) and compute each chunk's
//!    mean energy ([`EnergyProfile`]). Fewer than four chunks never match.
//! 2. Dynamic threshold = max(30 % of the peak chunk, 50 % of the static VAD
//!    threshold).
//! 3. For each start position `i` in `0..chunks-3`:
//!    - phase 1: first chunk above threshold in `i..i+3`;
//!    - pause: first chunk below 60 % of threshold in the next 4 chunks;
//!    - phase 2: any chunk above threshold in the 4 chunks after the pause.
//! 4. Accept when phase 2 is found, or when no pause was found at all
//!    (continuous speech). The first accepting position wins.

use tracing::debug;

use crate::vad::mean_energy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhraseMatcherConfig {
    pub chunk_ms: u32,
    pub min_chunks: usize,
    /// Fraction of the peak chunk energy used as the dynamic threshold.
    pub peak_fraction: f64,
    /// Static VAD threshold the floor is derived from.
    pub static_threshold: f64,
    /// The dynamic threshold never drops below this fraction of `static_threshold`.
    pub floor_fraction: f64,
    /// A pause is a chunk below this fraction of the dynamic threshold.
    pub pause_fraction: f64,
    pub phase1_span: usize,
    pub pause_span: usize,
    pub phase2_span: usize,
    /// Accept a run of speech with no pause after the first syllable.
    pub accept_without_pause: bool,
}

impl Default for PhraseMatcherConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 40,
            min_chunks: 4,
            peak_fraction: 0.3,
            static_threshold: 150_000.0,
            floor_fraction: 0.5,
            pause_fraction: 0.6,
            phase1_span: 3,
            pause_span: 4,
            phase2_span: 4,
            accept_without_pause: true,
        }
    }
}

/// Per-chunk mean energies of one utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyProfile {
    energies: Vec<f64>,
    peak: f64,
}

impl EnergyProfile {
    /// Partition `samples` into whole chunks of `chunk_len`; a trailing partial
    /// chunk is ignored.
    pub fn compute(samples: &[i16], chunk_len: usize) -> Self {
        let energies: Vec<f64> = if chunk_len == 0 {
            Vec::new()
        } else {
            samples.chunks_exact(chunk_len).map(mean_energy).collect()
        };
        let peak = energies.iter().copied().fold(0.0, f64::max);
        Self { energies, peak }
    }

    pub fn energies(&self) -> &[f64] {
        &self.energies
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn len(&self) -> usize {
        self.energies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.energies.is_empty()
    }
}

/// Where the heuristic accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    /// Chunk index of the first syllable.
    pub first_high: usize,
    /// Whether a dip was found between the syllables.
    pub had_pause: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PhraseMatcher {
    config: PhraseMatcherConfig,
}

impl PhraseMatcher {
    pub fn new(config: PhraseMatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PhraseMatcherConfig {
        &self.config
    }

    pub fn chunk_len(&self, sample_rate: u32) -> usize {
        (sample_rate as usize * self.config.chunk_ms as usize) / 1000
    }

    pub fn dynamic_threshold(&self, profile: &EnergyProfile) -> f64 {
        let floor = self.config.static_threshold * self.config.floor_fraction;
        (profile.peak() * self.config.peak_fraction).max(floor)
    }

    /// Search `samples` for the wake-phrase contour.
    pub fn find(&self, samples: &[i16], sample_rate: u32) -> Option<PatternMatch> {
        let profile = EnergyProfile::compute(samples, self.chunk_len(sample_rate));
        if profile.len() < self.config.min_chunks {
            debug!(chunks = profile.len(), "utterance too short for pattern");
            return None;
        }
        let threshold = self.dynamic_threshold(&profile);
        debug!(threshold, peak = profile.peak(), "pattern dynamic threshold");
        self.scan(&profile, threshold)
    }

    pub fn matches(&self, samples: &[i16], sample_rate: u32) -> bool {
        self.find(samples, sample_rate).is_some()
    }

    fn scan(&self, profile: &EnergyProfile, threshold: f64) -> Option<PatternMatch> {
        let e = profile.energies();
        let n = e.len();
        let c = &self.config;
        let pause_level = threshold * c.pause_fraction;

        for i in 0..n.saturating_sub(3) {
            let Some(first_high) = (i..(i + c.phase1_span).min(n)).find(|&j| e[j] > threshold)
            else {
                continue;
            };

            let pause = ((first_high + 1)..(first_high + 1 + c.pause_span).min(n))
                .find(|&j| e[j] < pause_level);
            let pause_end = pause.unwrap_or(first_high + 1);

            let second = ((pause_end + 1)..(pause_end + 1 + c.phase2_span).min(n))
                .any(|j| e[j] > threshold);

            let had_pause = pause.is_some();
            if second || (!had_pause && c.accept_without_pause) {
                debug!(first_high, had_pause, "wake pattern matched");
                return Some(PatternMatch {
                    first_high,
                    had_pause,
                });
            }
        }
        None
    }
}
