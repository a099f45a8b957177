//! Energy-based VAD with an amplitude-density check.
//!
//! ## Algorithm
//!
//! 1. Compute the mean squared amplitude of the chunk.
//! 2. Count samples whose magnitude exceeds `amplitude_floor`.
//! 3. Emit `Speech` when energy > `energy_threshold` **and** more than
//!    `1 / density_divisor` of the samples are loud.
//!
//! The density check rejects short clicks that carry a lot of energy in a
//! handful of samples. Zero-crossing rate is logged alongside each decision
//! but never changes it.

use super::{VadDecision, VoiceActivityDetector};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyVadConfig {
    /// Mean-squared energy a chunk must exceed.
    pub energy_threshold: f64,
    /// Magnitude above which a sample counts as loud.
    pub amplitude_floor: i16,
    /// More than `len / density_divisor` samples must be loud.
    pub density_divisor: usize,
    /// Emit a diagnostic line every N classifications (0 disables).
    pub log_every: u64,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 150_000.0,
            amplitude_floor: 800,
            density_divisor: 7,
            log_every: 20,
        }
    }
}

/// A stateless energy detector. The only state is a call counter used to
/// throttle diagnostics.
#[derive(Debug, Clone, Default)]
pub struct EnergyVad {
    config: EnergyVadConfig,
    calls: u64,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self { config, calls: 0 }
    }

    pub fn config(&self) -> &EnergyVadConfig {
        &self.config
    }

    /// The pure decision, without touching the diagnostic counter.
    pub fn decide(&self, samples: &[i16]) -> VadDecision {
        if samples.is_empty() {
            return VadDecision::Silence;
        }
        let energy = mean_energy(samples);
        let floor = i32::from(self.config.amplitude_floor);
        let loud = samples.iter().filter(|&&s| i32::from(s).abs() > floor).count();
        let divisor = self.config.density_divisor.max(1);

        if energy > self.config.energy_threshold && loud > samples.len() / divisor {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, samples: &[i16]) -> VadDecision {
        let decision = self.decide(samples);
        self.calls += 1;

        if self.config.log_every > 0 && self.calls % self.config.log_every == 0 {
            debug!(
                call = self.calls,
                energy = mean_energy(samples),
                zcr = zero_crossing_rate(samples),
                speech = decision.is_speech(),
                "vad diagnostics"
            );
        }
        decision
    }

    fn reset(&mut self) {
        self.calls = 0;
    }
}

/// Mean of squared samples. Zero for an empty slice.
pub fn mean_energy(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    sum / samples.len() as f64
}

/// Fraction of adjacent sample pairs whose sign differs.
pub fn zero_crossing_rate(samples: &[i16]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0) != (w[1] >= 0))
        .count();
    crossings as f32 / (samples.len() - 1) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f32 / 16_000.0;
                (amplitude * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn loud_sine_is_speech() {
        // A = 1000: A²/2 = 500 000 > 150 000, and most samples exceed 800.
        let mut vad = EnergyVad::default();
        assert_eq!(vad.classify(&sine(1000.0, 1600)), VadDecision::Speech);
    }

    #[test]
    fn quiet_sine_is_silence() {
        // A = 500: A²/2 = 125 000, below the threshold.
        let mut vad = EnergyVad::default();
        assert_eq!(vad.classify(&sine(500.0, 1600)), VadDecision::Silence);
    }

    #[test]
    fn zeros_of_any_length_are_silence() {
        let mut vad = EnergyVad::default();
        for len in [0, 1, 7, 160, 1600, 16_000] {
            assert_eq!(vad.classify(&vec![0; len]), VadDecision::Silence, "len={len}");
        }
    }

    #[test]
    fn sparse_click_fails_density_check() {
        // One huge sample in 1600: high energy, but too few loud samples.
        let mut samples = vec![0i16; 1600];
        samples[10] = i16::MAX;
        samples[11] = i16::MIN;
        assert!(mean_energy(&samples) > 150_000.0);
        assert_eq!(EnergyVad::default().decide(&samples), VadDecision::Silence);
    }

    #[test]
    fn zcr_of_alternating_signal_is_one() {
        let samples: Vec<i16> = (0..100).map(|i| if i % 2 == 0 { 5 } else { -5 }).collect();
        assert!((zero_crossing_rate(&samples) - 1.0).abs() < 1e-6);
        assert_eq!(zero_crossing_rate(&[3]), 0.0);
    }
}
