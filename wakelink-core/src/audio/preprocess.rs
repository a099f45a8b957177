//! In-place conditioning of a recorded utterance before upload.
//!
//! Order matters: DC removal first so the gate sees true silence, then the
//! gate, then gain so gated samples stay at zero.

use tracing::debug;

/// Tunables for [`Preprocessor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessConfig {
    /// One-pole high-pass coefficient. 0.99 is roughly a 20 Hz cutoff at 16 kHz.
    pub high_pass_alpha: f32,
    /// Samples with magnitude below this are zeroed.
    pub gate_threshold: i16,
    /// Target RMS for automatic gain (about a quarter of full scale).
    pub target_rms: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    /// At or below this RMS the buffer is treated as near-silent.
    pub quiet_rms: f32,
    /// Gain applied to near-silent buffers instead of dividing by their RMS.
    pub quiet_gain: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            high_pass_alpha: 0.99,
            gate_threshold: 50,
            target_rms: 8192.0,
            min_gain: 1.0,
            max_gain: 8.0,
            quiet_rms: 100.0,
            quiet_gain: 4.0,
        }
    }
}

/// Summary of one [`Preprocessor::process`] pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessReport {
    pub gated: usize,
    pub rms_before_gain: f32,
    pub gain: f32,
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Run high-pass, gate and gain over `samples`.
    pub fn process(&self, samples: &mut [i16]) -> PreprocessReport {
        high_pass(samples, self.config.high_pass_alpha);
        let gated = noise_gate(samples, self.config.gate_threshold);
        let rms_before_gain = rms(samples);
        let gain = self.compute_gain(rms_before_gain);
        apply_gain(samples, gain);

        debug!(
            gated,
            rms = rms_before_gain,
            gain,
            len = samples.len(),
            "preprocessed utterance"
        );

        PreprocessReport {
            gated,
            rms_before_gain,
            gain,
        }
    }

    pub fn compute_gain(&self, rms: f32) -> f32 {
        let c = &self.config;
        if rms <= c.quiet_rms {
            return c.quiet_gain;
        }
        (c.target_rms / rms).clamp(c.min_gain, c.max_gain)
    }
}

/// `y[i] = α·(y[i-1] + x[i] − x[i-1])`, starting from zero state.
pub fn high_pass(samples: &mut [i16], alpha: f32) {
    let mut prev_x = 0f32;
    let mut prev_y = 0f32;
    for s in samples.iter_mut() {
        let x = f32::from(*s);
        let y = alpha * (prev_y + x - prev_x);
        prev_x = x;
        prev_y = y;
        *s = clip(y);
    }
}

/// Zero every sample whose magnitude is below `threshold`.
/// Returns how many samples were zeroed.
pub fn noise_gate(samples: &mut [i16], threshold: i16) -> usize {
    let threshold = i32::from(threshold);
    let mut gated = 0;
    for s in samples.iter_mut() {
        if i32::from(*s).abs() < threshold && *s != 0 {
            *s = 0;
            gated += 1;
        }
    }
    gated
}

pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Multiply by `gain`, saturating at the i16 range.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    for s in samples.iter_mut() {
        *s = clip(f32::from(*s) * gain);
    }
}

fn clip(v: f32) -> i16 {
    v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
