//! Sample-rate conversion between device rates and the engine rate.
//!
//! Capture devices usually run at 44.1 or 48 kHz while the detector and the
//! upload format are fixed at the engine rate (16 kHz); reply audio arrives at
//! whatever rate the service synthesised and must be converted to the output
//! device's rate. `RateConverter` wraps a rubato `FastFixedIn` for both
//! directions and is a plain copy when the rates already agree.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{Result, WakeError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when both rates are equal.
    resampler: Option<FastFixedIn<f32>>,
    /// Input held back until a full rubato block is available.
    pending: Vec<f32>,
    chunk_size: usize,
    ratio: f64,
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// Returns `WakeError::AudioDevice` if rubato rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        let ratio = to_rate as f64 / from_rate.max(1) as f64;
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                ratio,
                output_buf: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| WakeError::AudioDevice(format!("resampler init: {e}")))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        debug!(from_rate, to_rate, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            chunk_size,
            ratio,
            output_buf,
        })
    }

    /// Convert as many whole blocks as are available, appending to `out`.
    /// A remainder shorter than one block is kept for the next call.
    pub fn process_into(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(samples);
            return;
        };

        self.pending.extend_from_slice(samples);
        let mut offset = 0;
        while self.pending.len() - offset >= self.chunk_size {
            let block = &self.pending[offset..offset + self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            offset += self.chunk_size;
        }
        self.pending.drain(..offset);
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        self.process_into(samples, &mut out);
        out
    }

    /// Flush the held-back remainder by zero-padding it to one block, keeping
    /// only the output that corresponds to real input.
    pub fn finish(&mut self, out: &mut Vec<f32>) {
        if self.pending.is_empty() || self.resampler.is_none() {
            self.pending.clear();
            return;
        }
        let real = self.pending.len();
        self.pending.resize(self.chunk_size, 0.0);
        let before = out.len();
        let padded = std::mem::take(&mut self.pending);
        self.process_into(&padded, out);
        let keep = (real as f64 * self.ratio).round() as usize;
        out.truncate(before + keep.min(out.len() - before));
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Convert a whole buffer in one go.
    pub fn convert_all(from_rate: u32, to_rate: u32, samples: &[f32]) -> Result<Vec<f32>> {
        let mut rc = Self::new(from_rate, to_rate, 1024)?;
        let mut out = Vec::with_capacity((samples.len() as f64 * rc.ratio) as usize + 1);
        rc.process_into(samples, &mut out);
        rc.finish(&mut out);
        Ok(out)
    }
}

/// `i16` PCM to `f32` in `-1.0..1.0`.
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// `f32` in `-1.0..1.0` to saturating `i16` PCM.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}
