//! Fixed-length mono PCM buffer handed between pipeline stages by value.

use crate::error::{Result, WakeError};

/// A block of signed 16-bit mono samples at a known sample rate.
///
/// The length is fixed at allocation. Stages mutate samples in place
/// (see [`crate::audio::preprocess`]) and pass the buffer on by value, so
/// exactly one stage owns it at any time.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Allocate a zeroed buffer of `len` samples.
    ///
    /// Allocation is fallible: on a constrained device the record buffer is
    /// the single largest allocation and failure must not abort the process.
    pub fn zeroed(len: usize, sample_rate: u32) -> Result<Self> {
        let mut samples = Vec::new();
        samples
            .try_reserve_exact(len)
            .map_err(|_| WakeError::ResourceExhausted {
                purpose: "sample buffer",
                bytes: len * std::mem::size_of::<i16>(),
            })?;
        samples.resize(len, 0);
        Ok(Self {
            samples,
            sample_rate,
        })
    }

    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }

    /// Size of the PCM payload in bytes (two bytes per sample).
    pub fn payload_bytes(&self) -> usize {
        self.samples.len() * 2
    }

    /// Returns the duration of this buffer in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
