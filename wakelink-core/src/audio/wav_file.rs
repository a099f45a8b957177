//! WAV replay as a [`SampleSource`].
//!
//! Decodes the whole file up front (mono-mixed, converted to the requested
//! rate) and hands it out chunk by chunk. Used for `--replay` and the offline
//! bench.

use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::audio::resample::{f32_to_i16, i16_to_f32, RateConverter};
use crate::audio::SampleSource;
use crate::error::{Result, WakeError};

#[derive(Debug, Clone)]
pub struct WavFileSource {
    samples: Vec<i16>,
    position: usize,
    sample_rate: u32,
}

impl WavFileSource {
    /// Load `path`, converting to mono at `target_rate`.
    pub fn open(path: impl AsRef<Path>, target_rate: u32) -> Result<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)
            .map_err(|e| WakeError::AudioDevice(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        let mono = decode_mono(reader)?;
        let samples: Vec<i16> = if spec.sample_rate == target_rate {
            mono.into_iter().map(f32_to_i16).collect()
        } else {
            RateConverter::convert_all(spec.sample_rate, target_rate, &mono)?
                .into_iter()
                .map(f32_to_i16)
                .collect()
        };

        info!(
            file = %path.display(),
            source_rate = spec.sample_rate,
            channels = spec.channels,
            samples = samples.len(),
            "replay source loaded"
        );
        Ok(Self::from_samples(samples, target_rate))
    }

    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            position: 0,
            sample_rate,
        }
    }

    pub fn remaining(&self) -> usize {
        self.samples.len() - self.position
    }
}

fn decode_mono<R: std::io::Read>(mut reader: hound::WavReader<R>) -> Result<Vec<f32>> {
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let decode_err = |e: hound::Error| WakeError::AudioDevice(format!("wav decode: {e}"));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(decode_err)?,
        hound::SampleFormat::Int if spec.bits_per_sample == 16 => reader
            .samples::<i16>()
            .map(|s| s.map(i16_to_f32))
            .collect::<std::result::Result<_, _>>()
            .map_err(decode_err)?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(decode_err)?
        }
    };

    Ok(interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect())
}

impl SampleSource for WavFileSource {
    fn read(&mut self, buf: &mut [i16], _timeout: Duration) -> Result<usize> {
        if self.remaining() == 0 {
            return Err(WakeError::SourceExhausted);
        }
        let n = self.remaining().min(buf.len());
        buf[..n].copy_from_slice(&self.samples[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_in_chunks_then_reports_exhaustion() {
        let mut src = WavFileSource::from_samples((0..250).collect(), 16_000);
        let mut buf = [0i16; 100];
        assert_eq!(src.read(&mut buf, Duration::ZERO).unwrap(), 100);
        assert_eq!(src.read(&mut buf, Duration::ZERO).unwrap(), 100);
        assert_eq!(src.read(&mut buf, Duration::ZERO).unwrap(), 50);
        assert_eq!(buf[49], 249);
        assert!(matches!(
            src.read(&mut buf, Duration::ZERO),
            Err(WakeError::SourceExhausted)
        ));
    }

    #[test]
    fn stereo_file_is_mixed_to_mono() {
        let dir = std::env::temp_dir().join(format!("wakelink-wav-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..160 {
            writer.write_sample(1000i16).unwrap();
            writer.write_sample(3000i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut src = WavFileSource::open(&path, 16_000).unwrap();
        assert_eq!(src.remaining(), 160);
        let mut buf = [0i16; 160];
        src.read(&mut buf, Duration::ZERO).unwrap();
        assert!(buf.iter().all(|&s| s == 2000), "first={}", buf[0]);
        std::fs::remove_dir_all(&dir).ok();
    }
}
