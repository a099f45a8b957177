//! Speaker output as a [`SampleSink`].
//!
//! Each `play` call builds a fresh cpal output stream fed from a shared
//! sample buffer, then blocks until the callback reports the buffer consumed
//! or the expected duration plus a grace period has passed.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crate::audio::SampleSink;
#[cfg(feature = "audio-cpal")]
use crate::audio::{device, resample};
use crate::error::{Result, WakeError};

/// Extra wait beyond the nominal playback duration.
const PLAYBACK_GRACE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Plays mono i16 buffers on an output device.
///
/// **Not `Send`** when built with `audio-cpal`; create it on the thread that
/// plays through it.
pub struct SpeakerSink {
    #[cfg(feature = "audio-cpal")]
    device: cpal::Device,
    #[cfg(feature = "audio-cpal")]
    config: cpal::StreamConfig,
    #[cfg(feature = "audio-cpal")]
    format: cpal::SampleFormat,
    played: u64,
}

/// Cursor shared with the output callback.
struct PlaybackState {
    samples: Vec<f32>,
    position: AtomicUsize,
    finished: AtomicBool,
}

impl PlaybackState {
    fn new(samples: Vec<f32>) -> Arc<Self> {
        Arc::new(Self {
            samples,
            position: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        })
    }

    /// Next sample, or silence once the buffer is exhausted.
    fn next(&self) -> f32 {
        let pos = self.position.load(Ordering::Relaxed);
        match self.samples.get(pos) {
            Some(&s) => {
                self.position.store(pos + 1, Ordering::Relaxed);
                s
            }
            None => {
                self.finished.store(true, Ordering::Release);
                0.0
            }
        }
    }

    fn wait(&self, nominal: Duration) {
        let deadline = Instant::now() + nominal + PLAYBACK_GRACE;
        while !self.finished.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                tracing::warn!("playback did not report completion in time");
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(feature = "audio-cpal")]
impl SpeakerSink {
    /// Open the preferred (or default) output device.
    pub fn open(preferred_device_name: Option<&str>) -> Result<Self> {
        use cpal::traits::{DeviceTrait, HostTrait};

        let host = cpal::default_host();
        let device = device::select_device(
            preferred_device_name,
            || host.output_devices(),
            host.default_output_device(),
            "output",
        )
        .ok_or(WakeError::NoDefaultOutputDevice)?;

        let supported = device
            .default_output_config()
            .map_err(|e| WakeError::AudioDevice(e.to_string()))?;
        let format = supported.sample_format();
        let config = supported.config();

        tracing::info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "output device opened"
        );

        Ok(Self {
            device,
            config,
            format,
            played: 0,
        })
    }

    fn build_stream(&self, state: Arc<PlaybackState>) -> Result<cpal::Stream> {
        use cpal::traits::DeviceTrait;

        let channels = self.config.channels.max(1) as usize;
        let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "audio playback error");

        let stream = match self.format {
            cpal::SampleFormat::F32 => self.device.build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        frame.fill(state.next());
                    }
                },
                on_error,
                None,
            ),
            cpal::SampleFormat::I16 => self.device.build_output_stream(
                &self.config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        frame.fill(resample::f32_to_i16(state.next()));
                    }
                },
                on_error,
                None,
            ),
            fmt => {
                return Err(WakeError::AudioStream(format!(
                    "unsupported output format: {fmt:?}"
                )))
            }
        };
        stream.map_err(|e| WakeError::AudioStream(e.to_string()))
    }
}

#[cfg(feature = "audio-cpal")]
impl SampleSink for SpeakerSink {
    fn play(&mut self, samples: &[i16], sample_rate: u32) -> Result<()> {
        use cpal::traits::StreamTrait;

        if samples.is_empty() {
            return Ok(());
        }
        let device_rate = self.config.sample_rate.0;
        let as_f32: Vec<f32> = samples.iter().map(|&s| resample::i16_to_f32(s)).collect();
        let converted = resample::RateConverter::convert_all(sample_rate, device_rate, &as_f32)?;
        let nominal = Duration::from_millis(converted.len() as u64 * 1000 / device_rate as u64);

        let state = PlaybackState::new(converted);
        let stream = self.build_stream(Arc::clone(&state))?;
        stream
            .play()
            .map_err(|e| WakeError::AudioStream(e.to_string()))?;
        state.wait(nominal);
        drop(stream);

        self.played += 1;
        tracing::debug!(
            samples = samples.len(),
            sample_rate,
            device_rate,
            played = self.played,
            "playback complete"
        );
        Ok(())
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl SpeakerSink {
    pub fn open(_preferred_device_name: Option<&str>) -> Result<Self> {
        Err(WakeError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl SampleSink for SpeakerSink {
    fn play(&mut self, _samples: &[i16], _sample_rate: u32) -> Result<()> {
        self.played += 1;
        Err(WakeError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_reports_finished_after_last_sample() {
        let state = PlaybackState::new(vec![0.25, -0.25]);
        assert_eq!(state.next(), 0.25);
        assert_eq!(state.next(), -0.25);
        assert!(!state.finished.load(Ordering::Acquire));
        assert_eq!(state.next(), 0.0);
        assert!(state.finished.load(Ordering::Acquire));
        // Already finished: returns immediately.
        state.wait(Duration::from_secs(60));
    }
}
