//! Sample sources and sinks.
//!
//! The engine only sees two blocking seams: [`SampleSource`] (read a chunk of
//! mono i16 samples with a timeout) and [`SampleSink`] (play a buffer to
//! completion). Microphone capture, WAV replay and speaker playback are
//! implementations of those seams.
//!
//! # Capture design constraints
//!
//! The cpal input callback runs on an OS audio thread. It must not allocate
//! after warm-up, block, or perform I/O. It mixes to mono and pushes f32
//! frames into an SPSC ring whose `push_slice` is lock-free; rate conversion
//! and quantisation to i16 happen on the reading side in [`CaptureSource`].
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. `AudioCapture`, `CaptureSource`
//! and `SpeakerSink` therefore must be created and dropped on the same thread;
//! the engine opens them inside its `spawn_blocking` worker.

pub mod device;
pub mod playback;
pub mod preprocess;
pub mod resample;
pub mod wav_file;

pub use playback::SpeakerSink;
pub use preprocess::{PreprocessConfig, PreprocessReport, Preprocessor};
pub use resample::RateConverter;
pub use wav_file::WavFileSource;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use crate::{
    buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer},
    error::{Result, WakeError},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Blocking source of mono signed 16-bit samples at a fixed rate.
pub trait SampleSource {
    /// Fill up to `buf.len()` samples, waiting at most `timeout`.
    ///
    /// Returns the number of samples written. `Ok(0)` means nothing arrived
    /// in time; end of input is `Err(WakeError::SourceExhausted)`.
    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize>;

    fn sample_rate(&self) -> u32;

    /// Drop audio buffered while the caller was not reading.
    fn discard_pending(&mut self) {}
}

/// Blocking sink for mono signed 16-bit samples.
pub trait SampleSink {
    /// Play `samples` recorded at `sample_rate`, returning once playback has
    /// finished or failed.
    fn play(&mut self, samples: &[i16], sample_rate: u32) -> Result<()>;
}

/// Sink that discards everything. Used when no speaker is configured.
#[derive(Debug, Default)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn play(&mut self, samples: &[i16], sample_rate: u32) -> Result<()> {
        tracing::debug!(len = samples.len(), sample_rate, "no speaker, dropping reply audio");
        Ok(())
    }
}

/// Handle to an active audio capture stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available device.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use crate::buffering::Producer;
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let device = device::select_device(
            preferred_device_name,
            || host.input_devices(),
            host.default_input_device(),
            "input",
        )
        .ok_or(WakeError::NoDefaultInputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| WakeError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ch = channels.max(1) as usize;
        let flag = Arc::clone(&running);
        // Mono mix buffer sized for a generous callback; grows at most once.
        let mut mix: Vec<f32> = Vec::with_capacity(8192);
        let mut push_mono = move |frames: usize, sample_at: &dyn Fn(usize) -> f32| {
            if !flag.load(Ordering::Relaxed) {
                return;
            }
            mix.clear();
            for f in 0..frames {
                let base = f * ch;
                let sum: f32 = (0..ch).map(|c| sample_at(base + c)).sum();
                mix.push(sum / ch as f32);
            }
            let written = producer.push_slice(&mix);
            if written < mix.len() {
                warn!("capture ring full: dropped {} frames", mix.len() - written);
            }
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _info| push_mono(data.len() / ch, &|i| data[i]),
                |err| error!("audio stream error: {err}"),
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    push_mono(data.len() / ch, &|i| resample::i16_to_f32(data[i]))
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            SampleFormat::U8 => device.build_input_stream(
                &config,
                move |data: &[u8], _info| {
                    push_mono(data.len() / ch, &|i| (data[i] as f32 - 128.0) / 128.0)
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            fmt => {
                return Err(WakeError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| WakeError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| WakeError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(WakeError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Microphone as a [`SampleSource`]: drains the capture ring, converts to
/// the engine rate and quantises to i16.
pub struct CaptureSource {
    capture: AudioCapture,
    consumer: AudioConsumer,
    converter: RateConverter,
    target_rate: u32,
    raw: Vec<f32>,
    converted: Vec<f32>,
    /// Read position in `converted`.
    cursor: usize,
}

impl CaptureSource {
    /// Open the preferred (or default) microphone delivering `target_rate`.
    pub fn open(preferred_device_name: Option<&str>, target_rate: u32) -> Result<Self> {
        let (producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let capture = AudioCapture::open_with_preference(producer, running, preferred_device_name)?;
        let block = (capture.sample_rate as usize / 50).max(64);
        let converter = RateConverter::new(capture.sample_rate, target_rate, block)?;
        Ok(Self {
            capture,
            consumer,
            converter,
            target_rate,
            raw: vec![0.0; 4096],
            converted: Vec::new(),
            cursor: 0,
        })
    }

    fn buffered(&self) -> usize {
        self.converted.len() - self.cursor
    }

    fn drain_ring(&mut self) {
        if self.cursor > 0 {
            self.converted.drain(..self.cursor);
            self.cursor = 0;
        }
        loop {
            let n = self.consumer.pop_slice(&mut self.raw);
            if n == 0 {
                break;
            }
            self.converter
                .process_into(&self.raw[..n], &mut self.converted);
        }
    }
}

impl SampleSource for CaptureSource {
    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.buffered() < buf.len() {
                self.drain_ring();
            }
            if self.buffered() >= buf.len() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let n = self.buffered().min(buf.len());
        for (dst, &src) in buf[..n]
            .iter_mut()
            .zip(&self.converted[self.cursor..self.cursor + n])
        {
            *dst = resample::f32_to_i16(src);
        }
        self.cursor += n;
        Ok(n)
    }

    fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    fn discard_pending(&mut self) {
        self.consumer.clear();
        self.converted.clear();
        self.cursor = 0;
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.capture.stop();
    }
}
