//! The record → preprocess → upload → reply sequence run after a detection.
//!
//! Runs synchronously on the pipeline thread. The recording buffer is
//! allocated here, owned here, and dropped before returning; nothing from the
//! detection window is reused.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::{
    audio::{preprocess, Preprocessor, SampleSink, SampleSource},
    buffering::SampleBuffer,
    engine::{state::samples_for_ms, EngineConfig},
    error::{Result, WakeError},
    ipc::events::EngineStatus,
    transport::{download_and_play, upload, ResponseBuffer, ServiceReply, Transport, UploadTarget},
    vad::mean_energy,
};

/// What one exchange produced.
#[derive(Debug, Clone, Default)]
pub struct ExchangeReport {
    pub upload_status: Option<u16>,
    pub reply: ServiceReply,
    pub reply_audio_played: bool,
    /// Reply audio was wanted but could not be fetched or played.
    pub playback_error: Option<String>,
    /// The source ran dry during recording; the tail was left silent.
    pub input_ended: bool,
}

/// Record, upload and handle the reply.
///
/// `on_status` is called as the exchange moves through its phases.
///
/// # Errors
/// Recording failures and every upload failure. Reply playback failures are
/// reported in [`ExchangeReport::playback_error`] instead.
pub fn run_exchange(
    config: &EngineConfig,
    source: &mut dyn SampleSource,
    sink: &mut dyn SampleSink,
    transport: &dyn Transport,
    on_status: &mut dyn FnMut(EngineStatus),
) -> Result<ExchangeReport> {
    let mut report = ExchangeReport::default();

    on_status(EngineStatus::Recording);
    let (mut recording, input_ended) = record(config, source)?;
    report.input_ended = input_ended;

    let samples = recording.samples_mut();
    let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    info!(
        energy = mean_energy(samples),
        rms = preprocess::rms(samples),
        peak,
        "recorded utterance"
    );
    let processed = Preprocessor::new(config.preprocess).process(samples);
    debug!(
        gated = processed.gated,
        rms_before_gain = processed.rms_before_gain,
        gain = processed.gain,
        "preprocessed utterance"
    );

    on_status(EngineStatus::Uploading);
    let mut response = ResponseBuffer::with_capacity(config.upload.max_response_bytes + 1);
    let target = UploadTarget {
        url: &config.endpoints.upload_url,
        api_key: &config.api_key,
        location: config.location.as_ref(),
    };
    let outcome = upload(transport, &target, &recording, &mut response, &config.upload)?;
    drop(recording);
    report.upload_status = Some(outcome.status);

    report.reply = ServiceReply::parse(&response.text());
    if let Some(text) = report.reply.stt_text.as_deref() {
        info!(transcript = text, "service transcript");
    }
    for line in report.reply.reply_lines() {
        info!(line, "reply");
    }

    let wants_audio = report.reply.tts_available() || config.always_fetch_reply_audio;
    let url = config.endpoints.reply_audio_url.as_str();
    if wants_audio && !url.is_empty() {
        on_status(EngineStatus::Playing);
        match download_and_play(transport, url, sink, &config.download) {
            Ok(bytes) => {
                info!(bytes, "reply audio played");
                report.reply_audio_played = true;
            }
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "reply audio failed");
                report.playback_error = Some(e.to_string());
            }
        }
    } else if wants_audio {
        debug!("reply audio available but no download URL configured");
    }

    Ok(report)
}

/// Fill a freshly allocated buffer of the configured record length.
fn record(config: &EngineConfig, source: &mut dyn SampleSource) -> Result<(SampleBuffer, bool)> {
    let len = samples_for_ms(config.sample_rate, config.record_ms);
    let mut buffer = SampleBuffer::zeroed(len, config.sample_rate)?;
    source.discard_pending();

    let started = Instant::now();
    let deadline = Duration::from_millis(config.record_ms as u64) * 2 + config.read_timeout;
    let mut filled = 0;
    let mut input_ended = false;
    {
        let samples = buffer.samples_mut();
        while filled < samples.len() {
            match source.read(&mut samples[filled..], config.read_timeout) {
                Ok(0) => {
                    if started.elapsed() > deadline {
                        return Err(WakeError::AudioStream(format!(
                            "recording stalled after {filled} of {len} samples"
                        )));
                    }
                }
                Ok(n) => filled += n,
                Err(WakeError::SourceExhausted) => {
                    input_ended = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
    }
    if input_ended && filled == 0 {
        return Err(WakeError::SourceExhausted);
    }
    debug!(
        filled,
        len,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "recording complete"
    );
    Ok((buffer, input_ended))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::WavFileSource;
    use crate::container;
    use crate::transport::testing::ScriptedTransport;

    struct Recorder(Vec<usize>);

    impl SampleSink for Recorder {
        fn play(&mut self, samples: &[i16], _sample_rate: u32) -> Result<()> {
            self.0.push(samples.len());
            Ok(())
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig {
            sample_rate: 1_000,
            record_ms: 500,
            ..EngineConfig::default()
        };
        config.endpoints.upload_url = "http://svc/upload".into();
        config.endpoints.reply_audio_url = String::new();
        config.upload.inter_chunk_delay = Duration::ZERO;
        config.upload.retry_delay = Duration::ZERO;
        config
    }

    fn loud_source(len: usize) -> WavFileSource {
        WavFileSource::from_samples(vec![2_000; len], 1_000)
    }

    #[test]
    fn uploads_recording_and_parses_reply() {
        let transport = ScriptedTransport::responding(
            200,
            br#"{"stt_text":"what time","ai_reply":"noon","tts_saved":false}"#,
        );
        let mut source = loud_source(2_000);
        let mut sink = Recorder(Vec::new());
        let mut statuses = Vec::new();

        let report = run_exchange(&config(), &mut source, &mut sink, &transport, &mut |s: EngineStatus| {
            statuses.push(s)
        })
        .unwrap();

        assert_eq!(report.upload_status, Some(200));
        assert_eq!(report.reply.stt_text.as_deref(), Some("what time"));
        assert!(!report.reply_audio_played);
        assert!(!report.input_ended);
        assert_eq!(statuses, vec![EngineStatus::Recording, EngineStatus::Uploading]);

        let rec = transport.record.lock();
        assert_eq!(rec.body.len(), container::HEADER_LEN + 1_000);
        let header = container::validate(&rec.body).unwrap();
        assert_eq!(header.sample_rate, 1_000);
        assert_eq!(source.remaining(), 1_500);
    }

    #[test]
    fn short_input_is_padded_and_flagged() {
        let transport = ScriptedTransport::responding(200, b"{}");
        let mut source = loud_source(200);
        let report = run_exchange(
            &config(),
            &mut source,
            &mut Recorder(Vec::new()),
            &transport,
            &mut |_| {},
        )
        .unwrap();
        assert!(report.input_ended);
        assert_eq!(
            transport.record.lock().body.len(),
            container::HEADER_LEN + 1_000
        );
    }

    #[test]
    fn upload_failure_propagates() {
        let transport = ScriptedTransport::responding(500, b"boom");
        let err = run_exchange(
            &config(),
            &mut loud_source(2_000),
            &mut Recorder(Vec::new()),
            &transport,
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, WakeError::HttpStatus(500)));
    }

    #[test]
    fn reply_audio_failure_is_reported_not_raised() {
        let transport = ScriptedTransport::responding(200, br#"{"tts_saved":true}"#);
        let mut cfg = config();
        cfg.endpoints.reply_audio_url = "http://svc/voice.wav".into();
        let mut sink = Recorder(Vec::new());

        let report = run_exchange(
            &cfg,
            &mut loud_source(2_000),
            &mut sink,
            &transport,
            &mut |_| {},
        )
        .unwrap();
        // The scripted transport answers the GET with the JSON body, which is
        // not a valid container.
        assert!(!report.reply_audio_played);
        assert!(report.playback_error.is_some());
        assert!(sink.0.is_empty());
    }
}
