//! Blocking pipeline loop.
//!
//! ## Pipeline stages (per iteration)
//!
//! ```text
//! 1. Read one fixed-size chunk from the SampleSource
//! 2. CaptureStateMachine::on_chunk → VAD + detector step
//! 3. Broadcast AudioActivityEvent
//! 4. On detection: WakeEvent, then run_exchange synchronously
//!    (record → preprocess → upload → reply audio), ExchangeEvent
//! 5. Enter cooldown, drop audio buffered during the exchange
//! ```
//!
//! This entire loop runs in `spawn_blocking`. Any exchange failure returns the
//! loop to listening via cooldown; only the source ending or failing
//! repeatedly stops it.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    audio::{SampleSink, SampleSource},
    engine::{
        exchange::run_exchange,
        state::{CaptureStateMachine, Rejection, Step},
        EngineConfig,
    },
    error::{Result, WakeError},
    ipc::events::{
        AudioActivityEvent, EngineStatus, EngineStatusEvent, ExchangeEvent, WakeEvent,
    },
    transport::Transport,
    wake::Detection,
};

/// Consecutive read errors tolerated before the pipeline gives up.
const MAX_READ_ERRORS: usize = 10;
/// Every Nth chunk gets a level line in the debug log.
const LEVEL_LOG_EVERY: u64 = 50;

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub chunks_read: AtomicUsize,
    pub read_timeouts: AtomicUsize,
    pub read_errors: AtomicUsize,
    pub vad_speech: AtomicUsize,
    pub candidates: AtomicUsize,
    pub rejected_short: AtomicUsize,
    pub rejected_long: AtomicUsize,
    pub rejected_pattern: AtomicUsize,
    pub classifier_errors: AtomicUsize,
    pub detections: AtomicUsize,
    pub exchanges_ok: AtomicUsize,
    pub exchanges_failed: AtomicUsize,
    pub replies_played: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            read_timeouts: self.read_timeouts.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            vad_speech: self.vad_speech.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            rejected_short: self.rejected_short.load(Ordering::Relaxed),
            rejected_long: self.rejected_long.load(Ordering::Relaxed),
            rejected_pattern: self.rejected_pattern.load(Ordering::Relaxed),
            classifier_errors: self.classifier_errors.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            exchanges_ok: self.exchanges_ok.load(Ordering::Relaxed),
            exchanges_failed: self.exchanges_failed.load(Ordering::Relaxed),
            replies_played: self.replies_played.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 13] {
        [
            &self.chunks_read,
            &self.read_timeouts,
            &self.read_errors,
            &self.vad_speech,
            &self.candidates,
            &self.rejected_short,
            &self.rejected_long,
            &self.rejected_pattern,
            &self.classifier_errors,
            &self.detections,
            &self.exchanges_ok,
            &self.exchanges_failed,
            &self.replies_played,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub chunks_read: usize,
    pub read_timeouts: usize,
    pub read_errors: usize,
    pub vad_speech: usize,
    pub candidates: usize,
    pub rejected_short: usize,
    pub rejected_long: usize,
    pub rejected_pattern: usize,
    pub classifier_errors: usize,
    pub detections: usize,
    pub exchanges_ok: usize,
    pub exchanges_failed: usize,
    pub replies_played: usize,
}

/// All context the pipeline needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub machine: CaptureStateMachine,
    pub source: Box<dyn SampleSource>,
    pub sink: Box<dyn SampleSink>,
    pub transport: Box<dyn Transport>,
    pub running: Arc<AtomicBool>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    pub wake_tx: broadcast::Sender<WakeEvent>,
    pub exchange_tx: broadcast::Sender<ExchangeEvent>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Run the blocking pipeline until `ctx.running` becomes false or the source ends.
pub fn run(mut ctx: PipelineContext) {
    info!(
        sample_rate = ctx.config.sample_rate,
        chunk_ms = ctx.config.chunk_ms,
        "pipeline started"
    );

    let mut chunk = vec![0i16; ctx.config.chunk_len().max(1)];
    let mut activity_seq = 0u64;
    let mut read_errors = 0usize;
    let mut exit_error: Option<String> = None;

    while ctx.running.load(Ordering::Relaxed) {
        // ── 1. Read one chunk ─────────────────────────────────────────────
        let n = match fill_chunk(&mut ctx, &mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                read_errors = 0;
                n
            }
            Err(WakeError::SourceExhausted) => {
                info!("audio source exhausted");
                break;
            }
            Err(e) => {
                read_errors += 1;
                ctx.diagnostics.read_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, consecutive = read_errors, "audio read failed");
                if read_errors >= MAX_READ_ERRORS {
                    error!("too many consecutive read errors, stopping");
                    exit_error = Some(e.to_string());
                    break;
                }
                continue;
            }
        };
        ctx.diagnostics.chunks_read.fetch_add(1, Ordering::Relaxed);

        // ── 2. State machine ─────────────────────────────────────────────
        let tick = match ctx.machine.on_chunk(&chunk[..n]) {
            Ok(tick) => tick,
            Err(e) => {
                ctx.diagnostics
                    .classifier_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "wake classifier failed");
                continue;
            }
        };

        // ── 3. Activity ──────────────────────────────────────────────────
        if let Some(voice) = tick.voice {
            let is_speech = voice.is_speech();
            if is_speech {
                ctx.diagnostics.vad_speech.fetch_add(1, Ordering::Relaxed);
            }
            let _ = ctx.activity_tx.send(AudioActivityEvent {
                seq: activity_seq,
                energy: tick.energy,
                is_speech,
            });
            activity_seq = activity_seq.saturating_add(1);
            if activity_seq % LEVEL_LOG_EVERY == 0 {
                debug!(
                    energy = format_args!("{:.0}", tick.energy),
                    is_speech,
                    "audio level check"
                );
            }
        }

        // ── 4. Transitions ───────────────────────────────────────────────
        match tick.step {
            Step::Quiet | Step::Collecting | Step::CoolingDown { .. } => {}
            Step::CollectStarted => {
                ctx.diagnostics.candidates.fetch_add(1, Ordering::Relaxed);
                set_status(&ctx, EngineStatus::Collecting, None);
            }
            Step::Rejected(rejection) => {
                let counter = match rejection {
                    Rejection::TooShort { .. } => &ctx.diagnostics.rejected_short,
                    Rejection::TooLong { .. } => &ctx.diagnostics.rejected_long,
                    Rejection::NoPattern { .. } => &ctx.diagnostics.rejected_pattern,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                debug!(?rejection, "candidate rejected");
                set_status(&ctx, EngineStatus::Listening, None);
            }
            Step::Resumed => {
                debug!("cooldown over");
                set_status(&ctx, EngineStatus::Listening, None);
            }
            Step::Detected(detection) => {
                let input_ended = handle_detection(&mut ctx, detection);
                ctx.machine.enter_cooldown();
                if input_ended {
                    info!("audio source exhausted during recording");
                    break;
                }
                ctx.source.discard_pending();
                set_status(&ctx, EngineStatus::Cooldown, None);
            }
        }
    }

    ctx.running.store(false, Ordering::SeqCst);
    let snapshot = ctx.diagnostics.snapshot();
    info!(?snapshot, "pipeline stopped");
    match exit_error {
        Some(detail) => set_status(&ctx, EngineStatus::Error, Some(detail)),
        None => set_status(&ctx, EngineStatus::Stopped, None),
    }
}

/// Read until `chunk` is full. Returns 0 if the engine was stopped first.
fn fill_chunk(ctx: &mut PipelineContext, chunk: &mut [i16]) -> Result<usize> {
    let mut filled = 0;
    while filled < chunk.len() {
        if !ctx.running.load(Ordering::Relaxed) {
            return Ok(0);
        }
        match ctx.source.read(&mut chunk[filled..], ctx.config.read_timeout) {
            Ok(0) => {
                ctx.diagnostics.read_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Ok(n) => filled += n,
            // Hand over a trailing partial chunk; the next read reports the end.
            Err(WakeError::SourceExhausted) if filled > 0 => return Ok(filled),
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Announce the detection and run one exchange. Returns whether the source
/// ran dry while recording.
fn handle_detection(ctx: &mut PipelineContext, detection: Detection) -> bool {
    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    ctx.diagnostics.detections.fetch_add(1, Ordering::Relaxed);
    let span = info_span!("exchange", seq);
    let _guard = span.enter();

    info!(
        source = ?detection.source,
        duration_ms = detection.duration_ms,
        confidence = ?detection.confidence,
        "wake phrase detected"
    );
    let _ = ctx.wake_tx.send(WakeEvent {
        seq,
        source: detection.source,
        duration_ms: detection.duration_ms,
        confidence: detection.confidence,
    });

    let status = Arc::clone(&ctx.status);
    let status_tx = ctx.status_tx.clone();
    let mut on_status =
        move |next: EngineStatus| publish_status(&status, &status_tx, next, None);
    let result = run_exchange(
        &ctx.config,
        &mut *ctx.source,
        &mut *ctx.sink,
        &*ctx.transport,
        &mut on_status,
    );

    let mut event = ExchangeEvent {
        seq,
        ..ExchangeEvent::default()
    };
    let mut input_ended = false;
    match result {
        Ok(report) => {
            ctx.diagnostics.exchanges_ok.fetch_add(1, Ordering::Relaxed);
            if report.reply_audio_played {
                ctx.diagnostics.replies_played.fetch_add(1, Ordering::Relaxed);
            }
            input_ended = report.input_ended;
            event.ok = report.playback_error.is_none();
            event.error = report.playback_error;
            event.upload_status = report.upload_status;
            event.reply_audio_played = report.reply_audio_played;
            event.transcript = report.reply.stt_text;
            event.reply = report.reply.ai_reply;
        }
        Err(e) => {
            ctx.diagnostics
                .exchanges_failed
                .fetch_add(1, Ordering::Relaxed);
            if e.is_transient() {
                warn!(error = %e, "exchange failed, resuming listening");
            } else {
                error!(error = %e, "exchange failed, resuming listening");
            }
            if let WakeError::HttpStatus(status) = &e {
                event.upload_status = Some(*status);
            }
            input_ended = matches!(e, WakeError::SourceExhausted);
            event.error = Some(e.to_string());
        }
    }
    let _ = ctx.exchange_tx.send(event);
    input_ended
}

fn set_status(ctx: &PipelineContext, next: EngineStatus, detail: Option<String>) {
    publish_status(&ctx.status, &ctx.status_tx, next, detail);
}

/// Update the shared status and broadcast it if it changed.
fn publish_status(
    status: &Mutex<EngineStatus>,
    status_tx: &broadcast::Sender<EngineStatusEvent>,
    next: EngineStatus,
    detail: Option<String>,
) {
    {
        let mut current = status.lock();
        if *current == next && detail.is_none() {
            return;
        }
        *current = next;
    }
    let _ = status_tx.send(EngineStatusEvent {
        status: next,
        detail,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{NullSink, WavFileSource};
    use crate::engine::state::{Detector, MachineConfig};
    use crate::transport::testing::ScriptedTransport;
    use crate::vad::{EnergyVad, EnergyVadConfig};
    use crate::wake::{PhraseMatcher, PhraseMatcherConfig};
    use std::thread;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    const RATE: u32 = 16_000;

    fn base_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.record_ms = 500;
        config.endpoints.upload_url = "http://svc/upload".into();
        config.upload.inter_chunk_delay = Duration::ZERO;
        config.upload.retry_delay = Duration::ZERO;
        config
    }

    fn machine(config: &EngineConfig) -> CaptureStateMachine {
        CaptureStateMachine::new(
            config.machine_config(),
            Box::new(EnergyVad::new(EnergyVadConfig::default())),
            Detector::Pattern(PhraseMatcher::new(PhraseMatcherConfig::default())),
        )
    }

    /// Silence, a two-chunk candidate (40 ms bursts separated by silence),
    /// silence long enough for the recording and the cooldown.
    fn wake_signal() -> Vec<i16> {
        let mut out = vec![0i16; 1_600 * 3];
        for _ in 0..2 {
            let mut chunk: Vec<i16> = (0..640)
                .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
                .collect();
            chunk.resize(1_600, 0);
            out.extend(chunk);
        }
        out.extend(vec![0i16; 1_600 * 50]);
        out
    }

    struct Channels {
        status: broadcast::Receiver<EngineStatusEvent>,
        wakes: broadcast::Receiver<WakeEvent>,
        exchanges: broadcast::Receiver<ExchangeEvent>,
    }

    fn context(
        config: EngineConfig,
        samples: Vec<i16>,
        transport: ScriptedTransport,
    ) -> (PipelineContext, Channels, Arc<PipelineDiagnostics>) {
        let (status_tx, status) = broadcast::channel(64);
        let (activity_tx, _) = broadcast::channel(256);
        let (wake_tx, wakes) = broadcast::channel(8);
        let (exchange_tx, exchanges) = broadcast::channel(8);
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let ctx = PipelineContext {
            machine: machine(&config),
            config,
            source: Box::new(WavFileSource::from_samples(samples, RATE)),
            sink: Box::new(NullSink),
            transport: Box::new(transport),
            running: Arc::new(AtomicBool::new(true)),
            status_tx,
            activity_tx,
            wake_tx,
            exchange_tx,
            status: Arc::new(Mutex::new(EngineStatus::Listening)),
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::clone(&diagnostics),
        };
        (
            ctx,
            Channels {
                status,
                wakes,
                exchanges,
            },
            diagnostics,
        )
    }

    fn drain_statuses(rx: &mut broadcast::Receiver<EngineStatusEvent>) -> Vec<EngineStatus> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => out.push(event.status),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    #[test]
    fn detection_runs_exchange_then_cools_down_and_stops_at_end_of_input() {
        let transport = ScriptedTransport::responding(200, br#"{"stt_text":"hi"}"#);
        let record = Arc::clone(&transport.record);
        let (ctx, mut channels, diagnostics) = context(base_config(), wake_signal(), transport);
        let running = Arc::clone(&ctx.running);

        run(ctx);

        let wake = channels.wakes.try_recv().expect("wake event");
        assert_eq!(wake.seq, 0);
        assert_eq!(wake.duration_ms, 200);

        let exchange = channels.exchanges.try_recv().expect("exchange event");
        assert!(exchange.ok);
        assert_eq!(exchange.upload_status, Some(200));
        assert_eq!(exchange.transcript.as_deref(), Some("hi"));

        assert_eq!(
            drain_statuses(&mut channels.status),
            vec![
                EngineStatus::Collecting,
                EngineStatus::Recording,
                EngineStatus::Uploading,
                EngineStatus::Cooldown,
                EngineStatus::Listening,
                EngineStatus::Stopped,
            ]
        );

        let snap = diagnostics.snapshot();
        assert_eq!(snap.detections, 1);
        assert_eq!(snap.exchanges_ok, 1);
        assert_eq!(record.lock().requests.len(), 1);
        assert!(!running.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_upload_still_cools_down() {
        let mut transport = ScriptedTransport::responding(200, b"");
        transport.refuse = true;
        let (ctx, mut channels, diagnostics) = context(base_config(), wake_signal(), transport);

        run(ctx);

        let exchange = channels.exchanges.try_recv().expect("exchange event");
        assert!(!exchange.ok);
        assert!(exchange.error.is_some());
        assert_eq!(diagnostics.snapshot().exchanges_failed, 1);

        let statuses = drain_statuses(&mut channels.status);
        assert!(statuses.contains(&EngineStatus::Cooldown));
        assert_eq!(statuses.last(), Some(&EngineStatus::Stopped));
    }

    #[test]
    fn silence_produces_no_candidates() {
        let transport = ScriptedTransport::responding(200, b"{}");
        let (ctx, mut channels, diagnostics) =
            context(base_config(), vec![0; 1_600 * 20], transport);

        run(ctx);

        assert!(matches!(channels.wakes.try_recv(), Err(TryRecvError::Empty)));
        let snap = diagnostics.snapshot();
        assert_eq!(snap.chunks_read, 20);
        assert_eq!(snap.candidates, 0);
        assert_eq!(drain_statuses(&mut channels.status), vec![EngineStatus::Stopped]);
    }

    #[test]
    fn clearing_running_flag_stops_the_loop() {
        struct Silent;
        impl SampleSource for Silent {
            fn read(&mut self, _buf: &mut [i16], timeout: Duration) -> Result<usize> {
                thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(0)
            }
            fn sample_rate(&self) -> u32 {
                RATE
            }
        }

        let transport = ScriptedTransport::responding(200, b"{}");
        let (mut ctx, mut channels, _) = context(base_config(), Vec::new(), transport);
        ctx.source = Box::new(Silent);
        let running = Arc::clone(&ctx.running);

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            running.store(false, Ordering::SeqCst);
        });
        run(ctx);
        stopper.join().expect("stopper thread panicked");

        assert_eq!(drain_statuses(&mut channels.status), vec![EngineStatus::Stopped]);
    }
}
