//! `WakeEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! WakeEngine::new()
//!     └─► warm_up()          → classifier loaded, status = WarmingUp → Idle
//!         └─► start()        → devices open, pipeline spawned, status = Listening
//!             └─► stop()     → running=false, devices dropped, status = Stopped
//! ```
//!
//! `start()`/`stop()` are idempotent: calling them in the wrong state returns
//! an error rather than panicking.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, and the blocking HTTP client
//! must not live on an async worker. The source, sink and transport are
//! therefore opened *inside* the `spawn_blocking` closure and never cross a
//! thread boundary. A sync oneshot channel propagates open errors back to the
//! `start()` caller.

pub mod exchange;
pub mod pipeline;
pub mod state;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::{PreprocessConfig, SampleSink, SampleSource},
    classifier::ClassifierHandle,
    error::{Result, WakeError},
    ipc::events::{AudioActivityEvent, EngineStatus, EngineStatusEvent, ExchangeEvent, WakeEvent},
    transport::{DownloadConfig, LocationInfo, Transport, UploadConfig},
    vad::{EnergyVad, EnergyVadConfig},
    wake::{ClassifierGate, GateConfig, PhraseMatcher, PhraseMatcherConfig},
};

use state::{samples_for_ms, CaptureStateMachine, Detector, MachineConfig};

/// Broadcast channel capacity for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Which wake detector the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorMode {
    /// Energy-contour heuristic over a collected utterance.
    #[default]
    Pattern,
    /// Sliding window fed to a [`crate::classifier::WakeClassifier`].
    Classifier,
}

/// Remote endpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Endpoints {
    pub upload_url: String,
    /// Where synthesised reply audio is fetched from. Empty disables playback.
    pub reply_audio_url: String,
    pub location_url: Option<String>,
}

/// Configuration for `WakeEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rate of every buffer the engine handles (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Duration of one read chunk. Default: 100 ms.
    pub chunk_ms: u32,
    /// Longest a single source read may block. Default: 1 s.
    pub read_timeout: Duration,
    pub vad: EnergyVadConfig,
    pub detector: DetectorMode,
    pub matcher: PhraseMatcherConfig,
    pub gate: GateConfig,
    /// Candidates shorter than this are rejected. Default: 150 ms.
    pub min_utterance_ms: u32,
    /// Candidates longer than this are rejected. Default: 2000 ms.
    pub max_utterance_ms: u32,
    /// Detection is suppressed this long after each exchange. Default: 3 s.
    pub cooldown: Duration,
    /// Length of the recording uploaded after a detection. Default: 3000 ms.
    pub record_ms: u32,
    pub preprocess: PreprocessConfig,
    pub upload: UploadConfig,
    pub download: DownloadConfig,
    pub endpoints: Endpoints,
    pub api_key: String,
    /// Attached to every upload as a header when present.
    pub location: Option<LocationInfo>,
    /// Fetch reply audio even when the service does not flag it as saved.
    pub always_fetch_reply_audio: bool,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_ms: 100,
            read_timeout: Duration::from_secs(1),
            vad: EnergyVadConfig::default(),
            detector: DetectorMode::Pattern,
            matcher: PhraseMatcherConfig::default(),
            gate: GateConfig::default(),
            min_utterance_ms: 150,
            max_utterance_ms: 2000,
            cooldown: Duration::from_secs(3),
            record_ms: 3000,
            preprocess: PreprocessConfig::default(),
            upload: UploadConfig::default(),
            download: DownloadConfig::default(),
            endpoints: Endpoints::default(),
            api_key: String::new(),
            location: None,
            always_fetch_reply_audio: false,
            input_device: None,
            output_device: None,
        }
    }
}

impl EngineConfig {
    /// Samples per read chunk.
    pub fn chunk_len(&self) -> usize {
        samples_for_ms(self.sample_rate, self.chunk_ms)
    }

    /// Cooldown expressed in read chunks, rounded up.
    pub fn cooldown_chunks(&self) -> u32 {
        let chunk_ms = self.chunk_ms.max(1) as u128;
        self.cooldown.as_millis().div_ceil(chunk_ms) as u32
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            sample_rate: self.sample_rate,
            min_utterance_ms: self.min_utterance_ms,
            max_utterance_ms: self.max_utterance_ms,
            cooldown_chunks: self.cooldown_chunks(),
        }
    }

    /// Build the state machine for this configuration. Classifier mode without
    /// a classifier falls back to the pattern heuristic.
    pub fn build_machine(&self, classifier: Option<ClassifierHandle>) -> CaptureStateMachine {
        let detector = match (self.detector, classifier) {
            (DetectorMode::Classifier, Some(handle)) => Detector::Classifier(ClassifierGate::new(
                self.gate.clone(),
                handle,
                self.sample_rate,
            )),
            (DetectorMode::Classifier, None) => {
                warn!("classifier mode requested without a classifier, using pattern matcher");
                Detector::Pattern(PhraseMatcher::new(self.matcher))
            }
            (DetectorMode::Pattern, _) => Detector::Pattern(PhraseMatcher::new(self.matcher)),
        };
        CaptureStateMachine::new(
            self.machine_config(),
            Box::new(EnergyVad::new(self.vad)),
            detector,
        )
    }
}

/// Device handles the pipeline owns for its lifetime.
pub struct DeviceIo {
    pub source: Box<dyn SampleSource>,
    pub sink: Box<dyn SampleSink>,
    pub transport: Box<dyn Transport>,
}

/// The top-level engine handle.
///
/// `WakeEngine` is `Send + Sync`; all fields use interior mutability.
pub struct WakeEngine {
    config: EngineConfig,
    classifier: Option<ClassifierHandle>,
    /// `true` while the pipeline is active.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    wake_tx: broadcast::Sender<WakeEvent>,
    exchange_tx: broadcast::Sender<ExchangeEvent>,
    /// Monotonically increasing detection sequence counter.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
}

impl WakeEngine {
    /// Create a new engine. Does not start capturing; call `warm_up()` then `start()`.
    pub fn new(config: EngineConfig, classifier: Option<ClassifierHandle>) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (wake_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (exchange_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            classifier,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            status_tx,
            activity_tx,
            wake_tx,
            exchange_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(pipeline::PipelineDiagnostics::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Warm up the wake classifier, if one is configured.
    pub fn warm_up(&self) -> Result<()> {
        let Some(classifier) = &self.classifier else {
            return Ok(());
        };
        self.set_status(EngineStatus::WarmingUp, None);
        info!("warming up wake classifier");
        if let Err(e) = classifier.0.lock().warm_up() {
            self.set_status(EngineStatus::Error, Some(e.to_string()));
            return Err(e);
        }
        self.set_status(EngineStatus::Idle, None);
        info!("wake classifier ready");
        Ok(())
    }

    /// Start with the default microphone, speaker and HTTP transport.
    #[cfg(all(feature = "audio-cpal", feature = "http"))]
    pub fn start(&self) -> Result<()> {
        self.start_with(|config: &EngineConfig| {
            let source = crate::audio::CaptureSource::open(
                config.input_device.as_deref(),
                config.sample_rate,
            )?;
            let sink = crate::audio::SpeakerSink::open(config.output_device.as_deref())?;
            let transport =
                crate::transport::HttpTransport::new(crate::transport::HttpConfig::default())?;
            Ok(DeviceIo {
                source: Box::new(source),
                sink: Box::new(sink),
                transport: Box::new(transport),
            })
        })
    }

    /// Start the pipeline with devices produced by `open_io`.
    ///
    /// `open_io` runs on the pipeline thread. Blocks until it has returned,
    /// then leaves the pipeline running in the background.
    ///
    /// # Errors
    /// - `WakeError::AlreadyRunning` if already started.
    /// - whatever `open_io` returns.
    pub fn start_with<F>(&self, open_io: F) -> Result<()>
    where
        F: FnOnce(&EngineConfig) -> Result<DeviceIo> + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WakeError::AlreadyRunning);
        }

        self.diagnostics.reset();
        self.set_status(EngineStatus::Listening, None);
        let machine = self.config.build_machine(self.classifier.clone());

        // Clone all Arc-wrapped state before moving into the closure.
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let status_tx = self.status_tx.clone();
        let activity_tx = self.activity_tx.clone();
        let wake_tx = self.wake_tx.clone();
        let exchange_tx = self.exchange_tx.clone();
        let status = Arc::clone(&self.status);
        let seq = Arc::clone(&self.seq);
        let diagnostics = Arc::clone(&self.diagnostics);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        tokio::task::spawn_blocking(move || {
            // ── Open devices (must happen on THIS thread) ─────────────────────
            let io = match open_io(&config) {
                Ok(io) => io,
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };
            if io.source.sample_rate() != config.sample_rate {
                warn!(
                    source_rate = io.source.sample_rate(),
                    engine_rate = config.sample_rate,
                    "source rate differs from engine rate"
                );
            }
            let _ = open_tx.send(Ok(()));

            pipeline::run(pipeline::PipelineContext {
                config,
                machine,
                source: io.source,
                sink: io.sink,
                transport: io.transport,
                running,
                status_tx,
                activity_tx,
                wake_tx,
                exchange_tx,
                status,
                seq,
                diagnostics,
            });
            // Devices drop here, on the thread that opened them.
        });

        match open_rx.recv() {
            Ok(Ok(())) => {
                info!("engine started, listening");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent; the task panicked.
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some("pipeline failed to start".into()));
                Err(WakeError::Other(anyhow::anyhow!(
                    "pipeline task died unexpectedly"
                )))
            }
        }
    }

    /// Ask the pipeline to stop. It finishes the current chunk (or exchange)
    /// and then publishes `Stopped`.
    ///
    /// # Errors
    /// - `WakeError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(WakeError::NotRunning);
        }
        info!("engine stop requested");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Per-chunk energy and VAD decisions while listening.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.activity_tx.subscribe()
    }

    pub fn subscribe_wakes(&self) -> broadcast::Receiver<WakeEvent> {
        self.wake_tx.subscribe()
    }

    pub fn subscribe_exchanges(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.exchange_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}
