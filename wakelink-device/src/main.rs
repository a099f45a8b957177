//! wakelink device entry point.
//!
//! Loads settings, reports the device location, then runs the wake engine
//! against the default microphone and speaker (or a WAV file with `--replay`)
//! until Ctrl-C or until the source runs dry.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use settings::{default_settings_path, load_settings, DeviceSettings};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use wakelink_core::{
    audio::{device, NullSink},
    transport::report_location,
    ClassifierHandle, DetectorMode, DeviceIo, EngineConfig, EngineStatus, HttpConfig,
    HttpTransport, SampleSink, SpeakerSink, WakeEngine, WavFileSource,
};

const LOCATION_REPORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Args {
    settings_path: Option<PathBuf>,
    replay: Option<PathBuf>,
    list_devices: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --settings");
                };
                args.settings_path = Some(PathBuf::from(v));
            }
            "--replay" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --replay");
                };
                args.replay = Some(PathBuf::from(v));
            }
            "--list-devices" => args.list_devices = true,
            "--help" | "-h" => {
                println!(
                    "Usage: wakelink [--settings <file.json>] [--replay <input.wav>] [--list-devices]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn print_devices() {
    println!("Input devices:");
    for d in device::list_input_devices() {
        println!(
            "  {}{}{}",
            d.name,
            if d.is_default { " (default)" } else { "" },
            if d.is_recommended { " [recommended]" } else { "" }
        );
    }
    println!("Output devices:");
    for d in device::list_output_devices() {
        println!("  {}{}", d.name, if d.is_default { " (default)" } else { "" });
    }
}

#[cfg(feature = "onnx")]
fn load_classifier(settings: &DeviceSettings) -> Option<ClassifierHandle> {
    use wakelink_core::{OnnxClassifier, OnnxClassifierConfig};

    if settings.detector_mode != DetectorMode::Classifier {
        return None;
    }
    let mut cfg = OnnxClassifierConfig::default();
    if let Some(path) = &settings.classifier_model_path {
        cfg.model_path = PathBuf::from(path);
    }
    if !cfg.model_path.exists() {
        warn!(
            model = ?cfg.model_path,
            "wake classifier model not found, falling back to pattern matcher"
        );
        return None;
    }
    info!(model = ?cfg.model_path, "using ONNX wake classifier");
    Some(ClassifierHandle::new(OnnxClassifier::new(cfg)))
}

#[cfg(not(feature = "onnx"))]
fn load_classifier(settings: &DeviceSettings) -> Option<ClassifierHandle> {
    if settings.detector_mode == DetectorMode::Classifier {
        warn!("built without the 'onnx' feature, falling back to pattern matcher");
    }
    None
}

/// POST the configured location once at startup. Failure is logged, not fatal.
async fn report_startup_location(settings: &DeviceSettings) {
    let (Some(url), Some(location)) = (settings.location_url.clone(), settings.location.clone())
    else {
        return;
    };
    let api_key = settings.api_key.clone().unwrap_or_default();
    let result = tokio::task::spawn_blocking(move || {
        let transport = HttpTransport::new(HttpConfig::default())?;
        report_location(
            &transport,
            &url,
            &api_key,
            &location,
            LOCATION_REPORT_TIMEOUT,
        )
    })
    .await;
    match result {
        Ok(Ok(status)) => info!(status, "startup location report accepted"),
        Ok(Err(e)) => warn!("location report failed: {e}"),
        Err(e) => warn!("location report task failed: {e}"),
    }
}

fn open_replay(path: PathBuf) -> impl FnOnce(&EngineConfig) -> wakelink_core::Result<DeviceIo> {
    move |config: &EngineConfig| {
        let source = WavFileSource::open(&path, config.sample_rate)?;
        info!(
            file = ?path,
            seconds = source.remaining() as f64 / config.sample_rate as f64,
            "replaying WAV file"
        );
        let sink: Box<dyn SampleSink> = match SpeakerSink::open(config.output_device.as_deref())
        {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                warn!("no speaker for replay, reply audio will be discarded: {e}");
                Box::new(NullSink)
            }
        };
        Ok(DeviceIo {
            source: Box::new(source),
            sink,
            transport: Box::new(HttpTransport::new(HttpConfig::default())?),
        })
    }
}

fn spawn_event_loggers(engine: &WakeEngine) {
    let mut wake_rx = engine.subscribe_wakes();
    tokio::spawn(async move {
        loop {
            match wake_rx.recv().await {
                Ok(event) => info!(
                    seq = event.seq,
                    source = ?event.source,
                    duration_ms = event.duration_ms,
                    confidence = ?event.confidence,
                    "wake phrase detected"
                ),
                Err(RecvError::Lagged(n)) => warn!("wake receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut exchange_rx = engine.subscribe_exchanges();
    tokio::spawn(async move {
        loop {
            match exchange_rx.recv().await {
                Ok(event) if event.ok => info!(
                    seq = event.seq,
                    status = ?event.upload_status,
                    transcript = event.transcript.as_deref().unwrap_or(""),
                    played = event.reply_audio_played,
                    "exchange complete"
                ),
                Ok(event) => warn!(
                    seq = event.seq,
                    error = event.error.as_deref().unwrap_or("unknown"),
                    "exchange failed"
                ),
                Err(RecvError::Lagged(n)) => warn!("exchange receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Resolves once the pipeline has published its final status.
async fn wait_until_stopped(
    engine: &WakeEngine,
    status_rx: &mut broadcast::Receiver<wakelink_core::EngineStatusEvent>,
) {
    loop {
        match status_rx.recv().await {
            Ok(event) => {
                if let Some(detail) = &event.detail {
                    info!(status = ?event.status, detail = %detail, "engine status");
                } else {
                    info!(status = ?event.status, "engine status");
                }
                let finished = event.status == EngineStatus::Stopped
                    || (event.status == EngineStatus::Error && !engine.is_running());
                if finished {
                    return;
                }
            }
            Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
            Err(RecvError::Closed) => return,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wakelink=info,wakelink_core=info".into()),
        )
        .init();

    let args = parse_args()?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let settings_path = args.settings_path.unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);
    info!(
        settings_path = ?settings_path,
        upload_url = %settings.upload_url,
        detector = ?settings.detector_mode,
        record_ms = settings.record_ms,
        cooldown_ms = settings.cooldown_ms,
        has_api_key = settings.api_key.is_some(),
        "device settings loaded"
    );
    if settings.api_key.is_none() {
        warn!("no API key configured, the service will likely reject uploads");
    }

    report_startup_location(&settings).await;

    let engine = Arc::new(WakeEngine::new(
        settings.to_engine_config(),
        load_classifier(&settings),
    ));
    engine.warm_up().context("wake classifier warm-up failed")?;
    spawn_event_loggers(&engine);

    let mut status_rx = engine.subscribe_status();
    let started = match args.replay {
        Some(path) => engine.start_with(open_replay(path)),
        None => engine.start(),
    };
    started.context("failed to start wake engine")?;

    let interrupted = tokio::select! {
        _ = wait_until_stopped(&engine, &mut status_rx) => false,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("ctrl-c handler failed: {e}");
            }
            true
        }
    };
    if interrupted {
        info!("shutting down");
        match engine.stop() {
            Ok(()) => wait_until_stopped(&engine, &mut status_rx).await,
            Err(e) => warn!("stop: {e}"),
        }
    } else {
        info!("pipeline finished");
    }

    let snap = engine.diagnostics_snapshot();
    info!(
        detections = snap.detections,
        exchanges_ok = snap.exchanges_ok,
        exchanges_failed = snap.exchanges_failed,
        replies_played = snap.replies_played,
        "wakelink stopped"
    );
    Ok(())
}
