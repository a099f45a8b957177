//! Offline wake detector evaluation over a directory of WAV fixtures.
//!
//! Files under a path containing `wake` are expected to trigger at least one
//! detection; everything else is expected to stay silent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use wakelink_core::{
    engine::state::Step, DetectorMode, EngineConfig, SampleSource, WakeError, WavFileSource,
};

fn main() {
    if let Err(e) = run() {
        eprintln!("wake bench failed: {e}");
        std::process::exit(1);
    }
}

#[derive(Debug)]
struct Args {
    fixtures_dir: PathBuf,
    mode: DetectorMode,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
struct CaseResult {
    file: String,
    category: String,
    expect_wake: bool,
    detections: usize,
    candidates: usize,
    correct: bool,
    duration_secs: f64,
    p95_chunk_us: f64,
}

#[derive(Debug, Clone, Serialize)]
struct CategorySummary {
    category: String,
    files: usize,
    accuracy: f64,
    detections: usize,
}

#[derive(Debug, Clone, Serialize)]
struct Summary {
    fixtures_dir: String,
    mode: DetectorMode,
    total_files: usize,
    true_positive_rate: Option<f64>,
    false_positive_rate: Option<f64>,
    p50_chunk_us: f64,
    p95_chunk_us: f64,
    categories: Vec<CategorySummary>,
    cases: Vec<CaseResult>,
}

fn parse_args() -> Result<Args, String> {
    let mut fixtures_dir: Option<PathBuf> = None;
    let mut mode = DetectorMode::Pattern;
    let mut output: Option<PathBuf> = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--fixtures" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --fixtures".into());
                };
                fixtures_dir = Some(PathBuf::from(v));
            }
            "--mode" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --mode".into());
                };
                mode = match v.as_str() {
                    "pattern" => DetectorMode::Pattern,
                    "classifier" => DetectorMode::Classifier,
                    other => return Err(format!("unknown mode: {other}")),
                };
            }
            "--output" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --output".into());
                };
                output = Some(PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p wakelink-core --bin wake_bench -- \\
  --fixtures <dir> [--mode pattern|classifier] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let fixtures_dir = fixtures_dir.unwrap_or_else(|| PathBuf::from("benchmarks/fixtures"));
    Ok(Args {
        fixtures_dir,
        mode,
        output,
    })
}

fn collect_wavs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let entries = std::fs::read_dir(dir).map_err(|e| e.to_string())?;
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path();
        if path.is_dir() {
            collect_wavs(&path, out)?;
            continue;
        }
        let is_wav = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if is_wav {
            out.push(path);
        }
    }
    Ok(())
}

fn category_for(relative: &Path) -> String {
    relative
        .parent()
        .and_then(|p| p.components().next())
        .map(|c| c.as_os_str().to_string_lossy().to_ascii_lowercase())
        .unwrap_or_else(|| "other".into())
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn ratio(num: usize, den: usize) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

#[cfg(feature = "onnx")]
fn classifier_for(mode: DetectorMode) -> Result<Option<wakelink_core::ClassifierHandle>, String> {
    use wakelink_core::{ClassifierHandle, OnnxClassifier, OnnxClassifierConfig, WakeClassifier};
    if mode != DetectorMode::Classifier {
        return Ok(None);
    }
    let mut classifier = OnnxClassifier::new(OnnxClassifierConfig::default());
    classifier.warm_up().map_err(|e| e.to_string())?;
    Ok(Some(ClassifierHandle::new(classifier)))
}

#[cfg(not(feature = "onnx"))]
fn classifier_for(mode: DetectorMode) -> Result<Option<wakelink_core::ClassifierHandle>, String> {
    if mode == DetectorMode::Classifier {
        return Err("classifier mode requires the 'onnx' feature".into());
    }
    Ok(None)
}

/// Feed one file through a fresh state machine, chunk by chunk.
fn evaluate(
    config: &EngineConfig,
    classifier: Option<wakelink_core::ClassifierHandle>,
    path: &Path,
) -> Result<(usize, usize, f64, Vec<f64>), String> {
    let mut source = WavFileSource::open(path, config.sample_rate).map_err(|e| e.to_string())?;
    let duration_secs = source.remaining() as f64 / config.sample_rate as f64;
    let mut machine = config.build_machine(classifier);
    let mut chunk = vec![0i16; config.chunk_len().max(1)];
    let mut detections = 0;
    let mut candidates = 0;
    let mut timings = Vec::new();

    loop {
        let n = match source.read(&mut chunk, Duration::ZERO) {
            Ok(n) => n,
            Err(WakeError::SourceExhausted) => break,
            Err(e) => return Err(e.to_string()),
        };
        let started = Instant::now();
        let tick = machine.on_chunk(&chunk[..n]).map_err(|e| e.to_string())?;
        timings.push(started.elapsed().as_secs_f64() * 1e6);
        match tick.step {
            Step::CollectStarted => candidates += 1,
            Step::Detected(_) => {
                detections += 1;
                machine.enter_cooldown();
            }
            _ => {}
        }
    }
    Ok((detections, candidates, duration_secs, timings))
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    if !args.fixtures_dir.exists() {
        return Err(format!(
            "fixtures directory not found: {}",
            args.fixtures_dir.display()
        ));
    }

    let mut wav_files = Vec::new();
    collect_wavs(&args.fixtures_dir, &mut wav_files)?;
    wav_files.sort();
    if wav_files.is_empty() {
        return Err(format!(
            "no .wav fixtures found in {}",
            args.fixtures_dir.display()
        ));
    }

    let config = EngineConfig {
        detector: args.mode,
        ..EngineConfig::default()
    };
    let classifier = classifier_for(args.mode)?;
    println!(
        "Running wake bench on {} fixtures (mode={:?})",
        wav_files.len(),
        args.mode
    );

    let mut cases = Vec::new();
    let mut all_timings = Vec::new();
    for wav in &wav_files {
        let relative = wav.strip_prefix(&args.fixtures_dir).unwrap_or(wav);
        let file = relative.display().to_string();
        let category = category_for(relative);
        let expect_wake = file.to_ascii_lowercase().contains("wake");

        let (detections, candidates, duration_secs, timings) =
            evaluate(&config, classifier.clone(), wav).map_err(|e| format!("{file}: {e}"))?;
        let correct = (detections > 0) == expect_wake;
        println!(
            "{file}: detections={detections} candidates={candidates} {}",
            if correct { "ok" } else { "WRONG" }
        );
        cases.push(CaseResult {
            file,
            category,
            expect_wake,
            detections,
            candidates,
            correct,
            duration_secs,
            p95_chunk_us: percentile(&timings, 0.95),
        });
        all_timings.extend(timings);
    }

    let mut grouped: BTreeMap<String, Vec<&CaseResult>> = BTreeMap::new();
    for row in &cases {
        grouped.entry(row.category.clone()).or_default().push(row);
    }
    let categories = grouped
        .into_iter()
        .map(|(category, rows)| CategorySummary {
            files: rows.len(),
            accuracy: ratio(rows.iter().filter(|r| r.correct).count(), rows.len())
                .unwrap_or(0.0),
            detections: rows.iter().map(|r| r.detections).sum(),
            category,
        })
        .collect();

    let positives = cases.iter().filter(|c| c.expect_wake).count();
    let negatives = cases.len() - positives;
    let summary = Summary {
        fixtures_dir: args.fixtures_dir.display().to_string(),
        mode: args.mode,
        total_files: cases.len(),
        true_positive_rate: ratio(
            cases
                .iter()
                .filter(|c| c.expect_wake && c.detections > 0)
                .count(),
            positives,
        ),
        false_positive_rate: ratio(
            cases
                .iter()
                .filter(|c| !c.expect_wake && c.detections > 0)
                .count(),
            negatives,
        ),
        p50_chunk_us: percentile(&all_timings, 0.50),
        p95_chunk_us: percentile(&all_timings, 0.95),
        categories,
        cases,
    };

    println!(
        "Done. files={} tpr={} fpr={} p95_chunk={:.1}us",
        summary.total_files,
        summary
            .true_positive_rate
            .map(|v| format!("{:.1}%", v * 100.0))
            .unwrap_or_else(|| "n/a".into()),
        summary
            .false_positive_rate
            .map(|v| format!("{:.1}%", v * 100.0))
            .unwrap_or_else(|| "n/a".into()),
        summary.p95_chunk_us
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote bench report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
