//! ONNX-backed wake classifier.
//!
//! ## Model I/O
//!
//! | Name     | Shape    | DType | Direction |
//! |----------|----------|-------|-----------|
//! | `input`  | `[1, N]` | f32   | in        |
//! | `output` | `[1, L]` | f32   | out       |
//!
//! `N` is the window length in samples, `L` the number of labels. The output
//! may be logits or probabilities; a softmax is applied unless every value is
//! already in `0..=1` and sums to one.
//!
//! Labels come from the config, or from a `labels.txt` next to the model
//! (one label per line).

use std::path::{Path, PathBuf};

use ndarray::Array2;
use ort::session::builder::SessionBuilder;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::{info, warn};

use crate::classifier::{Inference, WakeClassifier};
use crate::error::{Result, WakeError};

#[derive(Debug, Clone)]
pub struct OnnxClassifierConfig {
    pub model_path: PathBuf,
    /// Explicit labels. Empty means read `labels.txt` beside the model.
    pub labels: Vec<String>,
    /// Multiplier applied to each i16 sample before it is fed to the model.
    /// `1.0` feeds raw sample values; `1.0 / 32768.0` feeds normalised audio.
    pub input_scale: f32,
}

impl Default for OnnxClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: default_models_dir().join("wake_classifier.onnx"),
            labels: Vec::new(),
            input_scale: 1.0,
        }
    }
}

pub fn default_models_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("wakelink")
        .join("models")
}

pub struct OnnxClassifier {
    config: OnnxClassifierConfig,
    session: Option<Session>,
    input_name: String,
    output_name: String,
    labels: Vec<String>,
    input_buf: Vec<f32>,
}

impl OnnxClassifier {
    pub fn new(config: OnnxClassifierConfig) -> Self {
        let labels = config.labels.clone();
        Self {
            config,
            session: None,
            input_name: "input".into(),
            output_name: "output".into(),
            labels,
            input_buf: Vec::new(),
        }
    }

    fn run(&mut self, window: &[i16]) -> Result<Vec<f32>> {
        let session = self.session.as_mut().ok_or_else(|| {
            WakeError::OnnxSession("classifier not loaded, call warm_up()".into())
        })?;

        self.input_buf.clear();
        self.input_buf
            .extend(window.iter().map(|&s| f32::from(s) * self.config.input_scale));

        let input_arr = Array2::<f32>::from_shape_vec((1, window.len()), self.input_buf.clone())
            .map_err(|e| WakeError::OnnxSession(e.to_string()))?;
        let input_val = Value::from_array(input_arr)
            .map_err(|e: ort::Error| WakeError::OnnxSession(e.to_string()))?;
        let input_values: Vec<(String, SessionInputValue<'_>)> =
            vec![(self.input_name.clone(), input_val.into())];

        let outputs = session
            .run(input_values)
            .map_err(|e| WakeError::OnnxSession(e.to_string()))?;
        let scores = outputs
            .get(self.output_name.as_str())
            .unwrap_or(&outputs[0]);
        let (_, data) = scores
            .try_extract_tensor::<f32>()
            .map_err(|e| WakeError::OnnxSession(e.to_string()))?;
        Ok(data.to_vec())
    }
}

impl WakeClassifier for OnnxClassifier {
    fn warm_up(&mut self) -> Result<()> {
        let path = self.config.model_path.clone();
        if !path.exists() {
            return Err(WakeError::ModelNotFound { path });
        }
        let size_mb = std::fs::metadata(&path)
            .map(|m| m.len() as f64 / 1_048_576.0)
            .unwrap_or(0.0);
        info!("loading wake classifier from {:?} ({:.2} MB)", path, size_mb);

        let session = SessionBuilder::new()
            .map_err(|e| WakeError::OnnxSession(e.to_string()))?
            .commit_from_file(&path)
            .map_err(|e| WakeError::OnnxSession(e.to_string()))?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        info!("  inputs: {:?}", input_names);
        info!("  outputs: {:?}", output_names);

        self.input_name = resolve_name(&input_names, &["input", "audio", "x"])
            .or_else(|| input_names.first().cloned())
            .ok_or_else(|| WakeError::OnnxSession("classifier model has no inputs".into()))?;
        self.output_name = resolve_name(&output_names, &["output", "scores", "probabilities"])
            .or_else(|| output_names.first().cloned())
            .ok_or_else(|| WakeError::OnnxSession("classifier model has no outputs".into()))?;
        self.session = Some(session);

        if self.labels.is_empty() {
            self.labels = read_labels(&path.with_file_name("labels.txt"))?;
        }
        info!("  labels: {:?}", self.labels);
        Ok(())
    }

    fn infer(&mut self, window: &[i16]) -> Result<Inference> {
        let raw = self.run(window)?;
        if raw.is_empty() {
            return Err(WakeError::Classifier("model produced no scores".into()));
        }
        if !self.labels.is_empty() && raw.len() != self.labels.len() {
            warn!(
                scores = raw.len(),
                labels = self.labels.len(),
                "score count does not match label count"
            );
        }
        let probs = to_probabilities(&raw);
        let (label, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        Ok(Inference { label, confidence })
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn reset(&mut self) {
        self.input_buf.clear();
    }
}

fn read_labels(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|_| WakeError::ModelNotFound {
        path: path.to_path_buf(),
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn to_probabilities(raw: &[f32]) -> Vec<f32> {
    let sum: f32 = raw.iter().sum();
    if raw.iter().all(|v| (0.0..=1.0).contains(v)) && (sum - 1.0).abs() < 1e-3 {
        return raw.to_vec();
    }
    let max = raw.iter().copied().fold(f32::MIN, f32::max);
    let exp: Vec<f32> = raw.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / total).collect()
}

fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred.iter().find_map(|needle| {
        candidates
            .iter()
            .find(|name| name.eq_ignore_ascii_case(needle))
            .cloned()
    })
}
