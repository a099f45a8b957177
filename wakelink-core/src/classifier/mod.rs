//! Wake-phrase classifier abstraction.
//!
//! The `WakeClassifier` trait is an opaque capability: one window of samples
//! in, one `(label, confidence)` pair out. Feature extraction, model format
//! and thresholds internal to a backend are its own business; the caller only
//! applies the acceptance rule in [`crate::wake::gate`].
//!
//! `&mut self` on `infer` expresses that backends may keep scratch buffers or
//! session state. All access is serialised through `ClassifierHandle`.

pub mod scripted;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxClassifier, OnnxClassifierConfig};
pub use scripted::ScriptedClassifier;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Best-scoring label for one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inference {
    /// Index into [`WakeClassifier::labels`].
    pub label: usize,
    /// Score in `0.0..=1.0`.
    pub confidence: f32,
}

/// Contract for wake-phrase classification backends.
pub trait WakeClassifier: Send + 'static {
    /// One-time setup: load weights, run a dummy inference.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Classify one full window of mono 16-bit samples.
    fn infer(&mut self, window: &[i16]) -> Result<Inference>;

    /// Label names, indexed by [`Inference::label`].
    fn labels(&self) -> &[String];

    /// Drop any state carried between windows.
    fn reset(&mut self);
}

/// Thread-safe reference-counted handle to any `WakeClassifier` implementor.
#[derive(Clone)]
pub struct ClassifierHandle(pub Arc<Mutex<dyn WakeClassifier>>);

impl ClassifierHandle {
    pub fn new<C: WakeClassifier>(classifier: C) -> Self {
        Self(Arc::new(Mutex::new(classifier)))
    }

    pub fn infer(&self, window: &[i16]) -> Result<Inference> {
        self.0.lock().infer(window)
    }

    /// Name of `label`, if the backend knows it.
    pub fn label_name(&self, label: usize) -> Option<String> {
        self.0.lock().labels().get(label).cloned()
    }
}

impl std::fmt::Debug for ClassifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierHandle").finish_non_exhaustive()
    }
}
