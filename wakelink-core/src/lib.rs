//! # wakelink-core
//!
//! Wake-phrase detection and reliable audio exchange for a voice edge device.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → CaptureSource ─┐
//!                                                              ▼
//!                                     Pipeline(spawn_blocking): CaptureStateMachine
//!                                          EnergyVad → PhraseMatcher | ClassifierGate
//!                                                              │ wake
//!                                                              ▼
//!                          record → Preprocessor → container + upload ──► service
//!                                                              │ reply
//!                                                              ▼
//!                                        download → validate → SpeakerSink
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens in the pipeline thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod classifier;
pub mod container;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod transport;
pub mod vad;
pub mod wake;

// Convenience re-exports for downstream crates
pub use audio::{CaptureSource, SampleSink, SampleSource, SpeakerSink, WavFileSource};
pub use buffering::SampleBuffer;
pub use classifier::{ClassifierHandle, Inference, ScriptedClassifier, WakeClassifier};
pub use engine::{DetectorMode, DeviceIo, EngineConfig, Endpoints, WakeEngine};
pub use error::{Result, WakeError};
pub use ipc::events::{
    AudioActivityEvent, EngineStatus, EngineStatusEvent, ExchangeEvent, WakeEvent,
};
pub use transport::{LocationInfo, ServiceReply, Transport};

#[cfg(feature = "onnx")]
pub use classifier::{OnnxClassifier, OnnxClassifierConfig};

#[cfg(feature = "http")]
pub use transport::{HttpConfig, HttpTransport};
