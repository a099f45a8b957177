use thiserror::Error;

/// All errors produced by wakelink-core.
///
/// Variants fall into four classes: resource exhaustion, transient I/O that
/// exhausted its retry budget, operation failures (status, timeout, size) and
/// malformed input. None of them is fatal to the engine loop.
#[derive(Debug, Error)]
pub enum WakeError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("sample source exhausted")]
    SourceExhausted,

    #[error("could not allocate {bytes} bytes for {purpose}")]
    ResourceExhausted { purpose: &'static str, bytes: usize },

    #[error("gave up after {failures} consecutive write failures ({bytes_sent} bytes sent)")]
    WriteRetriesExhausted { bytes_sent: usize, failures: u32 },

    #[error("could not open connection to {url}: {reason}")]
    ConnectionOpen { url: String, reason: String },

    #[error("server answered with status {0}")]
    HttpStatus(u16),

    #[error("no response headers within {0:?}")]
    ResponseTimeout(std::time::Duration),

    #[error("advertised download of {advertised} bytes exceeds cap of {cap} bytes")]
    DownloadTooLarge { advertised: u64, cap: usize },

    #[error("invalid content length: {0:?}")]
    InvalidContentLength(Option<u64>),

    #[error("stream ended after {received} of {expected} bytes")]
    ShortRead { received: usize, expected: usize },

    #[error("invalid audio container: {0}")]
    InvalidContainer(&'static str),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WakeError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WakeError::WriteRetriesExhausted { .. }
                | WakeError::ResponseTimeout(_)
                | WakeError::ConnectionOpen { .. }
                | WakeError::ShortRead { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WakeError>;
