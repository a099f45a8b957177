//! Voice Activity Detection (VAD) abstraction.
//!
//! The `VoiceActivityDetector` trait is the seam the capture state machine
//! listens through. `EnergyVad` is the only built-in implementation.

pub mod energy;

pub use energy::{mean_energy, zero_crossing_rate, EnergyVad, EnergyVadConfig};

/// Whether a given audio chunk contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may keep diagnostic state, but a decision must depend only on
/// the chunk passed in.
pub trait VoiceActivityDetector: Send + 'static {
    /// Analyse a chunk of signed 16-bit samples.
    fn classify(&mut self, samples: &[i16]) -> VadDecision;

    /// Reset any internal state.
    fn reset(&mut self);
}
