//! Sample buffers and the lock-free SPSC ring between the capture callback and
//! the engine worker.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod chunk;
pub mod window;

use ringbuf::{traits::Split, HeapRb};

pub use chunk::SampleBuffer;
pub use ringbuf::traits::{Consumer, Observer, Producer};
pub use window::{DetectionWindow, SlidingWindow};

/// Type alias for the producer half, held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half, held by the engine worker.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^19 = 524 288 f32 samples ≈ 10.9 s at 48 kHz.
/// The worker stops draining for a whole record/upload/playback exchange,
/// so the ring only has to bridge scheduling jitter, not the exchange itself.
pub const RING_CAPACITY: usize = 1 << 19;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
