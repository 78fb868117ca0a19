//! A real-time safe relay between a pull-based sample producer and an audio callback.
//!
//! The [`Producer`](producer::Producer) runs on a control thread, where it may allocate and take
//! as long as it likes (within its time budget). The audio callback only ever sees completed
//! buffers, handed over by ownership transfer, and plays silence whenever nothing is ready.
//!
//! # Example
//! ```no_run
//! use worklet_bridge::context::{Bridge, BridgeOptions};
//! use worklet_bridge::producer::SineProducer;
//!
//! let bridge = Bridge::new(BridgeOptions::default());
//! bridge.attach_producer(SineProducer::new(220., bridge.sample_rate()));
//!
//! // enjoy listening
//! std::thread::sleep(std::time::Duration::from_secs(4));
//! ```

use std::fmt;
#[cfg(feature = "cpal")]
use std::sync::atomic::{AtomicU64, Ordering};

/// Render quantum size, the smallest block of frames requested from the producer
pub const RENDER_QUANTUM_SIZE: usize = 128;

/// Default upper bound for the number of frames in a single request
pub const DEFAULT_MAX_FRAME_COUNT: usize = 8192;

/// Maximum number of channels of a frame buffer
pub const MAX_CHANNELS: usize = 32;

pub mod buffer;
pub mod context;
pub mod producer;
pub mod render;
pub mod stats;

pub(crate) mod control;
pub(crate) mod io;
pub(crate) mod message;

/// Atomic float, stored as its bit pattern in an `AtomicU64`
#[cfg(feature = "cpal")]
#[derive(Debug)]
pub(crate) struct AtomicF64 {
    inner: AtomicU64,
}

#[cfg(feature = "cpal")]
impl AtomicF64 {
    pub fn new(v: f64) -> Self {
        Self {
            inner: AtomicU64::new(u64::from_ne_bytes(v.to_ne_bytes())),
        }
    }

    pub fn load(&self) -> f64 {
        f64::from_ne_bytes(self.inner.load(Ordering::SeqCst).to_ne_bytes())
    }

    pub fn store(&self, v: f64) {
        self.inner
            .store(u64::from_ne_bytes(v.to_ne_bytes()), Ordering::SeqCst)
    }
}

/// Assert that the given sample rate is usable for an output stream
///
/// # Panics
///
/// This function panics if the sample rate is not finite or not strictly positive
#[track_caller]
pub(crate) fn assert_valid_sample_rate(sample_rate: f32) {
    assert!(
        sample_rate.is_finite() && sample_rate > 0.,
        "NotSupportedError - Invalid sample rate: {:?}, should be a finite positive number",
        sample_rate
    );
}

/// Assert that the given number of channels fits in a frame buffer
///
/// # Panics
///
/// This function panics if the number of channels is zero or exceeds [`MAX_CHANNELS`]
#[track_caller]
pub(crate) fn assert_valid_number_of_channels(number_of_channels: usize) {
    assert!(
        number_of_channels > 0 && number_of_channels <= MAX_CHANNELS,
        "NotSupportedError - Invalid number of channels: {:?} is outside range [1, {:?}]",
        number_of_channels,
        MAX_CHANNELS
    );
}

/// The bridge has been closed and can no longer be used
#[derive(Debug, Clone, Copy)]
pub struct InvalidStateError {}

impl fmt::Display for InvalidStateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
impl std::error::Error for InvalidStateError {}

#[cfg(test)]
#[global_allocator]
static A: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;
