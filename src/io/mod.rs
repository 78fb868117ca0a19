//! Audio output interfaces

use std::sync::atomic::{AtomicU64, AtomicU8};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::FrameBuffer;
use crate::context::{BridgeOptions, BridgeState, LatencyCategory};
use crate::message::{FilledBuffer, RenderEvent};
use crate::stats::SharedStats;
use crate::RENDER_QUANTUM_SIZE;

mod none;
pub(crate) use none::NoneBackend;

#[cfg(feature = "cpal")]
mod cpal;

/// Capacity of the recycle channel, larger than the number of buffers in circulation
const RECYCLE_CAPACITY: usize = 4;

#[derive(Debug)]
pub(crate) struct ControlThreadInit {
    pub state: Arc<AtomicU8>,
    pub frames_played: Arc<AtomicU64>,
    pub stats: Arc<SharedStats>,
    pub event_recv: Receiver<RenderEvent>,
    pub ready_send: Sender<FilledBuffer>,
    pub recycle_recv: Receiver<FrameBuffer>,
}

#[derive(Clone, Debug)]
pub(crate) struct RenderThreadInit {
    pub state: Arc<AtomicU8>,
    pub frames_played: Arc<AtomicU64>,
    pub stats: Arc<SharedStats>,
    pub event_send: Sender<RenderEvent>,
    pub ready_recv: Receiver<FilledBuffer>,
    pub recycle_send: Sender<FrameBuffer>,
}

pub(crate) fn thread_init() -> (ControlThreadInit, RenderThreadInit) {
    // Track bridge state - synced from the control thread to the render thread
    let state = Arc::new(AtomicU8::new(BridgeState::Suspended as u8));

    // Track number of frames - synced from render thread to control thread
    let frames_played = Arc::new(AtomicU64::new(0));

    let stats = Arc::new(SharedStats::default());

    // Communication channel for requests and starvation events from the render thread to the
    // producer thread. Use a bounded channel for real-time safety. At most one request is
    // outstanding, excess starvation events are dropped when the capacity is reached.
    let (event_send, event_recv) = crossbeam_channel::bounded(64);

    // Filled buffers, from the producer thread to the render thread. With a single outstanding
    // request there is never more than one buffer in flight.
    let (ready_send, ready_recv) = crossbeam_channel::bounded(1);

    // Spent buffers travel back so the render thread never deallocates
    let (recycle_send, recycle_recv) = crossbeam_channel::bounded(RECYCLE_CAPACITY);

    let control_thread_init = ControlThreadInit {
        state: Arc::clone(&state),
        frames_played: Arc::clone(&frames_played),
        stats: Arc::clone(&stats),
        event_recv,
        ready_send,
        recycle_recv,
    };

    let render_thread_init = RenderThreadInit {
        state,
        frames_played,
        stats,
        event_send,
        ready_recv,
        recycle_send,
    };

    (control_thread_init, render_thread_init)
}

/// Set up an output stream (speakers) based on the sink id and the selected features
pub(crate) fn build_output(
    options: BridgeOptions,
    render_thread_init: RenderThreadInit,
) -> Box<dyn AudioBackendManager> {
    if options.sink_id == "none" {
        let backend = NoneBackend::build_output(options, render_thread_init);
        return Box::new(backend);
    }

    #[cfg(feature = "cpal")]
    {
        let backend = cpal::CpalBackend::build_output(options, render_thread_init);
        Box::new(backend)
    }

    #[cfg(not(feature = "cpal"))]
    {
        log::warn!(
            "No audio backend available for sink {:?}, enable the 'cpal' feature. Rendering without output",
            options.sink_id
        );
        let backend = NoneBackend::build_output(options, render_thread_init);
        Box::new(backend)
    }
}

/// Interface for audio backends
pub(crate) trait AudioBackendManager: Send + Sync + 'static {
    /// Name of the concrete implementation - for debug purposes
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Setup a new output stream (speakers)
    fn build_output(options: BridgeOptions, render_thread_init: RenderThreadInit) -> Self
    where
        Self: Sized;

    /// Resume or start the stream
    fn resume(&self) -> bool;

    /// Suspend the stream
    fn suspend(&self) -> bool;

    /// Close the stream, freeing all resources. It cannot be started again after closing.
    fn close(&self);

    /// Sample rate of the stream
    fn sample_rate(&self) -> f32;

    /// Number of channels of the stream
    fn number_of_channels(&self) -> usize;

    /// Render quantum size in frames
    fn frame_count(&self) -> usize;

    /// Output latency of the stream in seconds
    fn output_latency(&self) -> f64;

    /// The audio output device - `""` means the default device
    fn sink_id(&self) -> &str;
}

/// Calculate buffer size in frames for a given latency category
pub(crate) fn buffer_size_for_latency_category(
    latency_cat: LatencyCategory,
    sample_rate: f32,
) -> usize {
    // at 44100Hz sample rate (this could be even more relaxed):
    // Interactive: 128 samples is 2,9ms
    // Balanced:    512 samples is 11,6ms
    // Playback:    1024 samples is 23,2ms
    match latency_cat {
        LatencyCategory::Interactive => RENDER_QUANTUM_SIZE,
        LatencyCategory::Balanced => RENDER_QUANTUM_SIZE * 4,
        LatencyCategory::Playback => RENDER_QUANTUM_SIZE * 8,
        // buffer_size is always positive and truncation is the desired behavior
        #[allow(clippy::cast_sign_loss)]
        #[allow(clippy::cast_possible_truncation)]
        LatencyCategory::Custom(latency) => {
            assert!(
                latency > 0.,
                "RangeError - Invalid custom latency: {:?}, should be strictly positive",
                latency
            );

            let buffer_size = (latency * sample_rate as f64) as usize;
            buffer_size.max(1).next_power_of_two()
        }
    }
}
