//! The control handle of the bridge and its configuration

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::control::ProducerThread;
use crate::io::{self, AudioBackendManager, ControlThreadInit};
use crate::message::ControlMessage;
use crate::producer::Producer;
use crate::render::BridgeRenderer;
use crate::stats::{BridgeStats, SharedStats};
use crate::{InvalidStateError, DEFAULT_MAX_FRAME_COUNT};

/// Sample rate of a detached bridge without an explicit sample rate
const DEFAULT_SAMPLE_RATE: f32 = 48000.;

/// Time `close` waits for the producer thread to exit before detaching it
const CLOSE_TIMEOUT: Duration = Duration::from_millis(250);

/// Identify the type of playback, which affects tradeoffs between audio output latency and power
/// consumption
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LatencyCategory {
    /// Balance audio output latency and power consumption.
    Balanced,
    /// Provide the lowest audio output latency possible without glitching.
    Interactive,
    /// Prioritize sustained playback without interruption over audio output latency.
    /// Lowest power consumption. This is the default.
    Playback,
    /// Specify the number of seconds of latency, rounded up to a power of two number of frames
    Custom(f64),
}

impl Default for LatencyCategory {
    fn default() -> Self {
        Self::Playback
    }
}

/// Specify the playback configuration of a [`Bridge`]
#[derive(Clone, Debug)]
pub struct BridgeOptions {
    /// Identify the type of playback, which determines the render quantum size
    pub latency_hint: LatencyCategory,

    /// Sample rate of the audio output, `None` selects the device default
    pub sample_rate: Option<f32>,

    /// Number of interleaved channels in each frame
    pub number_of_channels: usize,

    /// Upper bound for the frame count of a single request
    pub max_frame_count: usize,

    /// The audio output device
    /// - use `""` for the default audio output device
    /// - use `"none"` to render without an audio output device
    pub sink_id: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            latency_hint: LatencyCategory::default(),
            sample_rate: None,
            number_of_channels: 2,
            max_frame_count: DEFAULT_MAX_FRAME_COUNT,
            sink_id: String::new(),
        }
    }
}

/// Describes the current state of the [`Bridge`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BridgeState {
    /// No producer is attached, or the bridge was suspended. The audio callback plays silence
    /// and issues no requests.
    Suspended,
    /// Audio is being produced.
    Running,
    /// The bridge has been closed, and can no longer be used to produce audio.
    Closed,
}

impl From<u8> for BridgeState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Suspended,
            1 => Self::Running,
            2 => Self::Closed,
            _ => unreachable!(),
        }
    }
}

/// Control handle of a running bridge
///
/// The `Bridge` owns the producer thread and, unless created with [`Bridge::detached`], the audio
/// output stream. Dropping it closes the bridge.
pub struct Bridge {
    sample_rate: f32,
    number_of_channels: usize,
    frame_count: usize,
    state: Arc<AtomicU8>,
    frames_played: Arc<AtomicU64>,
    stats: Arc<SharedStats>,
    ctrl_msg_sender: Sender<ControlMessage>,
    producer_thread: Mutex<Option<ProducerThreadHandle>>,
    backend: Option<Box<dyn AudioBackendManager>>,
}

struct ProducerThreadHandle {
    join_handle: JoinHandle<()>,
    /// receives a message (or disconnects) when the producer thread exits
    exited: Receiver<()>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("sample_rate", &self.sample_rate)
            .field("number_of_channels", &self.number_of_channels)
            .field("frame_count", &self.frame_count)
            .field("state", &self.state())
            .field(
                "backend",
                &self.backend.as_ref().map(|b| b.name()).unwrap_or("detached"),
            )
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Creates a bridge playing to the audio output device selected by the options
    ///
    /// The bridge plays silence until a producer is attached.
    ///
    /// # Panics
    ///
    /// This function will panic when:
    /// - the options specify an invalid sample rate or number of channels
    /// - no output device is available
    pub fn new(options: BridgeOptions) -> Self {
        let (control_thread_init, render_thread_init) = io::thread_init();
        let backend = io::build_output(options, render_thread_init);

        log::info!(
            "Output backend {}: {} Hz, {} channels, {} frames per quantum, sink {:?}",
            backend.name(),
            backend.sample_rate(),
            backend.number_of_channels(),
            backend.frame_count(),
            backend.sink_id()
        );

        Self::spawn(
            backend.sample_rate(),
            backend.number_of_channels(),
            backend.frame_count(),
            control_thread_init,
            Some(backend),
        )
    }

    /// Creates a bridge without audio output, returning the real-time side to the caller
    ///
    /// Drive the returned [`BridgeRenderer`] from your own audio callback. The `sink_id` option is
    /// ignored.
    ///
    /// # Panics
    ///
    /// This function will panic if the options specify an invalid sample rate or number of
    /// channels
    pub fn detached(options: BridgeOptions) -> (Self, BridgeRenderer) {
        let sample_rate = options.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let number_of_channels = options.number_of_channels;
        let frame_count = io::buffer_size_for_latency_category(options.latency_hint, sample_rate)
            .min(options.max_frame_count);

        let (control_thread_init, render_thread_init) = io::thread_init();
        let renderer = BridgeRenderer::new(
            sample_rate,
            number_of_channels,
            frame_count,
            options.max_frame_count,
            render_thread_init,
        );

        let bridge = Self::spawn(
            sample_rate,
            number_of_channels,
            frame_count,
            control_thread_init,
            None,
        );

        (bridge, renderer)
    }

    /// Creates a bridge with a producer attached, playing to the selected output device
    pub fn with_producer<P: Producer + 'static>(producer: P, options: BridgeOptions) -> Self {
        let bridge = Self::new(options);
        bridge.attach_producer(producer);
        bridge
    }

    fn spawn(
        sample_rate: f32,
        number_of_channels: usize,
        frame_count: usize,
        control_thread_init: ControlThreadInit,
        backend: Option<Box<dyn AudioBackendManager>>,
    ) -> Self {
        let state = Arc::clone(&control_thread_init.state);
        let frames_played = Arc::clone(&control_thread_init.frames_played);
        let stats = Arc::clone(&control_thread_init.stats);

        // Use a bounded channel, the control handle blocks when the capacity is reached
        let (ctrl_msg_sender, ctrl_msg_receiver) = crossbeam_channel::bounded(64);

        let producer_thread = ProducerThread::new(
            sample_rate,
            number_of_channels,
            ctrl_msg_receiver,
            control_thread_init,
        );

        let (exited_send, exited) = crossbeam_channel::bounded(1);
        let join_handle = thread::Builder::new()
            .name("bridge-producer".into())
            .spawn(move || {
                producer_thread.run();
                let _ = exited_send.send(());
            })
            .expect("failed to spawn the producer thread");

        Self {
            sample_rate,
            number_of_channels,
            frame_count,
            state,
            frames_played,
            stats,
            ctrl_msg_sender,
            producer_thread: Mutex::new(Some(ProducerThreadHandle {
                join_handle,
                exited,
            })),
            backend,
        }
    }

    fn send_control_msg(&self, msg: ControlMessage) -> Result<(), InvalidStateError> {
        if self.state() == BridgeState::Closed {
            return Err(InvalidStateError {});
        }
        self.ctrl_msg_sender
            .send(msg)
            .map_err(|_| InvalidStateError {})
    }

    /// Install the producer, replacing any previous one
    ///
    /// Requests that arrived while no producer was available are answered right away.
    pub fn attach_producer<P: Producer + 'static>(&self, producer: P) {
        let msg = ControlMessage::AttachProducer {
            producer: Box::new(producer),
        };
        if self.send_control_msg(msg).is_err() {
            log::warn!("Bridge is closed, producer not attached");
        }
    }

    /// Forward a named parameter to the producer, applied in between two fills
    pub fn set_parameter(&self, name: &str, value: &str) -> Result<(), InvalidStateError> {
        self.send_control_msg(ControlMessage::SetParameter {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }

    /// Stop requesting audio, the output plays silence
    pub fn suspend(&self) -> Result<(), InvalidStateError> {
        self.send_control_msg(ControlMessage::Suspend)?;
        if let Some(backend) = &self.backend {
            backend.suspend();
        }
        Ok(())
    }

    /// Resume requesting audio after [`Bridge::suspend`]
    pub fn resume(&self) -> Result<(), InvalidStateError> {
        self.send_control_msg(ControlMessage::Resume)?;
        if let Some(backend) = &self.backend {
            backend.resume();
        }
        Ok(())
    }

    /// Stop issuing requests, stop the output and release all buffers
    ///
    /// The producer thread is joined when it exits within a short timeout. A producer stuck in
    /// `fill` is detached instead, it is dropped once its fill returns. Closing twice is a no-op.
    pub fn close(&self) {
        let handle = match self.producer_thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        let handle = match handle {
            Some(handle) => handle,
            None => return,
        };

        // the renderer stops requesting as soon as it observes the closed state
        self.state
            .store(BridgeState::Closed as u8, Ordering::Release);

        if let Some(backend) = &self.backend {
            backend.close();
        }

        // a stuck producer thread may not drain the control channel, never block on it
        let _ = self.ctrl_msg_sender.try_send(ControlMessage::Close);

        match handle.exited.recv_timeout(CLOSE_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join_handle.join().is_err() {
                    log::error!("Producer thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Producer thread did not exit within {:?}, detaching it",
                    CLOSE_TIMEOUT
                );
            }
        }

        log::info!("Bridge closed, stats: {:?}", self.stats());
    }

    pub fn state(&self) -> BridgeState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats.snapshot()
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn number_of_channels(&self) -> usize {
        self.number_of_channels
    }

    /// Render quantum size in frames at creation time
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Time in seconds of the audio produced while running
    pub fn current_time(&self) -> f64 {
        self.frames_played.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    /// Output latency of the audio device in seconds, zero when detached
    pub fn output_latency(&self) -> f64 {
        self.backend
            .as_ref()
            .map(|b| b.output_latency())
            .unwrap_or(0.)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}
