//! Communicates with the producer thread and ships audio samples to the hardware

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use dasp_sample::FromSample;

use crate::buffer::{self, FrameBuffer};
use crate::context::BridgeState;
use crate::io::RenderThreadInit;
use crate::message::{FilledBuffer, RenderEvent, RequestToken};
use crate::stats::SharedStats;

/// Reasons a fill request was not sent to the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// Another request is still waiting for its buffer
    Outstanding(RequestToken),
    /// The bridge is suspended, has no producer attached, or has been closed
    NotRunning,
    /// The frame count is zero or exceeds the maximum frame count of the bridge
    InvalidFrameCount(usize),
    /// The request channel to the producer thread is full
    ChannelFull,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Outstanding(token) => write!(f, "request {} is still outstanding", token.0),
            Self::NotRunning => write!(f, "the bridge is not running"),
            Self::InvalidFrameCount(n) => write!(f, "invalid frame count: {}", n),
            Self::ChannelFull => write!(f, "the request channel is full"),
        }
    }
}

impl std::error::Error for RequestError {}

/// The real-time side of the bridge, to be driven by the system-level audio callback
///
/// None of the methods block, allocate or panic. All buffers are received from and returned to
/// the producer thread by ownership transfer over bounded channels.
pub struct BridgeRenderer {
    sample_rate: f32,
    number_of_channels: usize,
    /// current render quantum size in frames
    frame_count: usize,
    max_frame_count: usize,
    state: Arc<AtomicU8>,
    frames_played: Arc<AtomicU64>,
    stats: Arc<SharedStats>,
    event_sender: Sender<RenderEvent>,
    ready_receiver: Receiver<FilledBuffer>,
    recycle_sender: Sender<FrameBuffer>,
    /// buffer returned by the last `get_ready_buffer` call
    playing: Option<FrameBuffer>,
    /// zeroes for the largest admissible render quantum
    silence: Box<[f32]>,
    pending: Option<RequestToken>,
    next_token: u64,
    starved: bool,
    /// frames of the current quantum already written by `render`
    buffer_offset: Option<usize>,
}

impl fmt::Debug for BridgeRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeRenderer")
            .field("sample_rate", &self.sample_rate)
            .field("number_of_channels", &self.number_of_channels)
            .field("frame_count", &self.frame_count)
            .field("frames_played", &self.frames_played.load(Ordering::Relaxed))
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl BridgeRenderer {
    pub(crate) fn new(
        sample_rate: f32,
        number_of_channels: usize,
        frame_count: usize,
        max_frame_count: usize,
        render_thread_init: RenderThreadInit,
    ) -> Self {
        crate::assert_valid_sample_rate(sample_rate);
        crate::assert_valid_number_of_channels(number_of_channels);
        assert!(
            frame_count > 0 && frame_count <= max_frame_count,
            "RangeError - Invalid frame count: {:?} is outside range [1, {:?}]",
            frame_count,
            max_frame_count
        );

        let RenderThreadInit {
            state,
            frames_played,
            stats,
            event_send,
            ready_recv,
            recycle_send,
        } = render_thread_init;

        Self {
            sample_rate,
            number_of_channels,
            frame_count,
            max_frame_count,
            state,
            frames_played,
            stats,
            event_sender: event_send,
            ready_receiver: ready_recv,
            recycle_sender: recycle_send,
            playing: None,
            silence: vec![0.; max_frame_count * number_of_channels].into_boxed_slice(),
            pending: None,
            next_token: 0,
            starved: false,
            buffer_offset: None,
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn number_of_channels(&self) -> usize {
        self.number_of_channels
    }

    /// Number of frames per render quantum, as set by the last `request_frames` call
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn max_frame_count(&self) -> usize {
        self.max_frame_count
    }

    /// The request still waiting for its buffer, if any
    pub fn pending_request(&self) -> Option<RequestToken> {
        self.pending
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == BridgeState::Running as u8
    }

    /// Ask the producer thread for a buffer of `frame_count` frames
    ///
    /// Admissible frame counts are `1..=max_frame_count()`. Other values are refused with
    /// [`RequestError::InvalidFrameCount`] and leave the current frame count unchanged.
    ///
    /// Changing the frame count takes effect immediately for `get_ready_buffer`, also when the
    /// request itself is refused. Buffers of the previous size arriving later are discarded and
    /// the producer thread reallocates on the next request.
    pub fn request_frames(&mut self, frame_count: usize) -> Result<RequestToken, RequestError> {
        if frame_count == 0 || frame_count > self.max_frame_count {
            return Err(RequestError::InvalidFrameCount(frame_count));
        }
        self.frame_count = frame_count;

        if !self.is_running() {
            return Err(RequestError::NotRunning);
        }
        if let Some(token) = self.pending {
            return Err(RequestError::Outstanding(token));
        }

        let token = RequestToken(self.next_token);
        let event = RenderEvent::AudioNeeded { token, frame_count };
        match self.event_sender.try_send(event) {
            Ok(()) => {
                self.next_token += 1;
                self.pending = Some(token);
                SharedStats::increment(&self.stats.requests_issued);
                Ok(token)
            }
            Err(TrySendError::Full(_)) => Err(RequestError::ChannelFull),
            Err(TrySendError::Disconnected(_)) => Err(RequestError::NotRunning),
        }
    }

    /// The most recently completed buffer, or silence of the same length if none is ready
    ///
    /// The returned samples are interleaved and always contain exactly
    /// `frame_count() * number_of_channels()` values. Each completed buffer is returned by a
    /// single call only; the next call hands it back to the producer thread.
    pub fn get_ready_buffer(&mut self) -> &[f32] {
        self.poll_ready();
        self.ready_slice()
    }

    fn ready_slice(&self) -> &[f32] {
        match &self.playing {
            Some(buffer) => buffer.as_slice(),
            None => &self.silence[..self.frame_count * self.number_of_channels],
        }
    }

    fn poll_ready(&mut self) {
        if let Some(spent) = self.playing.take() {
            self.recycle(spent);
        }

        let running = self.is_running();

        loop {
            match self.ready_receiver.try_recv() {
                Ok(FilledBuffer { token, buffer }) => {
                    if self.pending == Some(token) {
                        self.pending = None;
                    }
                    let usable = running
                        && self.playing.is_none()
                        && buffer.has_shape(self.frame_count, self.number_of_channels);
                    if usable {
                        self.playing = Some(buffer);
                    } else {
                        self.recycle(buffer);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if !running {
            self.starved = false;
            return;
        }

        if self.playing.is_some() {
            self.starved = false;
        } else if self.pending.is_some() {
            SharedStats::increment(&self.stats.starved_quanta);
            if !self.starved {
                self.starved = true;
                let event = RenderEvent::Starved {
                    token: self.pending,
                    current_frame: self.frames_played.load(Ordering::Relaxed),
                };
                let _ = self.event_sender.try_send(event);
            }
        }
    }

    fn recycle(&mut self, buffer: FrameBuffer) {
        // The recycle channel has room for every buffer in circulation, so this only fails when
        // the producer thread is gone and the buffer may as well be released here.
        let _ = self.recycle_sender.try_send(buffer);
    }

    /// Advance one render quantum: collect the ready buffer and request the next one
    fn next_quantum(&mut self) {
        self.poll_ready();

        // request the next buffer right away, the producer fills it while this one plays
        let _ = self.request_frames(self.frame_count);

        SharedStats::increment(&self.stats.quanta_rendered);
        self.stats
            .frames_rendered
            .fetch_add(self.frame_count as u64, Ordering::Relaxed);
        if self.is_running() {
            self.frames_played
                .fetch_add(self.frame_count as u64, Ordering::Relaxed);
        }
    }

    /// Fill an interleaved output slice of arbitrary length
    ///
    /// The output is rendered in chunks of `frame_count()` frames. When the output length is not a
    /// multiple of this quantum, the remainder of the last quantum is written at the start of the
    /// next call.
    pub fn render<S: FromSample<f32> + Clone>(&mut self, mut output_buffer: &mut [S]) {
        let number_of_channels = self.number_of_channels;

        // There may be frames left over from the previous render call, if the callback size
        // did not align with the quantum size
        if let Some(offset) = self.buffer_offset.take() {
            let leftover_len = self.frame_count.saturating_sub(offset) * number_of_channels;
            let (first, next) = output_buffer.split_at_mut(leftover_len.min(output_buffer.len()));

            let source = self.ready_slice();
            write_interleaved(
                source.get(offset * number_of_channels..).unwrap_or(&[]),
                first,
            );

            if next.is_empty() {
                let consumed = offset + first.len() / number_of_channels;
                if consumed < self.frame_count {
                    self.buffer_offset = Some(consumed);
                }
                return;
            }

            output_buffer = next;
        }

        let chunk_size = self.frame_count * number_of_channels;
        for data in output_buffer.chunks_mut(chunk_size) {
            self.next_quantum();
            write_interleaved(self.ready_slice(), data);

            if data.len() != chunk_size {
                // this is the last chunk, and it contained less than a full quantum
                self.buffer_offset = Some(data.len() / number_of_channels);
            }
        }
    }

    /// Fill one render quantum of separate channel slices, worklet style
    ///
    /// The quantum size is the length of the first output channel. Outputs with fewer channels
    /// than the bridge receive the first channels only, additional outputs are silent.
    pub fn render_planar(&mut self, outputs: &mut [&mut [f32]]) {
        let frame_count = match outputs.first() {
            Some(channel) => channel.len(),
            None => return,
        };

        if frame_count != self.frame_count {
            // invalid sizes are rejected by `request_frames`, in which case the old size is kept
            if frame_count > 0 && frame_count <= self.max_frame_count {
                self.frame_count = frame_count;
            }
        }

        self.next_quantum();
        buffer::deinterleave(self.ready_slice(), self.number_of_channels, outputs);
    }
}

impl Drop for BridgeRenderer {
    fn drop(&mut self) {
        if let Some(spent) = self.playing.take() {
            let _ = self.recycle_sender.try_send(spent);
        }
        log::info!("Audio render thread has been dropped");
    }
}

fn write_interleaved<S: FromSample<f32>>(source: &[f32], output: &mut [S]) {
    let mut written = 0;
    for (o, i) in output.iter_mut().zip(source) {
        *o = S::from_sample_(*i);
        written += 1;
    }
    output[written..]
        .iter_mut()
        .for_each(|o| *o = S::from_sample_(0.));
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::io;

    fn renderer(frame_count: usize) -> (io::ControlThreadInit, BridgeRenderer) {
        let (control_thread_init, render_thread_init) = io::thread_init();
        control_thread_init
            .state
            .store(BridgeState::Running as u8, Ordering::Release);
        let renderer = BridgeRenderer::new(48000., 2, frame_count, 1024, render_thread_init);
        (control_thread_init, renderer)
    }

    fn answer(control: &io::ControlThreadInit, value: f32) -> RequestToken {
        match control.event_recv.try_recv() {
            Ok(RenderEvent::AudioNeeded { token, frame_count }) => {
                let mut buffer = FrameBuffer::new(frame_count, 2);
                buffer.as_mut_slice().iter_mut().for_each(|s| *s = value);
                control
                    .ready_send
                    .try_send(FilledBuffer { token, buffer })
                    .unwrap();
                token
            }
            other => panic!("expected an audio request, got {:?}", other),
        }
    }

    #[test]
    fn test_silence_before_first_buffer() {
        let (_control, mut renderer) = renderer(128);
        let ready = renderer.get_ready_buffer();
        assert_eq!(ready.len(), 256);
        assert_float_eq!(ready, &[0.; 256][..], abs_all <= 0.);
    }

    #[test]
    fn test_single_outstanding_request() {
        let (control, mut renderer) = renderer(128);

        let token = renderer.request_frames(128).unwrap();
        assert_eq!(renderer.pending_request(), Some(token));
        assert_eq!(
            renderer.request_frames(128),
            Err(RequestError::Outstanding(token))
        );
        assert_eq!(control.event_recv.len(), 1);

        answer(&control, 1.);
        let ready = renderer.get_ready_buffer();
        assert_float_eq!(ready, &[1.; 256][..], abs_all <= 0.);
        assert_eq!(renderer.pending_request(), None);

        let next = renderer.request_frames(128).unwrap();
        assert!(next > token);
    }

    #[test]
    fn test_buffer_is_played_once() {
        let (control, mut renderer) = renderer(4);

        renderer.request_frames(4).unwrap();
        answer(&control, 0.5);

        assert_float_eq!(renderer.get_ready_buffer(), &[0.5; 8][..], abs_all <= 0.);
        assert_float_eq!(renderer.get_ready_buffer(), &[0.; 8][..], abs_all <= 0.);

        // the spent buffer is handed back to the producer thread
        assert_eq!(control.recycle_recv.len(), 1);
    }

    #[test]
    fn test_invalid_frame_count() {
        let (_control, mut renderer) = renderer(128);
        assert_eq!(
            renderer.request_frames(0),
            Err(RequestError::InvalidFrameCount(0))
        );
        assert_eq!(
            renderer.request_frames(1025),
            Err(RequestError::InvalidFrameCount(1025))
        );
        assert_eq!(renderer.frame_count(), 128);

        // the ready buffer keeps the last admissible shape
        assert_eq!(renderer.get_ready_buffer().len(), 256);
    }

    #[test]
    fn test_not_running() {
        let (control, mut renderer) = renderer(128);
        control
            .state
            .store(BridgeState::Suspended as u8, Ordering::Release);

        assert_eq!(renderer.request_frames(64), Err(RequestError::NotRunning));
        // the shape follows the requested frame count regardless
        assert_eq!(renderer.get_ready_buffer().len(), 128);
        assert!(control.event_recv.is_empty());
    }

    #[test]
    fn test_size_mismatch_is_discarded() {
        let (control, mut renderer) = renderer(128);

        let token = renderer.request_frames(128).unwrap();
        // the callback size changes while the request is in flight
        assert_eq!(
            renderer.request_frames(64),
            Err(RequestError::Outstanding(token))
        );
        answer(&control, 1.);

        let ready = renderer.get_ready_buffer();
        assert_eq!(ready.len(), 128);
        assert_float_eq!(ready, &[0.; 128][..], abs_all <= 0.);

        // the mismatched buffer went back, and a new request can be made
        assert_eq!(control.recycle_recv.len(), 1);
        renderer.request_frames(64).unwrap();
        answer(&control, 1.);
        assert_float_eq!(renderer.get_ready_buffer(), &[1.; 128][..], abs_all <= 0.);
    }

    #[test]
    fn test_starvation_is_reported_once() {
        let (control, mut renderer) = renderer(128);

        renderer.request_frames(128).unwrap();
        for _ in 0..10 {
            let ready = renderer.get_ready_buffer();
            assert_float_eq!(ready, &[0.; 256][..], abs_all <= 0.);
        }

        assert_eq!(renderer.stats.starved_quanta.load(Ordering::Relaxed), 10);

        let events: Vec<_> = control.event_recv.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RenderEvent::AudioNeeded { .. }));
        assert!(matches!(events[1], RenderEvent::Starved { .. }));
    }

    #[test]
    fn test_render_leftover_frames() {
        let (control, mut renderer) = renderer(4);

        // first quantum is silent, and requests the next buffer
        let mut output = [9.; 6]; // 3 frames
        renderer.render(&mut output[..]);
        assert_float_eq!(&output[..], &[0.; 6][..], abs_all <= 0.);

        // one frame of silence left over, then the producer output
        answer(&control, 1.);
        let mut output = [9.; 10]; // 5 frames
        renderer.render(&mut output[..]);
        assert_float_eq!(
            &output[..],
            &[0., 0., 1., 1., 1., 1., 1., 1., 1., 1.][..],
            abs_all <= 0.
        );

        assert_eq!(renderer.stats.quanta_rendered.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_render_sample_conversion() {
        let (control, mut renderer) = renderer(2);

        let mut output = [1_f64; 4];
        renderer.render(&mut output[..]);
        assert_float_eq!(&output[..], &[0.; 4][..], abs_all <= 0.);

        answer(&control, 0.25);
        renderer.render(&mut output[..]);
        assert_float_eq!(&output[..], &[0.25; 4][..], abs_all <= 0.);
    }

    #[test]
    fn test_render_planar() {
        let (control, mut renderer) = renderer(128);

        let mut left = [9.; 3];
        let mut right = [9.; 3];
        {
            let mut outputs: [&mut [f32]; 2] = [&mut left, &mut right];
            renderer.render_planar(&mut outputs);
        }
        assert_eq!(renderer.frame_count(), 3);
        assert_float_eq!(&left[..], &[0.; 3][..], abs_all <= 0.);

        match control.event_recv.try_recv() {
            Ok(RenderEvent::AudioNeeded { token, frame_count }) => {
                assert_eq!(frame_count, 3);
                let mut buffer = FrameBuffer::new(3, 2);
                buffer
                    .as_mut_slice()
                    .copy_from_slice(&[1., -1., 2., -2., 3., -3.]);
                control
                    .ready_send
                    .try_send(FilledBuffer { token, buffer })
                    .unwrap();
            }
            other => panic!("expected an audio request, got {:?}", other),
        }

        {
            let mut outputs: [&mut [f32]; 2] = [&mut left, &mut right];
            renderer.render_planar(&mut outputs);
        }
        assert_float_eq!(&left[..], &[1., 2., 3.][..], abs_all <= 0.);
        assert_float_eq!(&right[..], &[-1., -2., -3.][..], abs_all <= 0.);
    }

    #[test]
    fn test_render_does_not_allocate() {
        let (control, mut renderer) = renderer(128);
        let mut output = vec![0.; 128 * 2];

        // buffers circulate between the renderer and this stand-in producer
        let mut spare = Vec::with_capacity(8);
        spare.push(FrameBuffer::new(128, 2));
        spare.push(FrameBuffer::new(128, 2));

        // prime the channels outside the guarded section, this issues the first request
        renderer.render(&mut output[..]);

        alloc_counter::deny_alloc(|| {
            for _ in 0..16 {
                while let Ok(event) = control.event_recv.try_recv() {
                    if let RenderEvent::AudioNeeded { token, .. } = event {
                        let mut buffer = spare.pop().unwrap();
                        buffer.as_mut_slice().iter_mut().for_each(|s| *s = 1.);
                        control
                            .ready_send
                            .try_send(FilledBuffer { token, buffer })
                            .unwrap();
                    }
                }

                renderer.render(&mut output[..]);
                assert!(output.iter().all(|&s| s == 1.));
                assert!(renderer.pending_request().is_some());

                spare.extend(control.recycle_recv.try_iter());
            }
        });

        // every delivered buffer was played, and sent back
        assert_eq!(renderer.stats.quanta_rendered.load(Ordering::Relaxed), 17);
        assert_eq!(renderer.stats.starved_quanta.load(Ordering::Relaxed), 0);
        assert_eq!(renderer.stats.requests_issued.load(Ordering::Relaxed), 17);
        assert_eq!(spare.len(), 1);
    }
}
