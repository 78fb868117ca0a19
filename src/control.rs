//! The producer thread: calls into the producer and hands out filled buffers

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::buffer::FrameBuffer;
use crate::context::BridgeState;
use crate::io::ControlThreadInit;
use crate::message::{ControlMessage, FilledBuffer, RenderEvent, RequestToken};
use crate::producer::Producer;
use crate::stats::SharedStats;

/// Maximum number of recycled buffers kept around for reuse
const POOL_CAPACITY: usize = 3;

/// Operations running off the system-level audio callback, on behalf of the producer
pub(crate) struct ProducerThread {
    producer: Option<Box<dyn Producer>>,
    sample_rate: f32,
    number_of_channels: usize,
    /// suspended by the control handle, independent of a producer being attached
    suspended: bool,
    state: Arc<AtomicU8>,
    frames_played: Arc<AtomicU64>,
    stats: Arc<SharedStats>,
    event_receiver: Receiver<RenderEvent>,
    ctrl_msg_receiver: Receiver<ControlMessage>,
    ready_sender: Sender<FilledBuffer>,
    recycle_receiver: Receiver<FrameBuffer>,
    pool: Vec<FrameBuffer>,
    /// request that arrived while no producer was available
    deferred: Option<(RequestToken, usize)>,
}

impl ProducerThread {
    pub fn new(
        sample_rate: f32,
        number_of_channels: usize,
        ctrl_msg_receiver: Receiver<ControlMessage>,
        control_thread_init: ControlThreadInit,
    ) -> Self {
        let ControlThreadInit {
            state,
            frames_played,
            stats,
            event_recv,
            ready_send,
            recycle_recv,
        } = control_thread_init;

        Self {
            producer: None,
            sample_rate,
            number_of_channels,
            suspended: false,
            state,
            frames_played,
            stats,
            event_receiver: event_recv,
            ctrl_msg_receiver,
            ready_sender: ready_send,
            recycle_receiver: recycle_recv,
            pool: Vec::with_capacity(POOL_CAPACITY + 1),
            deferred: None,
        }
    }

    /// Handle requests and control messages until the bridge is closed
    pub fn run(mut self) {
        log::info!("Entering producer thread");

        // the handlers below need `&mut self`, select on handles of our own
        let event_receiver = self.event_receiver.clone();
        let ctrl_msg_receiver = self.ctrl_msg_receiver.clone();

        loop {
            let running = crossbeam_channel::select! {
                recv(event_receiver) -> event => match event {
                    Ok(event) => {
                        self.handle_render_event(event);
                        true
                    }
                    // the renderer has been dropped, nothing left to produce for
                    Err(_) => false,
                },
                recv(ctrl_msg_receiver) -> msg => match msg {
                    Ok(msg) => self.handle_control_message(msg),
                    // the control handle has been dropped
                    Err(_) => false,
                },
            };

            if !running {
                break;
            }
        }

        self.set_state(BridgeState::Closed);
        log::info!("Exiting producer thread");
    }

    fn handle_control_message(&mut self, msg: ControlMessage) -> bool {
        use ControlMessage::*;

        match msg {
            AttachProducer { producer } => {
                if self.producer.replace(producer).is_some() {
                    log::debug!("Replaced producer");
                }
                self.update_state();
                if let Some((token, frame_count)) = self.deferred.take() {
                    log::debug!("Serving deferred request {:?}", token);
                    self.serve(token, frame_count);
                }
            }
            SetParameter { name, value } => match self.producer.as_mut() {
                Some(producer) => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        producer.set_parameter(&name, &value)
                    }));
                    if result.is_err() {
                        self.producer_failed();
                    }
                }
                None => log::warn!("No producer attached, dropping parameter {}", name),
            },
            Suspend => {
                self.suspended = true;
                self.update_state();
            }
            Resume => {
                self.suspended = false;
                self.update_state();
            }
            Close => return false,
        }

        true
    }

    fn handle_render_event(&mut self, event: RenderEvent) {
        match event {
            RenderEvent::AudioNeeded { token, frame_count } => self.serve(token, frame_count),
            RenderEvent::Starved {
                token,
                current_frame,
            } => {
                log::warn!(
                    "Audio callback starved at {:.3}s, waiting for {:?}",
                    current_frame as f64 / self.sample_rate as f64,
                    token
                );
            }
        }
    }

    fn serve(&mut self, token: RequestToken, frame_count: usize) {
        let mut buffer = self.take_buffer(frame_count);

        let producer = match self.producer.as_mut() {
            Some(producer) => producer,
            None => {
                // environment not ready, answer as soon as a producer is attached
                self.deferred = Some((token, frame_count));
                self.release(buffer);
                return;
            }
        };

        let number_of_channels = self.number_of_channels;
        let fill_start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            producer.fill(buffer.as_mut_slice(), frame_count, number_of_channels)
        }));
        let duration = fill_start.elapsed();

        if result.is_err() {
            self.producer_failed();
            // keep the request, a replacement producer will answer it
            self.deferred = Some((token, frame_count));
            buffer.make_silent();
            self.release(buffer);
            return;
        }

        let budget = Duration::from_secs_f64(frame_count as f64 / self.sample_rate as f64);
        if duration > budget {
            SharedStats::increment(&self.stats.fill_overruns);
            log::warn!(
                "Producer took {:?} to fill {} frames, budget is {:?}",
                duration,
                frame_count,
                budget
            );
        }

        match self.ready_sender.try_send(FilledBuffer { token, buffer }) {
            Ok(()) => SharedStats::increment(&self.stats.buffers_delivered),
            Err(TrySendError::Full(filled)) => {
                // cannot happen with a single outstanding request
                log::error!("Ready channel full, dropping buffer for {:?}", filled.token);
                self.release(filled.buffer);
            }
            Err(TrySendError::Disconnected(filled)) => self.release(filled.buffer),
        }
    }

    /// Take a buffer of the right shape from the pool, or allocate one
    fn take_buffer(&mut self, frame_count: usize) -> FrameBuffer {
        self.pool.extend(self.recycle_receiver.try_iter());

        let number_of_channels = self.number_of_channels;
        if let Some(index) = self
            .pool
            .iter()
            .position(|b| b.has_shape(frame_count, number_of_channels))
        {
            return self.pool.swap_remove(index);
        }

        // buffers of an outdated size will not be used again
        self.pool.clear();
        SharedStats::increment(&self.stats.reallocations);
        log::debug!(
            "Allocating buffer of {} frames, {} channels",
            frame_count,
            number_of_channels
        );
        FrameBuffer::new(frame_count, number_of_channels)
    }

    fn release(&mut self, buffer: FrameBuffer) {
        if self.pool.len() < POOL_CAPACITY {
            self.pool.push(buffer);
        }
    }

    fn producer_failed(&mut self) {
        log::error!("Producer panicked, it is no longer used and the output is silenced");
        self.producer = None;
        self.update_state();
    }

    fn update_state(&self) {
        let state = if self.suspended || self.producer.is_none() {
            BridgeState::Suspended
        } else {
            BridgeState::Running
        };
        self.set_state(state);
    }

    /// Store the new state, a closed bridge stays closed
    fn set_state(&self, state: BridgeState) {
        let closed = BridgeState::Closed as u8;
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |previous| {
                if previous == closed {
                    None
                } else {
                    Some(state as u8)
                }
            });
        if matches!(result, Ok(previous) if previous != state as u8) {
            log::debug!(
                "Bridge state {:?} at {:.3}s",
                state,
                self.frames_played.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
            );
        }
    }
}

impl Drop for ProducerThread {
    fn drop(&mut self) {
        log::info!(
            "Producer thread has been dropped, releasing {} buffers",
            self.pool.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::io::{self, RenderThreadInit};

    fn producer_thread() -> (
        ProducerThread,
        RenderThreadInit,
        Sender<ControlMessage>,
    ) {
        let (control_thread_init, render_thread_init) = io::thread_init();
        let (ctrl_send, ctrl_recv) = crossbeam_channel::bounded(8);
        let thread = ProducerThread::new(1000., 2, ctrl_recv, control_thread_init);
        (thread, render_thread_init, ctrl_send)
    }

    fn state(init: &RenderThreadInit) -> u8 {
        init.state.load(Ordering::Acquire)
    }

    #[test]
    fn test_deferred_until_attached() {
        let (mut thread, render, _ctrl) = producer_thread();
        assert_eq!(state(&render), BridgeState::Suspended as u8);

        thread.serve(RequestToken(0), 4);
        assert!(render.ready_recv.is_empty());

        let producer = |b: &mut [f32], _: usize, _: usize| b.iter_mut().for_each(|s| *s = 1.);
        thread.handle_control_message(ControlMessage::AttachProducer {
            producer: Box::new(producer),
        });
        assert_eq!(state(&render), BridgeState::Running as u8);

        let filled = render.ready_recv.try_recv().unwrap();
        assert_eq!(filled.token, RequestToken(0));
        assert_float_eq!(filled.buffer.as_slice(), &[1.; 8][..], abs_all <= 0.);
    }

    #[test]
    fn test_buffers_are_reused() {
        let (mut thread, render, _ctrl) = producer_thread();
        thread.handle_control_message(ControlMessage::AttachProducer {
            producer: Box::new(|_: &mut [f32], _: usize, _: usize| {}),
        });

        for i in 0..5 {
            thread.serve(RequestToken(i), 16);
            let filled = render.ready_recv.try_recv().unwrap();
            render.recycle_send.try_send(filled.buffer).unwrap();
        }
        assert_eq!(thread.stats.reallocations.load(Ordering::Relaxed), 1);

        // a new size reallocates and drops the outdated buffers
        thread.serve(RequestToken(5), 32);
        let filled = render.ready_recv.try_recv().unwrap();
        assert_eq!(filled.buffer.frame_count(), 32);
        assert_eq!(thread.stats.reallocations.load(Ordering::Relaxed), 2);
        assert!(thread.pool.is_empty());
    }

    #[test]
    fn test_panicking_producer() {
        let (mut thread, render, _ctrl) = producer_thread();
        thread.handle_control_message(ControlMessage::AttachProducer {
            producer: Box::new(|_: &mut [f32], _: usize, _: usize| panic!("producer failure")),
        });
        assert_eq!(state(&render), BridgeState::Running as u8);

        thread.serve(RequestToken(0), 4);
        assert!(render.ready_recv.is_empty());
        assert!(thread.producer.is_none());
        assert_eq!(state(&render), BridgeState::Suspended as u8);

        // a replacement producer answers the failed request
        thread.handle_control_message(ControlMessage::AttachProducer {
            producer: Box::new(|b: &mut [f32], _: usize, _: usize| {
                b.iter_mut().for_each(|s| *s = 0.5)
            }),
        });
        let filled = render.ready_recv.try_recv().unwrap();
        assert_eq!(filled.token, RequestToken(0));
        assert_float_eq!(filled.buffer.as_slice(), &[0.5; 8][..], abs_all <= 0.);
    }

    #[test]
    fn test_suspend_resume() {
        let (mut thread, render, _ctrl) = producer_thread();
        thread.handle_control_message(ControlMessage::AttachProducer {
            producer: Box::new(|_: &mut [f32], _: usize, _: usize| {}),
        });
        assert!(thread.handle_control_message(ControlMessage::Suspend));
        assert_eq!(state(&render), BridgeState::Suspended as u8);
        assert!(thread.handle_control_message(ControlMessage::Resume));
        assert_eq!(state(&render), BridgeState::Running as u8);
        assert!(!thread.handle_control_message(ControlMessage::Close));
    }

    #[test]
    fn test_closed_state_is_final() {
        let (mut thread, render, _ctrl) = producer_thread();
        render
            .state
            .store(BridgeState::Closed as u8, Ordering::Release);

        // messages handled after the control handle closed the bridge do not reopen it
        thread.handle_control_message(ControlMessage::AttachProducer {
            producer: Box::new(|_: &mut [f32], _: usize, _: usize| {}),
        });
        thread.handle_control_message(ControlMessage::Resume);
        assert_eq!(state(&render), BridgeState::Closed as u8);
    }

    #[test]
    fn test_fill_overrun() {
        let (mut thread, render, _ctrl) = producer_thread();
        thread.handle_control_message(ControlMessage::AttachProducer {
            producer: Box::new(|_: &mut [f32], _: usize, _: usize| {
                std::thread::sleep(Duration::from_millis(20))
            }),
        });

        // 4 frames at 1 kHz is a 4ms budget
        thread.serve(RequestToken(0), 4);
        assert!(render.ready_recv.try_recv().is_ok());
        assert_eq!(thread.stats.fill_overruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_run_exits_on_close() {
        let (thread, render, ctrl) = producer_thread();
        let state = Arc::clone(&render.state);
        let handle = std::thread::spawn(move || thread.run());

        ctrl.send(ControlMessage::Close).unwrap();
        handle.join().unwrap();
        assert_eq!(state.load(Ordering::Acquire), BridgeState::Closed as u8);
    }
}
