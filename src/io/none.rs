use std::thread;
use std::time::{Duration, Instant};

use super::{AudioBackendManager, RenderThreadInit};
use crate::context::BridgeOptions;
use crate::render::BridgeRenderer;

use crossbeam_channel::{Receiver, Sender};

const DEFAULT_SAMPLE_RATE: f32 = 48000.;

enum NoneBackendMessage {
    Resume,
    Suspend,
    Close,
}

/// Headless backend, invoking the renderer at the pace of a real sound card
pub(crate) struct NoneBackend {
    sender: Sender<NoneBackendMessage>,
    sample_rate: f32,
    number_of_channels: usize,
    frame_count: usize,
}

struct Callback {
    receiver: Receiver<NoneBackendMessage>,
    renderer: BridgeRenderer,
    running: bool,
}

impl Callback {
    fn run(mut self) {
        let frame_count = self.renderer.frame_count();
        let mut buffer = vec![0.; frame_count * self.renderer.number_of_channels()];
        let interval = Duration::from_secs_f64(frame_count as f64 / self.renderer.sample_rate() as f64);

        // For an isochronous callback we must calculate the deadline every render quantum
        let mut deadline = Instant::now() + interval;

        loop {
            // poll the receiver as long as the deadline is in the future
            while let Ok(msg) = self.receiver.recv_deadline(deadline) {
                match msg {
                    NoneBackendMessage::Close => {
                        log::debug!("Closing headless output stream");
                        return;
                    }
                    NoneBackendMessage::Resume => {
                        self.running = true;
                        deadline = Instant::now() + interval;
                        break; // start processing right away
                    }
                    NoneBackendMessage::Suspend => self.running = false,
                }
            }

            if self.running {
                self.renderer.render(&mut buffer[..]);
            }

            deadline += interval;
        }
    }
}

impl AudioBackendManager for NoneBackend {
    fn build_output(options: BridgeOptions, render_thread_init: RenderThreadInit) -> Self
    where
        Self: Sized,
    {
        let sample_rate = options.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let number_of_channels = options.number_of_channels;
        let frame_count = super::buffer_size_for_latency_category(options.latency_hint, sample_rate)
            .min(options.max_frame_count);

        let renderer = BridgeRenderer::new(
            sample_rate,
            number_of_channels,
            frame_count,
            options.max_frame_count,
            render_thread_init,
        );

        let (sender, receiver) = crossbeam_channel::unbounded();

        let callback = Callback {
            renderer,
            receiver,
            running: true,
        };

        thread::spawn(move || callback.run());
        log::debug!(
            "Headless output stream: {} Hz, {} channels, {} frames",
            sample_rate,
            number_of_channels,
            frame_count
        );

        Self {
            sender,
            sample_rate,
            number_of_channels,
            frame_count,
        }
    }

    fn resume(&self) -> bool {
        self.sender.send(NoneBackendMessage::Resume).is_ok()
    }

    fn suspend(&self) -> bool {
        self.sender.send(NoneBackendMessage::Suspend).is_ok()
    }

    fn close(&self) {
        let _ = self.sender.send(NoneBackendMessage::Close);
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn number_of_channels(&self) -> usize {
        self.number_of_channels
    }

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn output_latency(&self) -> f64 {
        0.
    }

    fn sink_id(&self) -> &str {
        "none"
    }
}
