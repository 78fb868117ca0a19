//! The sample generating side of the bridge

use std::f64::consts::PI;

/// Interface for sample generating code that runs on the producer thread.
///
/// The producer is never called from the real-time audio callback, so it is allowed to allocate,
/// lock and call into arbitrary code. It should still complete within `frame_count / sample_rate`
/// seconds, otherwise the audio callback will run out of buffers and play silence.
pub trait Producer: Send {
    /// Write `frame_count` interleaved frames of `channel_count` samples into `buffer`
    ///
    /// The buffer length is always exactly `frame_count * channel_count`. Its contents are those
    /// of a previous fill (or silence), so every sample should be overwritten.
    fn fill(&mut self, buffer: &mut [f32], frame_count: usize, channel_count: usize);

    /// Receive a named parameter change
    ///
    /// Called on the producer thread, in between fills. Unknown parameters are ignored by default.
    fn set_parameter(&mut self, name: &str, value: &str) {
        log::debug!("Ignoring parameter {} = {}", name, value);
    }
}

impl<F> Producer for F
where
    F: FnMut(&mut [f32], usize, usize) + Send,
{
    fn fill(&mut self, buffer: &mut [f32], frame_count: usize, channel_count: usize) {
        (self)(buffer, frame_count, channel_count)
    }
}

/// Sine oscillator, writing the same value to all channels of a frame
///
/// Supports the `frequency` parameter (in Hertz).
#[derive(Debug, Clone)]
pub struct SineProducer {
    phase: f64,
    frequency: f64,
    sample_rate: f64,
}

impl SineProducer {
    pub fn new(frequency: f32, sample_rate: f32) -> Self {
        crate::assert_valid_sample_rate(sample_rate);

        Self {
            phase: 0.,
            frequency: frequency as f64,
            sample_rate: sample_rate as f64,
        }
    }

    pub fn frequency(&self) -> f32 {
        self.frequency as f32
    }

    pub fn set_frequency(&mut self, frequency: f32) {
        self.frequency = frequency as f64;
    }

    fn next_sample(&mut self) -> f32 {
        self.phase += self.frequency * 2. * PI / self.sample_rate;
        // keep precision for long running streams
        if self.phase >= 2. * PI {
            self.phase -= 2. * PI;
        }
        self.phase.sin() as f32
    }
}

impl Default for SineProducer {
    fn default() -> Self {
        Self::new(220., 44_100.)
    }
}

impl Producer for SineProducer {
    fn fill(&mut self, buffer: &mut [f32], _frame_count: usize, channel_count: usize) {
        for frame in buffer.chunks_mut(channel_count) {
            let value = self.next_sample();
            frame.iter_mut().for_each(|s| *s = value);
        }
    }

    fn set_parameter(&mut self, name: &str, value: &str) {
        match (name, value.parse::<f32>()) {
            ("frequency", Ok(frequency)) if frequency.is_finite() => self.set_frequency(frequency),
            ("frequency", _) => log::warn!("Invalid frequency {:?}", value),
            _ => log::debug!("Ignoring parameter {} = {}", name, value),
        }
    }
}
