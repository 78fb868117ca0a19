//! Audio signal data structures

/// Fixed size block of interleaved audio frames
///
/// A `FrameBuffer` is allocated once on the control thread and refilled many times. It only ever
/// has one owner: the control thread while the producer writes into it, the render thread while
/// it is being played out.
#[derive(Clone, Debug)]
pub struct FrameBuffer {
    data: Box<[f32]>,
    number_of_channels: usize,
}

impl FrameBuffer {
    /// Allocate a silent buffer of `frame_count` frames of `number_of_channels` samples each
    pub fn new(frame_count: usize, number_of_channels: usize) -> Self {
        crate::assert_valid_number_of_channels(number_of_channels);

        Self {
            data: vec![0.; frame_count * number_of_channels].into_boxed_slice(),
            number_of_channels,
        }
    }

    /// Number of frames, i.e. samples per channel
    pub fn frame_count(&self) -> usize {
        self.data.len() / self.number_of_channels
    }

    pub fn number_of_channels(&self) -> usize {
        self.number_of_channels
    }

    /// Total number of samples (`frame_count * number_of_channels`)
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check if this buffer can hold exactly the given shape without reallocation
    pub fn has_shape(&self, frame_count: usize, number_of_channels: usize) -> bool {
        self.number_of_channels == number_of_channels
            && self.data.len() == frame_count * number_of_channels
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data[..]
    }

    /// Overwrite all samples with zeroes
    pub fn make_silent(&mut self) {
        self.data.iter_mut().for_each(|s| *s = 0.);
    }

    /// Iterate the samples of a single channel
    pub fn channel(&self, index: usize) -> impl Iterator<Item = &f32> {
        self.data.iter().skip(index).step_by(self.number_of_channels)
    }
}

/// Copy interleaved samples into separate channel slices
///
/// Outputs with fewer channels than the source take the first channels, so a mono output plays
/// channel 0 (the left channel). Outputs with more channels are padded with silence. Frames
/// missing from `source` are written as silence.
pub(crate) fn deinterleave(source: &[f32], number_of_channels: usize, outputs: &mut [&mut [f32]]) {
    for (index, output) in outputs.iter_mut().enumerate() {
        if index >= number_of_channels {
            output.iter_mut().for_each(|s| *s = 0.);
            continue;
        }

        let channel = source.iter().skip(index).step_by(number_of_channels);
        let mut written = 0;
        for (o, i) in output.iter_mut().zip(channel) {
            *o = *i;
            written += 1;
        }
        output[written..].iter_mut().for_each(|s| *s = 0.);
    }
}
