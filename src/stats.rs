//! Bookkeeping of the bridge, shared between the render thread and the control thread

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters, written by both threads and read by the control handle
#[derive(Debug, Default)]
pub(crate) struct SharedStats {
    pub quanta_rendered: AtomicU64,
    pub frames_rendered: AtomicU64,
    pub starved_quanta: AtomicU64,
    pub requests_issued: AtomicU64,
    pub buffers_delivered: AtomicU64,
    pub fill_overruns: AtomicU64,
    pub reallocations: AtomicU64,
}

impl SharedStats {
    #[inline(always)]
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            quanta_rendered: self.quanta_rendered.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            starved_quanta: self.starved_quanta.load(Ordering::Relaxed),
            requests_issued: self.requests_issued.load(Ordering::Relaxed),
            buffers_delivered: self.buffers_delivered.load(Ordering::Relaxed),
            fill_overruns: self.fill_overruns.load(Ordering::Relaxed),
            reallocations: self.reallocations.load(Ordering::Relaxed),
        }
    }
}

/// Point in time copy of the bridge counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Render quanta handed to the audio callback
    pub quanta_rendered: u64,
    /// Frames handed to the audio callback, silence included
    pub frames_rendered: u64,
    /// Render quanta for which no buffer was ready while the bridge was running
    pub starved_quanta: u64,
    /// Fill requests sent to the producer thread
    pub requests_issued: u64,
    /// Filled buffers handed to the render thread
    pub buffers_delivered: u64,
    /// Fills that took longer than the playback duration of the buffer
    pub fill_overruns: u64,
    /// Buffers allocated because no recycled buffer had the requested size
    pub reallocations: u64,
}

impl BridgeStats {
    /// Fraction of running render quanta that were starved
    pub fn underrun_ratio(&self) -> f64 {
        if self.quanta_rendered == 0 {
            return 0.;
        }
        self.starved_quanta as f64 / self.quanta_rendered as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = SharedStats::default();
        SharedStats::increment(&stats.quanta_rendered);
        SharedStats::increment(&stats.quanta_rendered);
        SharedStats::increment(&stats.starved_quanta);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.quanta_rendered, 2);
        assert_eq!(snapshot.starved_quanta, 1);
        assert_eq!(snapshot.requests_issued, 0);
        assert!((snapshot.underrun_ratio() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_underrun_ratio_empty() {
        assert_eq!(BridgeStats::default().underrun_ratio(), 0.);
    }
}
