use std::thread;
use std::time::{Duration, Instant};

use float_eq::assert_float_eq;

use worklet_bridge::context::{Bridge, BridgeOptions, BridgeState, LatencyCategory};
use worklet_bridge::producer::Producer;

struct PanicProducer;

impl Producer for PanicProducer {
    fn fill(&mut self, _buffer: &mut [f32], _frame_count: usize, _channel_count: usize) {
        panic!("panic message");
    }
}

#[test]
fn test_producer_error() {
    let options = BridgeOptions {
        latency_hint: LatencyCategory::Interactive,
        ..BridgeOptions::default()
    };
    let (bridge, mut renderer) = Bridge::detached(options);
    bridge.attach_producer(PanicProducer);

    // the failing producer is detached, the output is muted
    let start = Instant::now();
    let mut output = vec![1.; 128 * 2];
    let mut issued_request = false;
    while !(issued_request && bridge.state() == BridgeState::Suspended) {
        assert!(start.elapsed() < Duration::from_secs(5));
        renderer.render(&mut output[..]);
        assert_float_eq!(&output[..], &[0.; 256][..], abs_all <= 0.);
        issued_request |= bridge.stats().requests_issued > 0;
        thread::sleep(Duration::from_millis(1));
    }

    // a replacement producer takes over, the bridge keeps running
    bridge.attach_producer(|buffer: &mut [f32], _: usize, _: usize| {
        buffer.iter_mut().for_each(|s| *s = 1.)
    });

    let start = Instant::now();
    loop {
        assert!(start.elapsed() < Duration::from_secs(5));
        renderer.render(&mut output[..]);
        if output.iter().all(|&s| s == 1.) {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(bridge.state(), BridgeState::Running);
}
