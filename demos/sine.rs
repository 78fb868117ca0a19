use worklet_bridge::context::{Bridge, BridgeOptions, LatencyCategory};
use worklet_bridge::producer::SineProducer;

// Play a sine tone through the default audio output
//
// `cargo run --release --example sine`
//
// Use `BRIDGE_LATENCY=interactive` to request 128 frames at a time instead of 1024
//
// `BRIDGE_LATENCY=interactive cargo run --release --example sine`
fn main() {
    env_logger::init();

    let latency_hint = match std::env::var("BRIDGE_LATENCY").as_deref() {
        Ok("interactive") => LatencyCategory::Interactive,
        Ok("balanced") => LatencyCategory::Balanced,
        _ => LatencyCategory::default(),
    };

    let options = BridgeOptions {
        latency_hint,
        ..BridgeOptions::default()
    };
    let bridge = Bridge::new(options);
    bridge.attach_producer(SineProducer::new(220., bridge.sample_rate()));

    println!(
        "Playing 220 Hz at {} Hz, {} channels, {} frames per quantum",
        bridge.sample_rate(),
        bridge.number_of_channels(),
        bridge.frame_count()
    );
    std::thread::sleep(std::time::Duration::from_secs(4));

    println!("Suspend for 1 second - state {:?}", bridge.state());
    bridge.suspend().unwrap();
    std::thread::sleep(std::time::Duration::from_secs(1));

    bridge.resume().unwrap();
    println!("Resumed - state {:?}", bridge.state());
    std::thread::sleep(std::time::Duration::from_secs(2));

    bridge.close();
    println!("Closed - {:?}", bridge.stats());
}
