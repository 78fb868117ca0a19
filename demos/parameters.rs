use std::io::{self, BufRead};

use worklet_bridge::context::{Bridge, BridgeOptions};
use worklet_bridge::producer::SineProducer;

// Change the pitch of a sine tone while it plays
//
// Type `frequency 440` (or any `name value` pair) and hit enter, an empty line quits.
//
// `cargo run --release --example parameters`
fn main() {
    env_logger::init();

    let bridge = Bridge::new(BridgeOptions::default());
    bridge.attach_producer(SineProducer::new(220., bridge.sample_rate()));

    println!("Enter `<name> <value>`, empty line to quit");

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        let mut parts = line.split_whitespace();
        let (name, value) = match (parts.next(), parts.next()) {
            (Some(name), Some(value)) => (name, value),
            (None, _) => break,
            (Some(_), None) => {
                println!("missing value");
                continue;
            }
        };

        if let Err(e) = bridge.set_parameter(name, value) {
            println!("{}", e);
            break;
        }
    }

    bridge.close();
    println!("{:?}", bridge.stats());
}
