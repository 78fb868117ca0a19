//! Primitives related to the real-time audio callback

mod thread;
pub use thread::*;

pub use crate::message::RequestToken;
