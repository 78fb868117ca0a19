use crate::buffer::FrameBuffer;
use crate::producer::Producer;

/// Identifies a pending "need more audio" request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(pub(crate) u64);

impl RequestToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Signals from the render thread to the producer thread
#[derive(Debug)]
pub(crate) enum RenderEvent {
    /// Fill a buffer of `frame_count` frames
    AudioNeeded {
        token: RequestToken,
        frame_count: usize,
    },
    /// No buffer was ready for a render quantum, the first of a run of starved quanta
    Starved {
        token: Option<RequestToken>,
        current_frame: u64,
    },
}

/// A buffer filled by the producer, in response to the request identified by `token`
#[derive(Debug)]
pub(crate) struct FilledBuffer {
    pub token: RequestToken,
    pub buffer: FrameBuffer,
}

/// Commands from the control handle to the producer thread
pub(crate) enum ControlMessage {
    AttachProducer { producer: Box<dyn Producer> },
    SetParameter { name: String, value: String },
    Suspend,
    Resume,
    Close,
}

impl std::fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttachProducer { .. } => f.write_str("AttachProducer"),
            Self::SetParameter { name, value } => f
                .debug_struct("SetParameter")
                .field("name", name)
                .field("value", value)
                .finish(),
            Self::Suspend => f.write_str("Suspend"),
            Self::Resume => f.write_str("Resume"),
            Self::Close => f.write_str("Close"),
        }
    }
}
