//! Wire format of the duplex streaming synthesis service.

pub mod format;
pub mod frames;

pub use format::AudioFormat;
pub use frames::{
    Action, InboundMessage, StreamingMode, SynthesisParameters, TaskEvent, TaskRequest,
};
