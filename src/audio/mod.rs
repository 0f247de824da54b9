//! Audio output side: playback sink, system volume and WAV export.

pub mod sink;
pub mod volume;
pub mod wav;

pub use sink::{AudioSink, MemorySink, ProcessSink, WriteOutcome};
pub use volume::{CommandExecutor, MockCommandExecutor, SystemCommandExecutor, VolumeController};
