//! Single-slot playback: one synthesis session at a time, fed into one sink.

pub mod metrics;
pub mod orchestrator;

pub use metrics::PlaybackMetrics;
pub use orchestrator::{Orchestrator, SessionSettings, SlotPhase};
