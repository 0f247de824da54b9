//! saysh - streaming speech playback
//!
//! Feeds text to a duplex streaming synthesis service and plays the audio
//! as it arrives, one utterance at a time, with barge-in.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod hooks;
pub mod player;
pub mod protocol;
pub mod queue;
pub mod speaker;
pub mod transport;

// Audio output
pub use audio::{AudioSink, CommandExecutor, MemorySink, ProcessSink, VolumeController};

// Playback
pub use player::{Orchestrator, PlaybackMetrics, SessionSettings, SlotPhase};
pub use queue::{AdmitOutcome, Admission, AsyncQueue, PostPlayHook, SyncQueue, TextStream};
pub use speaker::Speaker;

// Transport
pub use protocol::{AudioFormat, SynthesisParameters};
pub use transport::{Connector, SessionObserver, SynthesisSession, TaskState};

// Collaborators
pub use hooks::{CommandChannel, QueryHandler, QueryRouter, WakeupHook};

// Error handling
pub use error::{FaultKind, Result, SayshError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
