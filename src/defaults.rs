//! Default configuration constants for saysh.
//!
//! Shared by the configuration types, the transport session and the queues
//! so every layer agrees on the same deadlines and capacities.

use std::time::Duration;

/// Playback sample rate in Hz.
///
/// The playback process and the WAV export both assume 16 kHz mono,
/// 16-bit signed little-endian PCM.
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes per PCM sample (16-bit).
pub const BYTES_PER_SAMPLE: u32 = 2;

/// Service endpoint for the duplex synthesis protocol.
pub const SERVICE_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference";

/// Environment variable holding the service credential.
pub const API_KEY_ENV: &str = "DASHSCOPE_API_KEY";

pub const DEFAULT_MODEL: &str = "cosyvoice-v2";

pub const DEFAULT_VOICE: &str = "longhua_v2";

/// Transport-level connect deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the `task-started` acknowledgment after `run-task`.
pub const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for `task-finished` after `finish-task`.
pub const COMPLETE_TIMEOUT: Duration = Duration::from_secs(600);

/// Capacity of the synchronous retry queue.
pub const SYNC_QUEUE_CAPACITY: usize = 10;

/// Capacity of the drop-oldest asynchronous queue.
pub const ASYNC_QUEUE_CAPACITY: usize = 1;

/// Async queue items older than this at dequeue time are discarded.
pub const ASYNC_QUEUE_TTL: Duration = Duration::from_secs(3);

/// Poll/retry interval shared by the queue workers and completion waits.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Silence appended to playback after each session so the tail is not clipped.
pub const TAIL_SILENCE_MS: u32 = 150;

/// Graceful exit deadline for the playback process after its input closes.
pub const SINK_CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Deadline between SIGTERM and SIGKILL for the playback process.
pub const SINK_TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Initial playback volume in percent.
pub const VOLUME_PERCENT: u8 = 50;

/// Bounds applied by relative volume changes.
pub const VOLUME_CHANGE_MIN: i32 = 5;
pub const VOLUME_CHANGE_MAX: i32 = 35;

/// Upper end of the system volume scale.
pub const SYSTEM_VOLUME_STEPS: u32 = 20;

/// Number of silent bytes covering `ms` milliseconds of playback audio.
pub fn silence_bytes(ms: u32) -> usize {
    (SAMPLE_RATE as usize * BYTES_PER_SAMPLE as usize * ms as usize) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_silence_is_4800_bytes() {
        assert_eq!(silence_bytes(TAIL_SILENCE_MS), 4800);
    }

    #[test]
    fn deadlines_are_ordered() {
        assert!(CONNECT_TIMEOUT < START_TIMEOUT);
        assert!(START_TIMEOUT < COMPLETE_TIMEOUT);
    }
}
