//! Per-session playback metrics.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Snapshot of the current (or last) session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybackMetrics {
    pub request_id: Option<String>,
    /// First submitted text to first audio byte.
    pub first_audio_delay_ms: Option<f64>,
    /// Audio bytes accepted for playback or export.
    pub audio_bytes: u64,
    /// First submitted text to session close.
    pub total_duration_ms: Option<f64>,
}

impl PlaybackMetrics {
    pub(crate) fn for_request(request_id: &str) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            ..Self::default()
        }
    }

    pub fn first_audio_delay(&self) -> Option<Duration> {
        self.first_audio_delay_ms
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

impl fmt::Display for PlaybackMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request {}: {} bytes",
            self.request_id.as_deref().unwrap_or("-"),
            self.audio_bytes
        )?;
        if let Some(delay) = self.first_audio_delay_ms {
            write!(f, ", first audio after {:.0}ms", delay)?;
        }
        if let Some(total) = self.total_duration_ms {
            write!(f, ", total {:.0}ms", total)?;
        }
        Ok(())
    }
}
