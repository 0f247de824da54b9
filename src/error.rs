//! Error types for saysh.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SayshError {
    // Configuration errors
    #[error("Model is required")]
    ModelRequired,

    #[error("{what} is required")]
    InputRequired { what: String },

    #[error("Credential not configured: {name}")]
    CredentialMissing { name: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Synthesis task failed: {message}")]
    TaskFailed { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Deadlines
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    // Lifecycle errors
    #[error("Invalid task: {message}")]
    InvalidTask { message: String },

    #[error("No active session, call start_session() first")]
    NoActiveSession,

    // Transport and device errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Audio output failed: {message}")]
    AudioOutput { message: String },

    #[error("Command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command not found: {tool}")]
    ToolNotFound { tool: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a [`SayshError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Missing model, credential or format. Fatal at construction.
    Configuration,
    /// Malformed inbound message or a failed remote task.
    Protocol,
    /// Connect, start or completion deadline elapsed.
    Timeout,
    /// Operation issued in the wrong lifecycle state.
    InvalidState,
    /// Socket, playback process or external command failure.
    Transport,
    Io,
    Other,
}

impl SayshError {
    /// Classify this error.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::ModelRequired
            | Self::InputRequired { .. }
            | Self::CredentialMissing { .. }
            | Self::ConfigParse { .. }
            | Self::ConfigInvalidValue { .. }
            | Self::Config(_) => FaultKind::Configuration,
            Self::Protocol { .. } | Self::TaskFailed { .. } | Self::Json(_) => FaultKind::Protocol,
            Self::Timeout { .. } => FaultKind::Timeout,
            Self::InvalidTask { .. } | Self::NoActiveSession => FaultKind::InvalidState,
            Self::Transport { .. }
            | Self::AudioOutput { .. }
            | Self::CommandFailed { .. }
            | Self::ToolNotFound { .. } => FaultKind::Transport,
            Self::Io(_) => FaultKind::Io,
            Self::Other(_) => FaultKind::Other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == FaultKind::Timeout
    }

    pub(crate) fn invalid_task(message: impl Into<String>) -> Self {
        Self::InvalidTask {
            message: message.into(),
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

pub type Result<T> = std::result::Result<T, SayshError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_model_required_display() {
        assert_eq!(SayshError::ModelRequired.to_string(), "Model is required");
    }

    #[test]
    fn test_input_required_display() {
        let error = SayshError::InputRequired {
            what: "format".to_string(),
        };
        assert_eq!(error.to_string(), "format is required");
    }

    #[test]
    fn test_credential_missing_display() {
        let error = SayshError::CredentialMissing {
            name: "DASHSCOPE_API_KEY".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Credential not configured: DASHSCOPE_API_KEY"
        );
    }

    #[test]
    fn test_timeout_display_uses_milliseconds() {
        let error = SayshError::timeout("task start", Duration::from_secs(10));
        assert_eq!(error.to_string(), "task start timed out after 10000ms");
    }

    #[test]
    fn test_invalid_task_display() {
        let error = SayshError::invalid_task("speech synthesis task has stopped");
        assert_eq!(
            error.to_string(),
            "Invalid task: speech synthesis task has stopped"
        );
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(SayshError::ModelRequired.kind(), FaultKind::Configuration);
        assert_eq!(
            SayshError::TaskFailed {
                message: "x".to_string()
            }
            .kind(),
            FaultKind::Protocol
        );
        assert_eq!(
            SayshError::timeout("connect", Duration::from_secs(5)).kind(),
            FaultKind::Timeout
        );
        assert_eq!(SayshError::NoActiveSession.kind(), FaultKind::InvalidState);
        assert_eq!(
            SayshError::Transport {
                message: "reset".to_string()
            }
            .kind(),
            FaultKind::Transport
        );
        assert!(SayshError::timeout("finish", Duration::from_millis(1)).is_timeout());
        assert!(!SayshError::NoActiveSession.is_timeout());
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let error: SayshError = io_error.into();
        assert!(error.to_string().contains("pipe closed"));
        assert_eq!(error.kind(), FaultKind::Io);
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: SayshError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: SayshError = io_error.into();
        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<SayshError>();
        assert_sync::<SayshError>();
    }
}
