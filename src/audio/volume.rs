//! System volume control through an external command.
//!
//! The `CommandExecutor` trait keeps the controller testable without the
//! volume tool installed.

use crate::defaults::{SYSTEM_VOLUME_STEPS, VOLUME_CHANGE_MAX, VOLUME_CHANGE_MIN};
use crate::error::{Result, SayshError};
use std::collections::VecDeque;
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Default volume tool.
pub const VOLUME_COMMAND: &str = "termux-volume";

/// Trait for executing system commands.
///
/// Object-safe, Send + Sync for use in concurrent contexts.
pub trait CommandExecutor: Send + Sync {
    /// Execute a command with arguments, returning its stdout.
    fn execute(&self, command: &str, args: &[&str]) -> Result<String>;
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for Arc<E> {
    fn execute(&self, command: &str, args: &[&str]) -> Result<String> {
        (**self).execute(command, args)
    }
}

/// Production command executor using std::process::Command.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandExecutor;

impl SystemCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for SystemCommandExecutor {
    fn execute(&self, command: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(command).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SayshError::ToolNotFound {
                    tool: command.to_string(),
                }
            } else {
                SayshError::CommandFailed {
                    command: command.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SayshError::CommandFailed {
                command: command.to_string(),
                message: format!("exited with {}: {}", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Executor that records calls and replays configured responses.
#[derive(Debug, Default)]
pub struct MockCommandExecutor {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    responses: Mutex<VecDeque<Result<String>>>,
}

impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn with_response(self, response: &str) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(response.to_string()));
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: SayshError) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl CommandExecutor for MockCommandExecutor {
    fn execute(&self, command: &str, args: &[&str]) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((
                command.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
        // Unconfigured calls succeed.
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// Convert a 0-100 percentage to the system's 0-20 scale.
pub fn system_level(percent: u8) -> u32 {
    (f64::from(percent.min(100)) * f64::from(SYSTEM_VOLUME_STEPS) / 100.0).round() as u32
}

/// Tracks the playback volume and applies it to the system mixer.
pub struct VolumeController<E: CommandExecutor> {
    executor: E,
    command: String,
    current: Mutex<u8>,
}

impl<E: CommandExecutor> VolumeController<E> {
    /// `initial` is recorded without touching the system.
    pub fn new(executor: E, command: impl Into<String>, initial: u8) -> Self {
        Self {
            executor,
            command: command.into(),
            current: Mutex::new(initial.min(100)),
        }
    }

    pub fn volume(&self) -> u8 {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Set the volume, clamped to 0-100. The new value is only recorded when
    /// the command succeeds.
    pub fn set_volume(&self, percent: i32) -> Result<u8> {
        let percent = percent.clamp(0, 100) as u8;
        let level = system_level(percent);
        let level_arg = level.to_string();
        self.executor
            .execute(&self.command, &["system", &level_arg])
            .inspect_err(|e| warn!(command = %self.command, error = %e, "failed to set volume"))?;

        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = percent;
        info!(
            percent,
            level,
            steps = SYSTEM_VOLUME_STEPS,
            "volume set"
        );
        Ok(percent)
    }

    /// Adjust by `delta`, keeping the result inside the comfortable range.
    ///
    /// Returns a short human-readable outcome.
    pub fn change_volume(&self, delta: i32) -> String {
        let original = i32::from(self.volume());
        let requested = original.saturating_add(delta);

        let (target, message) = if requested < VOLUME_CHANGE_MIN {
            (
                VOLUME_CHANGE_MIN,
                format!("Volume set to minimum {}", VOLUME_CHANGE_MIN),
            )
        } else if requested > VOLUME_CHANGE_MAX {
            (
                VOLUME_CHANGE_MAX,
                format!("Volume set to maximum {}", VOLUME_CHANGE_MAX),
            )
        } else {
            (
                requested,
                format!("Volume changed from {} to {}", original, requested),
            )
        };

        match self.set_volume(target) {
            Ok(_) => message,
            Err(_) => "Failed to set volume".to_string(),
        }
    }
}

impl VolumeController<SystemCommandExecutor> {
    pub fn system(initial: u8) -> Self {
        Self::new(SystemCommandExecutor::new(), VOLUME_COMMAND, initial)
    }
}
