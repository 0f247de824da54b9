//! Adapters for the processes around the speaker: a command channel to a
//! companion program and a push interface for incoming queries.

use crate::error::{Result, SayshError};
use crate::player::metrics::millis;
use crate::queue::{PostPlayHook, preview};
use crate::speaker::Speaker;
use async_trait::async_trait;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const STOP_GRACE: Duration = Duration::from_millis(500);

/// Line-oriented control channel to another process.
pub trait CommandChannel: Send + Sync {
    fn send_command(&self, name: &str) -> Result<()>;

    fn is_running(&self) -> bool;
}

struct ChildState {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Writes commands to a spawned child's stdin, one per line.
pub struct ChildCommandChannel {
    program: String,
    state: Mutex<Option<ChildState>>,
}

impl ChildCommandChannel {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SayshError::ToolNotFound {
                        tool: program.to_string(),
                    }
                } else {
                    SayshError::CommandFailed {
                        command: program.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;
        let stdin = child.stdin.take();
        info!(program, pid = child.id(), "command channel started");
        Ok(Self {
            program: program.to_string(),
            state: Mutex::new(Some(ChildState { child, stdin })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<ChildState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Close stdin, give the child a moment to exit, then kill it.
    pub fn stop(&self) {
        if let Some(mut state) = self.lock().take() {
            drop(state.stdin.take());
            let deadline = Instant::now() + STOP_GRACE;
            while matches!(state.child.try_wait(), Ok(None)) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if matches!(state.child.try_wait(), Ok(None))
                && let Err(e) = state.child.kill()
            {
                debug!(error = %e, "command channel already gone");
            }
            if let Err(e) = state.child.wait() {
                debug!(error = %e, "failed to reap command channel");
            }
            info!(program = %self.program, "command channel stopped");
        }
    }
}

impl CommandChannel for ChildCommandChannel {
    fn send_command(&self, name: &str) -> Result<()> {
        let mut guard = self.lock();
        let stdin = guard
            .as_mut()
            .and_then(|state| state.stdin.as_mut())
            .ok_or_else(|| SayshError::CommandFailed {
                command: self.program.clone(),
                message: "not running".to_string(),
            })?;
        let line = format!("{}\n", name.trim());
        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|e| SayshError::CommandFailed {
                command: self.program.clone(),
                message: e.to_string(),
            })?;
        debug!(command = name.trim(), "command sent");
        Ok(())
    }

    fn is_running(&self) -> bool {
        match self.lock().as_mut() {
            Some(state) => matches!(state.child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

impl Drop for ChildCommandChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tells the companion process to listen again once playback ends.
pub struct WakeupHook<C: CommandChannel> {
    channel: Arc<C>,
}

impl<C: CommandChannel> WakeupHook<C> {
    pub const COMMAND: &'static str = "wakeup";

    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl<C: CommandChannel + 'static> PostPlayHook for WakeupHook<C> {
    async fn after_playback(&self, first_audio_delay: Duration) -> Result<()> {
        info!(delay_ms = millis(first_audio_delay), "playback cycle finished");
        if !self.channel.is_running() {
            warn!("command channel not running, skipping wakeup");
            return Ok(());
        }
        self.channel.send_command(Self::COMMAND)
    }
}

/// Receives recognized queries.
pub trait QueryHandler: Send + Sync {
    fn on_query(&self, text: &str);
}

/// Routes each query into the speaker's async queue.
pub struct QueryRouter {
    runtime: Handle,
    speaker: Arc<Speaker>,
}

impl QueryRouter {
    pub fn new(runtime: Handle, speaker: Arc<Speaker>) -> Self {
        Self { runtime, speaker }
    }
}

impl QueryHandler for QueryRouter {
    fn on_query(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        info!(text = %preview(text), "query received");
        let speaker = Arc::clone(&self.speaker);
        let text = text.to_string();
        // The queue consumer must live on the runtime, not the caller's thread.
        self.runtime.spawn(async move {
            let outcome = speaker.enqueue_text(text);
            debug!(?outcome, "query queued");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
        stopped: AtomicBool,
    }

    impl CommandChannel for RecordingChannel {
        fn send_command(&self, name: &str) -> Result<()> {
            self.sent.lock().unwrap().push(name.to_string());
            Ok(())
        }

        fn is_running(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn wakeup_hook_sends_command() {
        let channel = Arc::new(RecordingChannel::default());
        let hook = WakeupHook::new(channel.clone());
        hook.after_playback(Duration::from_millis(120)).await.unwrap();
        assert_eq!(*channel.sent.lock().unwrap(), vec!["wakeup"]);
    }

    #[tokio::test]
    async fn wakeup_hook_skips_stopped_channel() {
        let channel = Arc::new(RecordingChannel::default());
        channel.stopped.store(true, Ordering::SeqCst);
        let hook = WakeupHook::new(channel.clone());
        hook.after_playback(Duration::ZERO).await.unwrap();
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn spawning_missing_program_fails() {
        let err = ChildCommandChannel::spawn("/nonexistent/saysh-companion", &[]).err();
        assert!(matches!(err, Some(SayshError::ToolNotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn child_channel_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("commands.txt");
        let script = format!("cat > {}", out.display());
        let channel = ChildCommandChannel::spawn("sh", &["-c".to_string(), script]).unwrap();
        assert!(channel.is_running());

        channel.send_command(" wakeup ").unwrap();
        channel.send_command("wakeup").unwrap();
        channel.stop();
        assert!(!channel.is_running());
        assert!(channel.send_command("wakeup").is_err());

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "wakeup\nwakeup\n");
    }
}
