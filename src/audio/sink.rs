//! Audio output: raw PCM pushed into an external playback process.

use crate::defaults::{SAMPLE_RATE, SINK_CLOSE_GRACE, SINK_TERMINATE_GRACE};
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The admission check failed; nothing was written.
    Skipped,
    /// The sink is not running or the write faulted.
    Failed,
}

/// Byte sink for 16 kHz mono signed 16-bit little-endian PCM.
///
/// All operations are serialized by the implementation, so writes from a
/// connection thread may race freely with resets from a control thread.
pub trait AudioSink: Send + Sync {
    /// Start the output if it is not running. Returns false on failure.
    fn initialize(&self) -> bool;

    fn is_initialized(&self) -> bool;

    /// Write `data` only if `admit` still returns true once the sink lock is
    /// held. Never panics and never returns an error; faults are reported as
    /// [`WriteOutcome::Failed`].
    fn write_if(&self, data: &[u8], admit: &dyn Fn() -> bool) -> WriteOutcome;

    fn write(&self, data: &[u8]) -> bool {
        self.write_if(data, &|| true) == WriteOutcome::Written
    }

    /// Drop anything buffered and restart the output.
    fn reset(&self) -> bool;

    /// Stop the output for good.
    fn close(&self);
}

/// Plays audio by piping it to an external player's stdin (`sox` by default).
pub struct ProcessSink {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl ProcessSink {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
        }
    }

    /// `sox -t raw -r 16000 -c 1 -e signed-integer -b 16 - -d -V1`
    pub fn sox() -> Self {
        Self::new("sox", sox_args())
    }

    /// Build from a whitespace-separated command line.
    ///
    /// Returns `None` for an empty command.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn(&self) -> Option<Child> {
        match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                info!(program = %self.program, pid = child.id(), "audio player started");
                Some(child)
            }
            Err(e) => {
                warn!(program = %self.program, error = %e, "failed to start audio player");
                None
            }
        }
    }
}

/// Arguments for `sox` reading raw PCM from stdin and playing to the default device.
pub fn sox_args() -> Vec<String> {
    let rate = SAMPLE_RATE.to_string();
    [
        "-t",
        "raw",
        "-r",
        rate.as_str(),
        "-c",
        "1",
        "-e",
        "signed-integer",
        "-b",
        "16",
        "-",
        "-d",
        "-V1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn is_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

fn wait_for_exit(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() >= deadline => return false,
            Ok(None) => thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                debug!(error = %e, "could not poll audio player");
                return false;
            }
        }
    }
}

fn terminate(child: &mut Child) {
    // SAFETY: sending a signal to our own child pid has no memory-safety impact.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid = child.id(), "SIGTERM not delivered");
    }
    if wait_for_exit(child, SINK_TERMINATE_GRACE) {
        return;
    }
    warn!(pid = child.id(), "audio player ignored SIGTERM, killing");
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill failed");
    }
    if let Err(e) = child.wait() {
        debug!(error = %e, "reaping audio player failed");
    }
}

/// Close stdin so the player drains and exits, escalating if it does not.
fn shutdown_gracefully(mut child: Child) {
    drop(child.stdin.take());
    if wait_for_exit(&mut child, SINK_CLOSE_GRACE) {
        return;
    }
    warn!(pid = child.id(), "audio player did not exit, terminating");
    terminate(&mut child);
}

impl AudioSink for ProcessSink {
    fn initialize(&self) -> bool {
        let mut guard = self.lock();
        if let Some(child) = guard.as_mut()
            && is_running(child)
        {
            return true;
        }
        *guard = self.spawn();
        guard.is_some()
    }

    fn is_initialized(&self) -> bool {
        self.lock().as_mut().is_some_and(is_running)
    }

    fn write_if(&self, data: &[u8], admit: &dyn Fn() -> bool) -> WriteOutcome {
        let mut guard = self.lock();
        if !admit() {
            return WriteOutcome::Skipped;
        }
        let Some(child) = guard.as_mut() else {
            return WriteOutcome::Failed;
        };
        if !is_running(child) {
            return WriteOutcome::Failed;
        }
        let Some(stdin) = child.stdin.as_mut() else {
            return WriteOutcome::Failed;
        };
        match stdin.write_all(data).and_then(|()| stdin.flush()) {
            Ok(()) => WriteOutcome::Written,
            Err(e) => {
                warn!(error = %e, bytes = data.len(), "audio write failed");
                WriteOutcome::Failed
            }
        }
    }

    fn reset(&self) -> bool {
        let mut guard = self.lock();
        if let Some(mut child) = guard.take() {
            // Buffered audio is stale; stop hard rather than draining.
            drop(child.stdin.take());
            terminate(&mut child);
        }
        *guard = self.spawn();
        guard.is_some()
    }

    fn close(&self) {
        let child = self.lock().take();
        if let Some(child) = child {
            shutdown_gracefully(child);
            info!("audio player closed");
        }
    }
}

impl Drop for ProcessSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    initialized: bool,
    data: Vec<u8>,
    writes: usize,
    initializations: usize,
    resets: usize,
    closes: usize,
    fail_writes: bool,
    fail_initialize: bool,
}

/// In-memory sink that records every byte written.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails until cleared with [`MemorySink::set_fail_writes`].
    pub fn failing_writes(self) -> Self {
        self.set_fail_writes(true);
        self
    }

    /// `initialize` always fails.
    pub fn failing_initialize(self) -> Self {
        self.lock().fail_initialize = true;
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    pub fn byte_count(&self) -> usize {
        self.lock().data.len()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn initialize_count(&self) -> usize {
        self.lock().initializations
    }

    pub fn reset_count(&self) -> usize {
        self.lock().resets
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }
}

impl AudioSink for MemorySink {
    fn initialize(&self) -> bool {
        let mut state = self.lock();
        if state.fail_initialize {
            return false;
        }
        if !state.initialized {
            state.initialized = true;
            state.initializations += 1;
        }
        true
    }

    fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    fn write_if(&self, data: &[u8], admit: &dyn Fn() -> bool) -> WriteOutcome {
        let mut state = self.lock();
        if !admit() {
            return WriteOutcome::Skipped;
        }
        if !state.initialized || state.fail_writes {
            return WriteOutcome::Failed;
        }
        state.data.extend_from_slice(data);
        state.writes += 1;
        WriteOutcome::Written
    }

    fn reset(&self) -> bool {
        let mut state = self.lock();
        state.resets += 1;
        if state.fail_initialize {
            state.initialized = false;
            return false;
        }
        state.initialized = true;
        true
    }

    fn close(&self) {
        let mut state = self.lock();
        state.initialized = false;
        state.closes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sox_args_describe_raw_16k_mono() {
        let args = sox_args();
        assert_eq!(args[..4], ["-t", "raw", "-r", "16000"]);
        assert!(args.contains(&"signed-integer".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-V1"));
    }

    #[test]
    fn command_line_splits_program_and_args() {
        let sink = ProcessSink::from_command_line("aplay -q -f S16_LE -r 16000").unwrap();
        assert_eq!(sink.program, "aplay");
        assert_eq!(sink.args, vec!["-q", "-f", "S16_LE", "-r", "16000"]);
        assert!(ProcessSink::from_command_line("   ").is_none());
    }

    #[test]
    fn missing_player_fails_to_initialize() {
        let sink = ProcessSink::new("saysh-no-such-player-binary", vec![]);
        assert!(!sink.initialize());
        assert!(!sink.is_initialized());
        assert!(!sink.write(&[0, 0]));
    }

    #[test]
    fn process_sink_pipes_into_child() {
        // `cat` with stdout discarded stands in for a player.
        let sink = ProcessSink::new("cat", vec![]);
        if !sink.initialize() {
            return;
        }
        assert!(sink.is_initialized());
        assert!(sink.write(&[1, 2, 3, 4]));
        assert!(sink.reset());
        assert!(sink.write(&[5, 6]));
        sink.close();
        assert!(!sink.is_initialized());
    }

    #[test]
    fn memory_sink_requires_initialize() {
        let sink = MemorySink::new();
        assert!(!sink.write(&[1, 2]));
        assert!(sink.initialize());
        assert!(sink.write(&[1, 2]));
        assert_eq!(sink.bytes(), vec![1, 2]);
    }

    #[test]
    fn rejected_admission_skips_write() {
        let sink = MemorySink::new();
        sink.initialize();
        assert_eq!(sink.write_if(&[9; 4], &|| false), WriteOutcome::Skipped);
        assert_eq!(sink.byte_count(), 0);
    }

    #[test]
    fn failing_writes_report_failure() {
        let sink = MemorySink::new().failing_writes();
        sink.initialize();
        assert_eq!(sink.write_if(&[1], &|| true), WriteOutcome::Failed);
        sink.set_fail_writes(false);
        assert_eq!(sink.write_if(&[1], &|| true), WriteOutcome::Written);
    }

    #[test]
    fn reset_and_close_are_counted() {
        let sink = MemorySink::new();
        sink.initialize();
        sink.reset();
        sink.close();
        assert_eq!(sink.reset_count(), 1);
        assert_eq!(sink.close_count(), 1);
        assert!(!sink.is_initialized());
    }
}
