//! Client side of one duplex synthesis task.
//!
//! A [`SynthesisSession`] owns exactly one connection and walks it through
//! `Idle → Connecting → Started → Streaming → Finishing` to a terminal state.
//! All state lives behind one mutex paired with a condvar, so blocking callers
//! (start handshake, finish) and the connection's reader thread agree on a
//! single view of the task.

use crate::defaults;
use crate::error::{Result, SayshError};
use crate::protocol::{AudioFormat, InboundMessage, TaskEvent, TaskRequest};
use crate::transport::connection::{ConnectRequest, Connector, FrameHandler, InboundFrame, Link};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of a synthesis task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Connecting,
    Started,
    Streaming,
    Finishing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    fn accepts_audio(self) -> bool {
        matches!(
            self,
            TaskState::Streaming | TaskState::Finishing
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Idle => "idle",
            TaskState::Connecting => "connecting",
            TaskState::Started => "started",
            TaskState::Streaming => "streaming",
            TaskState::Finishing => "finishing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Deadlines for the blocking phases of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Transport-level handshake.
    pub connect: Duration,
    /// From `run-task` to `task-started`.
    pub start: Duration,
    /// From `finish-task` to `task-finished`, unless overridden per call.
    pub complete: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: defaults::CONNECT_TIMEOUT,
            start: defaults::START_TIMEOUT,
            complete: defaults::COMPLETE_TIMEOUT,
        }
    }
}

/// Receives session events.
///
/// `on_open` precedes any `on_data`. `on_close` fires exactly once, after
/// `on_complete` or `on_error` when the task ends that way. Callbacks may run
/// on the connection's reader thread and must not block for long.
pub trait SessionObserver: Send + Sync {
    fn on_open(&self) {}
    fn on_event(&self, _message: &InboundMessage) {}
    fn on_data(&self, _data: &[u8]) {}
    fn on_complete(&self) {}
    fn on_error(&self, _error: &SayshError) {}
    fn on_close(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Why a task failed, kept in a cloneable form so every waiter can see it.
#[derive(Debug, Clone)]
enum Fault {
    Task(String),
    Protocol(String),
    Transport(String),
    Timeout { operation: String, after: Duration },
}

impl Fault {
    fn of(err: &SayshError) -> Self {
        match err {
            SayshError::Timeout { operation, after } => Fault::Timeout {
                operation: operation.clone(),
                after: *after,
            },
            SayshError::TaskFailed { message } => Fault::Task(message.clone()),
            SayshError::Protocol { message } => Fault::Protocol(message.clone()),
            other => Fault::Transport(other.to_string()),
        }
    }

    fn to_error(&self) -> SayshError {
        match self {
            Fault::Task(message) => SayshError::TaskFailed {
                message: message.clone(),
            },
            Fault::Protocol(message) => SayshError::Protocol {
                message: message.clone(),
            },
            Fault::Transport(message) => SayshError::Transport {
                message: message.clone(),
            },
            Fault::Timeout { operation, after } => SayshError::timeout(operation.clone(), *after),
        }
    }
}

#[derive(Debug, Default)]
struct StreamStats {
    first_text_at: Option<Instant>,
    first_audio_delay: Option<Duration>,
    audio_bytes: u64,
    last_response: Option<Value>,
}

#[derive(Debug)]
struct Inner {
    state: TaskState,
    /// Set once the terminal callbacks have run; waiters wake on this.
    closed: bool,
    stats: StreamStats,
    fault: Option<Fault>,
}

/// Shared between the session and the connection's reader thread.
struct SessionCore {
    task_id: String,
    format: AudioFormat,
    inner: Mutex<Inner>,
    changed: Condvar,
    observer: Arc<dyn SessionObserver>,
}

impl SessionCore {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> TaskState {
        self.lock().state
    }

    /// Move to a terminal state once. Returns false if already terminal.
    fn settle(&self, terminal: TaskState, fault: Option<Fault>) -> bool {
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return false;
            }
            debug!(task_id = %self.task_id, from = %inner.state, to = %terminal, "task settled");
            inner.state = terminal;
            if fault.is_some() {
                inner.fault = fault.clone();
            }
        }

        match (terminal, fault) {
            (TaskState::Completed, _) => self.observer.on_complete(),
            (_, Some(fault)) => self.observer.on_error(&fault.to_error()),
            _ => {}
        }
        self.observer.on_close();

        // Blocked callers resume only after the observer has seen the close.
        self.lock().closed = true;
        self.changed.notify_all();
        true
    }

    fn handle_text(&self, text: &str) {
        debug!(task_id = %self.task_id, "<<< recv {}", text);
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "malformed message from service");
                self.settle(TaskState::Failed, Some(Fault::of(&e)));
                return;
            }
        };
        self.lock().stats.last_response = Some(message.raw.clone());

        match message.event() {
            TaskEvent::TaskStarted => {
                let mut inner = self.lock();
                if inner.state == TaskState::Connecting {
                    inner.state = TaskState::Started;
                    drop(inner);
                    self.changed.notify_all();
                    info!(task_id = %self.task_id, "task started");
                } else {
                    warn!(task_id = %self.task_id, state = %inner.state, "unexpected task-started");
                }
            }
            TaskEvent::ResultGenerated => self.observer.on_event(&message),
            TaskEvent::TaskFinished => {
                info!(task_id = %self.task_id, "task finished");
                self.settle(TaskState::Completed, None);
            }
            TaskEvent::TaskFailed => {
                let reason = message.failure_reason();
                error!(task_id = %self.task_id, reason = %reason, "task failed");
                self.settle(TaskState::Failed, Some(Fault::Task(reason)));
            }
            TaskEvent::Unknown => {
                error!(task_id = %self.task_id, "unexpected event: {}", text);
                self.settle(
                    TaskState::Failed,
                    Some(Fault::Protocol(format!("unexpected event: {}", text))),
                );
            }
        }
    }

    fn handle_binary(&self, data: Vec<u8>) {
        let rtf = {
            let mut inner = self.lock();
            if !inner.state.accepts_audio() {
                debug!(task_id = %self.task_id, state = %inner.state, bytes = data.len(), "audio outside streaming dropped");
                return;
            }
            let now = Instant::now();
            let stats = &mut inner.stats;
            if stats.first_audio_delay.is_none()
                && let Some(first_text) = stats.first_text_at
            {
                let delay = now.duration_since(first_text);
                stats.first_audio_delay = Some(delay);
                info!(task_id = %self.task_id, delay_ms = delay.as_millis() as u64, "first audio");
            }
            stats.audio_bytes += data.len() as u64;
            let audio = audio_duration(stats.audio_bytes, self.format);
            stats
                .first_text_at
                .map(|t| (now.duration_since(t), audio))
        };

        if let Some((elapsed, audio)) = rtf
            && !audio.is_zero()
        {
            debug!(
                task_id = %self.task_id,
                bytes = data.len(),
                audio_ms = audio.as_millis() as u64,
                rtf = elapsed.as_secs_f64() / audio.as_secs_f64(),
                "audio chunk"
            );
        }
        self.observer.on_data(&data);
    }

    fn handle_gone(&self, reason: String) {
        if self.state().is_terminal() {
            return;
        }
        warn!(task_id = %self.task_id, reason = %reason, "connection lost");
        self.settle(TaskState::Failed, Some(Fault::Transport(reason)));
    }
}

impl FrameHandler for SessionCore {
    fn on_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Text(text) => self.handle_text(&text),
            InboundFrame::Binary(data) => self.handle_binary(data),
            InboundFrame::Closed { reason } => self.handle_gone(
                reason.unwrap_or_else(|| "connection closed by service".to_string()),
            ),
            InboundFrame::Error(message) => self.handle_gone(message),
        }
    }
}

fn audio_duration(bytes: u64, format: AudioFormat) -> Duration {
    let rate = u64::from(format.sample_rate()) * u64::from(defaults::BYTES_PER_SAMPLE);
    if rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(bytes as f64 / rate as f64)
}

/// One single-use duplex synthesis task.
pub struct SynthesisSession {
    request: TaskRequest,
    connect: ConnectRequest,
    connector: Arc<dyn Connector>,
    timeouts: SessionTimeouts,
    core: Arc<SessionCore>,
    link: Mutex<Option<Box<dyn Link>>>,
}

impl SynthesisSession {
    pub fn new(
        request: TaskRequest,
        connect: ConnectRequest,
        connector: Arc<dyn Connector>,
        timeouts: SessionTimeouts,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let core = Arc::new(SessionCore {
            task_id: request.task_id().to_string(),
            format: request.format(),
            inner: Mutex::new(Inner {
                state: TaskState::Idle,
                closed: false,
                stats: StreamStats::default(),
                fault: None,
            }),
            changed: Condvar::new(),
            observer,
        });
        Self {
            request,
            connect,
            connector,
            timeouts,
            core,
            link: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn request_id(&self) -> &str {
        &self.core.task_id
    }

    /// Time from the first submitted text to the first audio frame.
    pub fn first_package_delay(&self) -> Option<Duration> {
        self.core.lock().stats.first_audio_delay
    }

    pub fn audio_bytes(&self) -> u64 {
        self.core.lock().stats.audio_bytes
    }

    /// Playback length of the audio received so far.
    pub fn audio_duration(&self) -> Duration {
        audio_duration(self.audio_bytes(), self.core.format)
    }

    /// Last JSON message received from the service.
    pub fn last_response(&self) -> Option<Value> {
        self.core.lock().stats.last_response.clone()
    }

    /// Submit a text fragment, opening the task on first use.
    ///
    /// The first call blocks until the service acknowledges the task (or the
    /// start timeout lapses). Later calls are pipelined without waiting.
    pub fn send_text(&self, text: &str) -> Result<()> {
        let needs_open = {
            let mut inner = self.core.lock();
            match inner.state {
                TaskState::Idle => {
                    inner.state = TaskState::Connecting;
                    true
                }
                TaskState::Connecting | TaskState::Started | TaskState::Streaming => false,
                TaskState::Finishing => {
                    return Err(SayshError::invalid_task(
                        "cannot send text after finish was requested",
                    ));
                }
                state => {
                    return Err(SayshError::invalid_task(format!(
                        "cannot send text, task already {}",
                        state
                    )));
                }
            }
        };

        if needs_open {
            self.open()?;
        } else {
            self.wait_started()?;
        }

        let frame = self.request.continue_task(text)?;
        let mut inner = self.core.lock();
        match inner.state {
            TaskState::Started | TaskState::Streaming => {}
            state => {
                return Err(SayshError::invalid_task(format!(
                    "cannot send text, task already {}",
                    state
                )));
            }
        }
        if inner.stats.first_text_at.is_none() {
            inner.stats.first_text_at = Some(Instant::now());
        }
        inner.state = TaskState::Streaming;
        // Sent under the state lock so continue frames keep submission order
        // relative to each other and to finish-task.
        let sent = self.send_frame(frame);
        drop(inner);
        if let Err(e) = &sent {
            self.fail(e);
        }
        sent
    }

    /// Request completion and block until the task ends.
    ///
    /// `timeout` overrides the configured completion deadline.
    pub fn finish(&self, timeout: Option<Duration>) -> Result<()> {
        self.request_finish()?;
        self.wait_terminal(timeout.unwrap_or(self.timeouts.complete))
    }

    /// Request completion and return immediately.
    ///
    /// Completion is reported through the observer. A background waiter
    /// enforces the deadline and fails the task if it lapses.
    pub fn finish_in_background(self: &Arc<Self>, timeout: Option<Duration>) -> Result<()> {
        self.request_finish()?;
        let session = Arc::clone(self);
        let deadline = timeout.unwrap_or(self.timeouts.complete);
        thread::Builder::new()
            .name("saysh-finish".to_string())
            .spawn(move || {
                if let Err(e) = session.wait_terminal(deadline) {
                    warn!(task_id = %session.request_id(), error = %e, "background finish failed");
                }
            })
            .map_err(|e| SayshError::Other(format!("Failed to spawn finish waiter: {}", e)))?;
        Ok(())
    }

    /// Abort the task without waiting for the service.
    ///
    /// Sends `finish-task` best effort, drops the connection and releases any
    /// blocked waiter. Cancelling a task that already ended is an error.
    pub fn cancel(&self) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SayshError::invalid_task(format!(
                "cannot cancel, task already {}",
                state
            )));
        }

        if state != TaskState::Idle {
            match self.request.finish_task() {
                Ok(frame) => {
                    if let Err(e) = self.send_frame(frame) {
                        debug!(task_id = %self.request_id(), error = %e, "finish on cancel not sent");
                    }
                }
                Err(e) => debug!(error = %e, "finish frame not built"),
            }
        }
        // Settle before closing so a concurrent open() either sees the
        // terminal state or has already stored the link closed here.
        if self.core.settle(TaskState::Cancelled, None) {
            info!(task_id = %self.request_id(), "task cancelled");
        }
        self.close_link();
        Ok(())
    }

    fn open(&self) -> Result<()> {
        let run_task = match self.request.run_task() {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        info!(task_id = %self.request_id(), url = %self.connect.url, model = %self.request.model(), voice = %self.request.voice(), "connecting");
        let handler: Arc<dyn FrameHandler> = self.core.clone();
        let link = match self
            .connector
            .connect(&self.connect, handler, self.timeouts.connect)
        {
            Ok(link) => link,
            Err(e) => {
                error!(task_id = %self.request_id(), error = %e, "connect failed");
                self.fail(&e);
                return Err(e);
            }
        };
        *self.link_guard() = Some(link);

        let state = self.state();
        if state.is_terminal() {
            self.close_link();
            debug!(task_id = %self.request_id(), %state, "task ended during connect, run-task not sent");
            return Err(SayshError::invalid_task(format!(
                "task {} while connecting",
                state
            )));
        }

        if let Err(e) = self.send_frame(run_task) {
            self.fail(&e);
            return Err(e);
        }

        self.wait_started()?;
        self.core.observer.on_open();
        Ok(())
    }

    fn wait_started(&self) -> Result<()> {
        let deadline = self.timeouts.start;
        let inner = self.core.lock();
        let (inner, _) = self
            .core
            .changed
            .wait_timeout_while(inner, deadline, |i| {
                i.state == TaskState::Connecting || (i.state.is_terminal() && !i.closed)
            })
            .unwrap_or_else(|e| e.into_inner());

        match inner.state {
            TaskState::Started | TaskState::Streaming | TaskState::Finishing => Ok(()),
            TaskState::Cancelled => Err(SayshError::invalid_task("task was cancelled")),
            TaskState::Failed => Err(failure_of(&inner)),
            _ => {
                drop(inner);
                let err = SayshError::timeout("waiting for task-started", deadline);
                error!(task_id = %self.request_id(), error = %err, "start handshake timed out");
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn request_finish(&self) -> Result<()> {
        let frame = self.request.finish_task()?;
        let mut inner = self.core.lock();
        match inner.state {
            TaskState::Idle | TaskState::Connecting => {
                return Err(SayshError::invalid_task("cannot finish, task has not started"));
            }
            TaskState::Finishing => {
                return Err(SayshError::invalid_task("finish already requested"));
            }
            TaskState::Started | TaskState::Streaming => {}
            state => {
                return Err(SayshError::invalid_task(format!(
                    "cannot finish, task already {}",
                    state
                )));
            }
        }
        inner.state = TaskState::Finishing;
        let sent = self.send_frame(frame);
        drop(inner);
        if let Err(e) = &sent {
            self.fail(e);
        }
        sent
    }

    fn wait_terminal(&self, deadline: Duration) -> Result<()> {
        let inner = self.core.lock();
        let (inner, _) = self
            .core
            .changed
            .wait_timeout_while(inner, deadline, |i| !i.closed)
            .unwrap_or_else(|e| e.into_inner());

        match inner.state {
            TaskState::Completed | TaskState::Cancelled => Ok(()),
            TaskState::Failed => Err(failure_of(&inner)),
            _ => {
                drop(inner);
                let err = SayshError::timeout("waiting for task-finished", deadline);
                error!(task_id = %self.request_id(), error = %err, "completion timed out");
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Settle as failed and drop the connection.
    fn fail(&self, err: &SayshError) {
        self.core.settle(TaskState::Failed, Some(Fault::of(err)));
        self.close_link();
    }

    fn send_frame(&self, frame: String) -> Result<()> {
        let guard = self.link_guard();
        match guard.as_ref() {
            Some(link) => {
                debug!(task_id = %self.request_id(), ">>> send {}", frame);
                link.send_text(frame)
            }
            None => Err(SayshError::Transport {
                message: "connection is not open".to_string(),
            }),
        }
    }

    fn close_link(&self) {
        let link = self.link_guard().take();
        if let Some(link) = link {
            link.close();
        }
    }

    fn link_guard(&self) -> MutexGuard<'_, Option<Box<dyn Link>>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SynthesisSession {
    fn drop(&mut self) {
        self.close_link();
    }
}

impl fmt::Debug for SynthesisSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisSession")
            .field("task_id", &self.request_id())
            .field("state", &self.state())
            .finish()
    }
}

fn failure_of(inner: &Inner) -> SayshError {
    inner
        .fault
        .as_ref()
        .map(Fault::to_error)
        .unwrap_or_else(|| SayshError::TaskFailed {
            message: "task failed".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use crate::protocol::SynthesisParameters;
    use crate::transport::mock::ScriptedConnector;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        opens: AtomicUsize,
        events: AtomicUsize,
        bytes: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        closes: AtomicUsize,
        order: Mutex<Vec<&'static str>>,
    }

    impl CountingObserver {
        fn push(&self, name: &'static str) {
            let mut order = self.order.lock().unwrap();
            if order.last() != Some(&name) {
                order.push(name);
            }
        }
    }

    impl SessionObserver for CountingObserver {
        fn on_open(&self) {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.push("open");
        }
        fn on_event(&self, _message: &InboundMessage) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
        fn on_data(&self, data: &[u8]) {
            self.bytes.fetch_add(data.len(), Ordering::SeqCst);
            self.push("data");
        }
        fn on_complete(&self) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            self.push("complete");
        }
        fn on_error(&self, _error: &SayshError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
            self.push("error");
        }
        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.push("close");
        }
    }

    fn session_with(
        connector: ScriptedConnector,
        timeouts: SessionTimeouts,
    ) -> (SynthesisSession, Arc<CountingObserver>, Arc<ScriptedConnector>) {
        let connector = Arc::new(connector);
        let observer = Arc::new(CountingObserver::default());
        let request = TaskRequest::new(
            Some("cosyvoice-v2"),
            Some(AudioFormat::Pcm16000HzMono16Bit),
            SynthesisParameters::new("longhua_v2"),
        )
        .unwrap();
        let session = SynthesisSession::new(
            request,
            ConnectRequest::new("wss://mock", "sk-test"),
            connector.clone(),
            timeouts,
            observer.clone(),
        );
        (session, observer, connector)
    }

    fn quick_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(500),
            start: Duration::from_millis(200),
            complete: Duration::from_secs(2),
        }
    }

    #[test]
    fn full_lifecycle_completes_and_counts_bytes() {
        let (session, observer, connector) = session_with(
            ScriptedConnector::new().with_chunks(vec![640, 320]),
            quick_timeouts(),
        );
        assert_eq!(session.state(), TaskState::Idle);

        session.send_text("hello").unwrap();
        session.send_text(" world").unwrap();
        session.finish(None).unwrap();

        assert_eq!(session.state(), TaskState::Completed);
        assert_eq!(session.audio_bytes(), 2 * 960);
        assert_eq!(observer.bytes.load(Ordering::SeqCst), 2 * 960);
        assert_eq!(observer.opens.load(Ordering::SeqCst), 1);
        assert_eq!(observer.completes.load(Ordering::SeqCst), 1);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(observer.errors.load(Ordering::SeqCst), 0);
        assert_eq!(
            *observer.order.lock().unwrap(),
            vec!["open", "data", "complete", "close"]
        );
        assert_eq!(
            connector.sent_actions(),
            vec!["run-task", "continue-task", "continue-task", "finish-task"]
        );
        assert_eq!(connector.connection_count(), 1);
        assert!(session.first_package_delay().is_some());
        assert!(session.last_response().is_some());
        assert!(observer.events.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn audio_duration_follows_byte_count() {
        let (session, _observer, _connector) = session_with(
            ScriptedConnector::new().with_chunks(vec![32000]),
            quick_timeouts(),
        );
        session.send_text("one second").unwrap();
        session.finish(None).unwrap();
        assert_eq!(session.audio_duration(), Duration::from_secs(1));
    }

    #[test]
    fn missing_start_ack_times_out_and_fails() {
        let (session, observer, _connector) = session_with(
            ScriptedConnector::new().without_start_ack(),
            quick_timeouts(),
        );
        let err = session.send_text("hello").unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
        assert_eq!(session.state(), TaskState::Failed);
        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(observer.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refused_connection_fails_session() {
        let (session, observer, _connector) = session_with(
            ScriptedConnector::new().refusing_connections(),
            quick_timeouts(),
        );
        let err = session.send_text("hello").unwrap_err();
        assert_eq!(err.kind(), FaultKind::Transport);
        assert_eq!(session.state(), TaskState::Failed);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_failed_surfaces_to_finish_caller() {
        let (session, observer, _connector) = session_with(
            ScriptedConnector::new().failing_with("InvalidParameter", "bad voice"),
            quick_timeouts(),
        );
        session.send_text("hello").unwrap();
        let err = session.finish(None).unwrap_err();
        match err {
            SayshError::TaskFailed { message } => assert!(message.contains("bad voice")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finish_timeout_is_distinct_fault() {
        let (session, _observer, _connector) = session_with(
            ScriptedConnector::new().silent_on_finish(),
            quick_timeouts(),
        );
        session.send_text("hello").unwrap();
        let err = session.finish(Some(Duration::from_millis(100))).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Timeout);
        assert_eq!(session.state(), TaskState::Failed);
    }

    #[test]
    fn unknown_event_is_protocol_fault() {
        let (session, _observer, _connector) = session_with(
            ScriptedConnector::new().replying_to_start_with("task-exploded"),
            quick_timeouts(),
        );
        let err = session.send_text("hello").unwrap_err();
        assert_eq!(err.kind(), FaultKind::Protocol);
        assert_eq!(session.state(), TaskState::Failed);
    }

    #[test]
    fn finish_before_start_is_invalid() {
        let (session, _observer, connector) =
            session_with(ScriptedConnector::new(), quick_timeouts());
        let err = session.finish(None).unwrap_err();
        assert_eq!(err.kind(), FaultKind::InvalidState);
        assert_eq!(session.state(), TaskState::Idle);
        assert_eq!(connector.connection_count(), 0);
    }

    #[test]
    fn finishing_twice_is_invalid() {
        let (session, _observer, _connector) = session_with(
            ScriptedConnector::new().silent_on_finish(),
            quick_timeouts(),
        );
        session.send_text("hello").unwrap();
        session.request_finish().unwrap();
        let err = session.finish(None).unwrap_err();
        assert!(matches!(err, SayshError::InvalidTask { .. }));
    }

    #[test]
    fn text_after_finish_is_invalid() {
        let (session, _observer, _connector) =
            session_with(ScriptedConnector::new(), quick_timeouts());
        session.send_text("hello").unwrap();
        session.finish(None).unwrap();
        let err = session.send_text("again").unwrap_err();
        assert_eq!(err.kind(), FaultKind::InvalidState);
    }

    #[test]
    fn cancel_releases_waiter_and_closes_once() {
        let (session, observer, connector) = session_with(
            ScriptedConnector::new().silent_on_finish(),
            quick_timeouts(),
        );
        let session = Arc::new(session);
        session.send_text("hello").unwrap();
        session.request_finish().unwrap();

        let waiter = {
            let session = session.clone();
            thread::spawn(move || session.wait_terminal(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        session.cancel().unwrap();

        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(session.state(), TaskState::Cancelled);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(observer.completes.load(Ordering::SeqCst), 0);
        assert!(connector.was_closed());
    }

    #[test]
    fn cancel_after_terminal_is_invalid() {
        let (session, _observer, _connector) =
            session_with(ScriptedConnector::new(), quick_timeouts());
        session.send_text("hello").unwrap();
        session.finish(None).unwrap();
        let err = session.cancel().unwrap_err();
        assert!(matches!(err, SayshError::InvalidTask { .. }));
    }

    #[test]
    fn cancel_idle_session_needs_no_connection() {
        let (session, observer, connector) =
            session_with(ScriptedConnector::new(), quick_timeouts());
        session.cancel().unwrap();
        assert_eq!(session.state(), TaskState::Cancelled);
        assert_eq!(connector.connection_count(), 0);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn background_finish_reports_through_observer() {
        let (session, observer, _connector) =
            session_with(ScriptedConnector::new(), quick_timeouts());
        let session = Arc::new(session);
        session.send_text("hello").unwrap();
        session.finish_in_background(None).unwrap();

        for _ in 0..200 {
            if observer.closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(session.state(), TaskState::Completed);
        assert_eq!(observer.completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lost_connection_fails_task() {
        let (session, observer, _connector) = session_with(
            ScriptedConnector::new().dropping_on_finish(),
            quick_timeouts(),
        );
        session.send_text("hello").unwrap();
        let err = session.finish(None).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Transport);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_during_connect_never_starts_task() {
        let (session, observer, connector) = session_with(
            ScriptedConnector::new().with_connect_delay(Duration::from_millis(200)),
            quick_timeouts(),
        );
        let session = Arc::new(session);
        let sender = {
            let session = session.clone();
            thread::spawn(move || session.send_text("hello"))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(session.state(), TaskState::Connecting);
        session.cancel().unwrap();

        let err = sender.join().unwrap().unwrap_err();
        assert!(matches!(err, SayshError::InvalidTask { .. }));
        assert_eq!(session.state(), TaskState::Cancelled);
        assert_eq!(connector.connection_count(), 1);
        assert!(connector.sent_actions().is_empty());
        assert!(connector.was_closed());
        assert_eq!(observer.opens.load(Ordering::SeqCst), 0);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn audio_before_first_text_is_dropped() {
        let (session, observer, _connector) =
            session_with(ScriptedConnector::new(), quick_timeouts());

        session.core.lock().state = TaskState::Started;
        session.core.on_frame(InboundFrame::Binary(vec![0; 640]));
        assert_eq!(session.audio_bytes(), 0);
        assert_eq!(observer.bytes.load(Ordering::SeqCst), 0);

        session.core.lock().state = TaskState::Streaming;
        session.core.on_frame(InboundFrame::Binary(vec![0; 640]));
        assert_eq!(session.audio_bytes(), 640);

        session.core.lock().state = TaskState::Finishing;
        session.core.on_frame(InboundFrame::Binary(vec![0; 320]));
        assert_eq!(session.audio_bytes(), 960);
        assert_eq!(observer.bytes.load(Ordering::SeqCst), 960);
    }
}
