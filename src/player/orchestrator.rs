//! Single-slot session orchestration.
//!
//! The [`Orchestrator`] owns the one "current session" slot. Every transition
//! of that slot (start, interrupt, close) happens under one mutex, and every
//! audio side effect re-checks the slot before it happens, so an interrupt
//! issued from any thread silences the session immediately.

use crate::audio::sink::{AudioSink, WriteOutcome};
use crate::audio::wav;
use crate::defaults::{self, TAIL_SILENCE_MS};
use crate::error::{Result, SayshError};
use crate::player::metrics::{PlaybackMetrics, millis};
use crate::protocol::{AudioFormat, SynthesisParameters, TaskRequest};
use crate::transport::connection::{ConnectRequest, Connector};
use crate::transport::session::{SessionObserver, SessionTimeouts, SynthesisSession, TaskState};
use futures_util::{Stream, StreamExt};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything needed to open a synthesis session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub url: String,
    pub api_key: String,
    pub workspace: Option<String>,
    pub headers: Vec<(String, String)>,
    pub model: Option<String>,
    pub format: Option<AudioFormat>,
    pub parameters: SynthesisParameters,
    pub timeouts: SessionTimeouts,
}

impl SessionSettings {
    /// Default service, model and voice with 16 kHz PCM output.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: defaults::SERVICE_URL.to_string(),
            api_key: api_key.into(),
            workspace: None,
            headers: Vec::new(),
            model: Some(defaults::DEFAULT_MODEL.to_string()),
            format: Some(AudioFormat::Pcm16000HzMono16Bit),
            parameters: SynthesisParameters::new(defaults::DEFAULT_VOICE),
            timeouts: SessionTimeouts::default(),
        }
    }

    fn connect_request(&self) -> ConnectRequest {
        ConnectRequest::new(&self.url, &self.api_key)
            .with_workspace(self.workspace.as_deref())
            .with_headers(&self.headers)
    }

    fn task_request(&self) -> Result<TaskRequest> {
        TaskRequest::new(
            self.model.as_deref(),
            self.format,
            self.parameters.clone(),
        )
    }

    /// Reject settings that could never open a session.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(SayshError::CredentialMissing {
                name: defaults::API_KEY_ENV.to_string(),
            });
        }
        self.task_request().map(|_| ())
    }
}

/// State of the session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// No session; `send_text` is an error.
    Idle,
    /// A session owns the slot and may play audio.
    Active,
    /// The last session was interrupted; its audio is discarded and
    /// `send_text` is a silent no-op until the next start.
    Interrupted,
}

struct Slot {
    phase: SlotPhase,
    /// Bumped on every start so callbacks from an older session are ignored.
    generation: u64,
    session: Option<Arc<SynthesisSession>>,
    first_text_at: Option<Instant>,
    metrics: PlaybackMetrics,
    saved_audio: Vec<u8>,
}

impl Slot {
    fn admits(&self, generation: u64) -> bool {
        self.phase == SlotPhase::Active && self.generation == generation
    }
}

struct Shared {
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    sink: Option<Arc<dyn AudioSink>>,
    save_dir: Option<PathBuf>,
    slot: Mutex<Slot>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn admits(&self, generation: u64) -> bool {
        self.slot().admits(generation)
    }
}

/// Observer handed to each session; routes its audio into the slot.
struct SessionBridge {
    shared: Weak<Shared>,
    generation: u64,
}

impl SessionObserver for SessionBridge {
    fn on_open(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Some(sink) = &shared.sink
            && !sink.initialize()
        {
            warn!("audio output unavailable, continuing without playback");
        }
    }

    fn on_data(&self, data: &[u8]) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let generation = self.generation;

        if let Some(sink) = &shared.sink {
            let outcome = sink.write_if(data, &|| shared.admits(generation));
            if outcome == WriteOutcome::Failed && shared.admits(generation) {
                warn!(bytes = data.len(), "audio write failed, restarting output");
                sink.reset();
            }
        }

        let mut slot = shared.slot();
        if !slot.admits(generation) {
            return;
        }
        if slot.metrics.first_audio_delay_ms.is_none()
            && let Some(first_text) = slot.first_text_at
        {
            slot.metrics.first_audio_delay_ms = Some(millis(first_text.elapsed()));
        }
        if shared.save_dir.is_some() {
            slot.saved_audio.extend_from_slice(data);
        }
        slot.metrics.audio_bytes += data.len() as u64;
    }

    fn on_complete(&self) {
        debug!(generation = self.generation, "synthesis complete");
    }

    fn on_error(&self, error: &SayshError) {
        error!(error = %error, "synthesis failed");
    }

    fn on_close(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let generation = self.generation;

        let audio = {
            let mut slot = shared.slot();
            if !slot.admits(generation) {
                // Interrupted, closed or superseded.
                return;
            }
            if let Some(first_text) = slot.first_text_at {
                slot.metrics.total_duration_ms = Some(millis(first_text.elapsed()));
            }
            std::mem::take(&mut slot.saved_audio)
        };

        if let Some(dir) = &shared.save_dir
            && !audio.is_empty()
        {
            match wav::save_session_audio(dir, &audio) {
                Ok(path) => info!(path = %path.display(), bytes = audio.len(), "audio saved"),
                Err(e) => error!(error = %e, "failed to save audio"),
            }
        }

        if let Some(sink) = &shared.sink {
            let silence = vec![0u8; defaults::silence_bytes(TAIL_SILENCE_MS)];
            if sink.write_if(&silence, &|| shared.admits(generation)) == WriteOutcome::Failed {
                debug!("tail silence not written");
            }
        }

        let mut slot = shared.slot();
        if slot.admits(generation) {
            slot.phase = SlotPhase::Idle;
            slot.session = None;
            info!(metrics = %slot.metrics, "session closed");
        }
    }
}

/// Serializes callers onto at most one synthesis session.
///
/// Cloning yields another handle to the same slot.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Fails with a configuration error when the settings lack a credential,
    /// model or format.
    pub fn new(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        sink: Option<Arc<dyn AudioSink>>,
        save_dir: Option<PathBuf>,
    ) -> Result<Self> {
        settings.validate()?;
        if sink.is_some() && settings.format.is_some_and(|f| !f.is_raw_pcm()) {
            warn!(format = ?settings.format, "playback expects raw PCM output");
        }
        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                connector,
                sink,
                save_dir,
                slot: Mutex::new(Slot {
                    phase: SlotPhase::Idle,
                    generation: 0,
                    session: None,
                    first_text_at: None,
                    metrics: PlaybackMetrics::default(),
                    saved_audio: Vec::new(),
                }),
            }),
        })
    }

    /// Claim the slot for a new session. Returns false if one is active.
    pub fn start_session(&self) -> bool {
        self.begin().is_some()
    }

    fn begin(&self) -> Option<u64> {
        let shared = &self.shared;
        let mut slot = shared.slot();
        if slot.phase == SlotPhase::Active {
            warn!("synthesis session already active, not starting another");
            return None;
        }

        let request = match shared.settings.task_request() {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "cannot build task request");
                return None;
            }
        };
        let generation = slot.generation + 1;
        let observer = Arc::new(SessionBridge {
            shared: Arc::downgrade(shared),
            generation,
        });
        let session = Arc::new(SynthesisSession::new(
            request,
            shared.settings.connect_request(),
            Arc::clone(&shared.connector),
            shared.settings.timeouts,
            observer,
        ));

        slot.generation = generation;
        slot.phase = SlotPhase::Active;
        slot.first_text_at = None;
        slot.metrics = PlaybackMetrics::for_request(session.request_id());
        slot.saved_audio.clear();
        info!(task_id = %session.request_id(), voice = %shared.settings.parameters.voice, "session started");
        slot.session = Some(session);
        Some(generation)
    }

    /// Submit text to the active session.
    ///
    /// Errors with `NoActiveSession` before `start_session`; does nothing if
    /// the session was interrupted.
    pub fn send_text(&self, text: &str) -> Result<()> {
        let generation = {
            let slot = self.shared.slot();
            match slot.phase {
                SlotPhase::Idle => return Err(SayshError::NoActiveSession),
                SlotPhase::Interrupted => return Ok(()),
                SlotPhase::Active => {}
            }
            if slot.session.is_none() {
                return Err(SayshError::NoActiveSession);
            }
            slot.generation
        };
        self.send_as(generation, text)
    }

    /// Send on behalf of `generation`; a no-op once it lost the slot.
    fn send_as(&self, generation: u64, text: &str) -> Result<()> {
        let session = {
            let mut slot = self.shared.slot();
            if !slot.admits(generation) {
                debug!(generation, "send for a replaced session dropped");
                return Ok(());
            }
            let Some(session) = slot.session.clone() else {
                return Ok(());
            };
            if slot.first_text_at.is_none() {
                slot.first_text_at = Some(Instant::now());
            }
            session
        };

        match session.send_text(text) {
            Ok(()) => Ok(()),
            Err(e) if self.was_interrupted(generation) => {
                debug!(error = %e, "send after interrupt ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Finish the active session and block until it completes.
    pub fn finish_session(&self) -> Result<()> {
        let Some((_, generation)) = self.current() else {
            warn!("no active session to finish");
            return Ok(());
        };
        self.finish_as(generation)
    }

    /// Blocking finish of the session held by `generation`, if it still is.
    fn finish_as(&self, generation: u64) -> Result<()> {
        let Some(session) = self.owned(generation) else {
            debug!(generation, "session already replaced, nothing to finish");
            return Ok(());
        };
        if session.state() == TaskState::Idle {
            // Nothing was submitted; there is no remote task to finish.
            self.release(generation);
            return Ok(());
        }
        match session.finish(None) {
            Ok(()) => Ok(()),
            Err(e) if self.was_interrupted(generation) => {
                debug!(error = %e, "finish after interrupt ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Finish the active session without blocking the executor.
    ///
    /// With `wait`, polls the slot every 100ms until the session closes.
    pub async fn finish_session_async(&self, wait: bool) -> Result<()> {
        let Some((_, generation)) = self.current() else {
            warn!("no active session to finish");
            return Ok(());
        };
        self.finish_as_async(generation, wait).await
    }

    async fn finish_as_async(&self, generation: u64, wait: bool) -> Result<()> {
        let Some(session) = self.owned(generation) else {
            debug!(generation, "session already replaced, nothing to finish");
            return Ok(());
        };
        if session.state() == TaskState::Idle {
            self.release(generation);
            return Ok(());
        }
        if let Err(e) = session.finish_in_background(None) {
            if self.was_interrupted(generation) {
                debug!(error = %e, "finish after interrupt ignored");
                return Ok(());
            }
            return Err(e);
        }
        if wait {
            while self.shared.admits(generation) {
                tokio::time::sleep(defaults::RETRY_INTERVAL).await;
            }
        }
        Ok(())
    }

    /// Stop the active session and discard its remaining audio.
    pub fn interrupt(&self) -> Result<()> {
        let session = {
            let mut slot = self.shared.slot();
            if slot.phase != SlotPhase::Active {
                warn!("no active session to interrupt");
                return Err(SayshError::NoActiveSession);
            }
            slot.phase = SlotPhase::Interrupted;
            slot.saved_audio.clear();
            slot.session.take()
        };

        if let Some(session) = session
            && let Err(e) = session.cancel()
        {
            warn!(error = %e, "cancel during interrupt failed");
        }
        if let Some(sink) = &self.shared.sink {
            sink.reset();
        }
        info!("playback interrupted");
        Ok(())
    }

    /// Active and not interrupted.
    pub fn is_busy(&self) -> bool {
        self.shared.slot().phase == SlotPhase::Active
    }

    pub fn is_session_active(&self) -> bool {
        self.is_busy()
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.slot().phase == SlotPhase::Interrupted
    }

    pub fn phase(&self) -> SlotPhase {
        self.shared.slot().phase
    }

    /// Metrics of the current or last session.
    pub fn metrics(&self) -> PlaybackMetrics {
        let slot = self.shared.slot();
        let mut metrics = slot.metrics.clone();
        if let Some(session) = &slot.session {
            metrics.request_id = Some(session.request_id().to_string());
            if let Some(delay) = session.first_package_delay() {
                metrics.first_audio_delay_ms = Some(millis(delay));
            }
        }
        metrics
    }

    /// Start, send and finish in one blocking call.
    ///
    /// Returns `Ok(false)` when another session holds the slot.
    pub fn tts(&self, text: &str) -> Result<bool> {
        let Some(generation) = self.begin() else {
            return Ok(false);
        };
        let result = self
            .send_as(generation, text)
            .and_then(|()| self.finish_as(generation));
        if let Err(e) = result {
            self.release(generation);
            return Err(e);
        }
        Ok(true)
    }

    /// Stream text chunks into a fresh session and wait for playback to end.
    ///
    /// Returns false when the slot is taken, the session fails or it is
    /// interrupted. An interrupt stops consumption of `chunks` between
    /// items and leaves whatever holds the slot afterwards untouched.
    pub async fn speak_stream<S>(&self, mut chunks: S) -> bool
    where
        S: Stream<Item = String> + Unpin + Send,
    {
        let Some(generation) = self.begin() else {
            return false;
        };

        let result: Result<bool> = async {
            while let Some(chunk) = chunks.next().await {
                if !self.shared.admits(generation) {
                    debug!(generation, "stream stopped by interrupt");
                    return Ok(false);
                }
                if chunk.is_empty() {
                    continue;
                }
                let handle = self.clone();
                tokio::task::spawn_blocking(move || handle.send_as(generation, &chunk))
                    .await
                    .map_err(|e| SayshError::Other(format!("send task failed: {}", e)))??;
            }
            if !self.shared.admits(generation) {
                debug!(generation, "stream ended after losing the slot");
                return Ok(false);
            }
            self.finish_as_async(generation, true).await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(played) => played,
            Err(e) => {
                error!(error = %e, "streamed playback failed");
                self.release(generation);
                false
            }
        }
    }

    /// Cancel any live session and shut the audio output down.
    pub fn close(&self) {
        let session = {
            let mut slot = self.shared.slot();
            slot.phase = SlotPhase::Idle;
            slot.generation += 1;
            slot.session.take()
        };
        if let Some(session) = session
            && !session.state().is_terminal()
            && let Err(e) = session.cancel()
        {
            debug!(error = %e, "cancel on close failed");
        }
        if let Some(sink) = &self.shared.sink {
            sink.close();
        }
        info!("orchestrator closed");
    }

    fn current(&self) -> Option<(Arc<SynthesisSession>, u64)> {
        let slot = self.shared.slot();
        if slot.phase != SlotPhase::Active {
            return None;
        }
        slot.session.clone().map(|s| (s, slot.generation))
    }

    fn owned(&self, generation: u64) -> Option<Arc<SynthesisSession>> {
        let slot = self.shared.slot();
        if !slot.admits(generation) {
            return None;
        }
        slot.session.clone()
    }

    fn was_interrupted(&self, generation: u64) -> bool {
        let slot = self.shared.slot();
        slot.generation != generation || slot.phase == SlotPhase::Interrupted
    }

    /// Free the slot held by `generation`, cancelling its session if live.
    fn release(&self, generation: u64) {
        let session = {
            let mut slot = self.shared.slot();
            if !slot.admits(generation) {
                return;
            }
            slot.phase = SlotPhase::Idle;
            slot.session.take()
        };
        if let Some(session) = session
            && !session.state().is_terminal()
            && let Err(e) = session.cancel()
        {
            debug!(error = %e, "cancel on release failed");
        }
        debug!(generation, "session slot released");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("phase", &self.phase())
            .finish()
    }
}
