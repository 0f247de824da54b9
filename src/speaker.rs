//! Composition root tying the orchestrator, both queues and volume control
//! together.

use crate::audio::sink::{AudioSink, ProcessSink};
use crate::audio::volume::{CommandExecutor, SystemCommandExecutor, VolumeController};
use crate::config::Config;
use crate::error::{Result, SayshError};
use crate::player::{Orchestrator, PlaybackMetrics};
use crate::queue::{AdmitOutcome, Admission, AsyncQueue, PostPlayHook, SyncItem, SyncQueue, TextStream};
use crate::transport::WebSocketConnector;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Volume controller over a shared executor.
pub type SharedVolume = VolumeController<Arc<dyn CommandExecutor>>;

/// One playback slot fed by a blocking queue and a freshness-first queue.
pub struct Speaker {
    orchestrator: Orchestrator,
    sync_queue: SyncQueue,
    async_queue: AsyncQueue,
    volume: SharedVolume,
}

impl Speaker {
    /// Assemble a speaker and start the synchronous queue worker.
    ///
    /// The async queue starts on first use, on whatever tokio runtime the
    /// caller is on.
    pub fn new(
        orchestrator: Orchestrator,
        volume: SharedVolume,
        sync_capacity: usize,
        async_capacity: usize,
        async_ttl: Duration,
    ) -> Result<Self> {
        let sync_queue = SyncQueue::new(orchestrator.clone(), sync_capacity);
        sync_queue.start()?;
        let async_queue = AsyncQueue::new(orchestrator.clone(), async_capacity, async_ttl);
        Ok(Self {
            orchestrator,
            sync_queue,
            async_queue,
            volume,
        })
    }

    /// Build a speaker talking to the configured service.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let settings = config.session_settings()?;

        let sink: Option<Arc<dyn AudioSink>> = if config.playback.enabled {
            let sink = ProcessSink::from_command_line(&config.playback.command).ok_or_else(|| {
                SayshError::ConfigInvalidValue {
                    key: "playback.command".to_string(),
                    message: "must name a program".to_string(),
                }
            })?;
            Some(Arc::new(sink))
        } else {
            None
        };

        let orchestrator = Orchestrator::new(
            settings,
            Arc::new(WebSocketConnector::new()),
            sink,
            config.save_dir(),
        )?;

        let executor: Arc<dyn CommandExecutor> = Arc::new(SystemCommandExecutor::new());
        let volume = VolumeController::new(
            executor,
            config.playback.volume_command.clone(),
            config.playback.volume,
        );
        if config.playback.enabled
            && let Err(e) = volume.set_volume(i32::from(config.playback.volume))
        {
            warn!(error = %e, "could not apply initial volume");
        }

        let speaker = Self::new(
            orchestrator,
            volume,
            config.queue.sync_capacity,
            config.queue.async_capacity,
            config.async_ttl(),
        )?;
        info!(
            voice = %config.synthesis.voice,
            model = %config.service.model,
            playback = config.playback.enabled,
            "speaker ready"
        );
        Ok(speaker)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Speak `text` now, blocking until playback ends.
    ///
    /// Returns `Ok(false)` when another utterance holds the slot.
    pub fn tts(&self, text: &str) -> Result<bool> {
        self.orchestrator.tts(text)
    }

    /// Speak `text` now, or hand it to the synchronous queue when busy.
    ///
    /// `timeout` bounds how long the queued item may wait. Returns false only
    /// when the queue is full.
    pub fn tts_with_queue(&self, text: &str, timeout: Option<Duration>) -> Result<bool> {
        if self.orchestrator.tts(text)? {
            return Ok(true);
        }
        let outcome = self.sync_queue.admit(SyncItem::new(text, timeout));
        if let AdmitOutcome::Queued { depth } = outcome {
            info!(depth, "speaker busy, text queued");
        }
        Ok(outcome.is_accepted())
    }

    pub fn enqueue_text(&self, text: impl Into<String>) -> AdmitOutcome {
        self.async_queue.enqueue_text(text)
    }

    pub async fn enqueue_text_stream(&self, chunks: TextStream) -> AdmitOutcome {
        self.async_queue.enqueue_text_stream(chunks).await
    }

    /// Start the async consumer; false outside a tokio runtime.
    pub fn start_queue(&self) -> bool {
        self.async_queue.start()
    }

    pub fn stop_queue(&self) {
        self.async_queue.stop();
    }

    pub fn set_post_play_hook(&self, hook: Option<Arc<dyn PostPlayHook>>) {
        self.async_queue.set_post_play_hook(hook);
    }

    /// Barge in over the current utterance.
    pub fn interrupt(&self) -> String {
        match self.orchestrator.interrupt() {
            Ok(()) => "Speech interrupted".to_string(),
            Err(_) => "Nothing is playing".to_string(),
        }
    }

    /// Nudge the volume, staying inside the comfortable range.
    pub fn volume_change(&self, delta: i32) -> String {
        self.volume.change_volume(delta)
    }

    pub fn set_volume(&self, percent: i32) -> Result<u8> {
        self.volume.set_volume(percent)
    }

    pub fn volume(&self) -> u8 {
        self.volume.volume()
    }

    pub fn is_busy(&self) -> bool {
        self.orchestrator.is_busy()
    }

    /// Nothing playing and nothing waiting in either queue.
    pub fn is_idle(&self) -> bool {
        !self.orchestrator.is_session_active()
            && self.sync_queue.is_empty()
            && self.async_queue.is_empty()
    }

    pub fn metrics(&self) -> PlaybackMetrics {
        self.orchestrator.metrics()
    }

    /// Stop both queues and shut playback down.
    pub fn close(&self) {
        self.async_queue.stop();
        self.sync_queue.stop();
        self.orchestrator.close();
    }
}

impl std::fmt::Debug for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Speaker")
            .field("orchestrator", &self.orchestrator)
            .field("volume", &self.volume())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::MemorySink;
    use crate::audio::volume::MockCommandExecutor;
    use crate::player::SessionSettings;
    use crate::transport::mock::ScriptedConnector;
    use std::thread;

    struct Fixture {
        speaker: Speaker,
        connector: Arc<ScriptedConnector>,
        sink: Arc<MemorySink>,
        executor: Arc<MockCommandExecutor>,
    }

    fn fixture(connector: ScriptedConnector) -> Fixture {
        let connector = Arc::new(connector);
        let sink = Arc::new(MemorySink::new());
        let executor = Arc::new(MockCommandExecutor::new());
        let orchestrator = Orchestrator::new(
            SessionSettings::new("sk-test"),
            connector.clone(),
            Some(sink.clone()),
            None,
        )
        .unwrap();
        let shared: Arc<dyn CommandExecutor> = executor.clone();
        let volume = VolumeController::new(shared, "termux-volume", 20);
        let speaker = Speaker::new(orchestrator, volume, 10, 1, Duration::from_secs(3)).unwrap();
        Fixture {
            speaker,
            connector,
            sink,
            executor,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn tts_plays_and_leaves_speaker_idle() {
        let f = fixture(ScriptedConnector::new().with_chunks(vec![1000, 2000]));
        assert!(f.speaker.tts("hello").unwrap());
        assert!(f.speaker.is_idle());
        assert_eq!(f.speaker.metrics().audio_bytes, 3000);
        assert!(f.sink.byte_count() >= 3000);
        f.speaker.close();
    }

    #[test]
    fn tts_with_queue_defers_while_busy() {
        let f = fixture(ScriptedConnector::new());
        assert!(f.speaker.orchestrator().start_session());
        assert!(!f.speaker.is_idle());

        assert!(f.speaker.tts_with_queue("queued", None).unwrap());
        assert!(f.connector.sent_texts().is_empty());

        f.speaker.orchestrator().finish_session().unwrap();
        assert!(wait_until(|| f.connector.sent_texts() == vec!["queued"]));
        assert!(wait_until(|| f.speaker.is_idle()));
        f.speaker.close();
    }

    #[test]
    fn interrupt_reports_outcome() {
        let f = fixture(ScriptedConnector::new());
        assert_eq!(f.speaker.interrupt(), "Nothing is playing");

        assert!(f.speaker.orchestrator().start_session());
        assert_eq!(f.speaker.interrupt(), "Speech interrupted");
        assert!(!f.speaker.is_busy());
        f.speaker.close();
    }

    #[test]
    fn volume_change_clamps_to_comfortable_range() {
        let f = fixture(ScriptedConnector::new());
        assert_eq!(f.speaker.volume(), 20);

        assert_eq!(f.speaker.volume_change(-40), "Volume set to minimum 5");
        assert_eq!(f.speaker.volume(), 5);

        f.speaker.set_volume(20).unwrap();
        assert_eq!(f.speaker.volume_change(40), "Volume set to maximum 35");
        assert_eq!(f.speaker.volume(), 35);

        let calls = f.executor.calls();
        assert_eq!(calls[0], ("termux-volume".to_string(), vec!["system".to_string(), "1".to_string()]));
        assert_eq!(calls.last().unwrap().1, vec!["system".to_string(), "7".to_string()]);
        f.speaker.close();
    }

    #[test]
    fn close_shuts_sink_down() {
        let f = fixture(ScriptedConnector::new());
        f.speaker.close();
        assert_eq!(f.sink.close_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn enqueue_text_plays_through_async_queue() {
        let f = fixture(ScriptedConnector::new());
        assert!(f.speaker.enqueue_text("async hello").is_accepted());

        for _ in 0..300 {
            if f.connector.sent_texts() == vec!["async hello"] && f.speaker.is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.connector.sent_texts(), vec!["async hello"]);
        f.speaker.close();
    }
}
