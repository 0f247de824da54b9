//! Freshness-first queue consumed by a tokio task.
//!
//! Admission evicts the oldest pending item when the queue is full, and the
//! consumer drops anything that waited longer than the time-to-live. After
//! every playback cycle an optional [`PostPlayHook`] runs.

use crate::defaults::RETRY_INTERVAL;
use crate::error::Result;
use crate::player::Orchestrator;
use crate::queue::{AdmitOutcome, Admission, preview};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt, stream};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lazily produced text, e.g. tokens from a language model.
pub type TextStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Something to say.
pub enum Utterance {
    Text(String),
    Stream(TextStream),
}

impl Utterance {
    pub fn stream<S>(chunks: S) -> Self
    where
        S: Stream<Item = String> + Send + 'static,
    {
        Utterance::Stream(Box::pin(chunks))
    }

    fn into_stream(self) -> TextStream {
        match self {
            Utterance::Text(text) if text.is_empty() => Box::pin(stream::empty()),
            Utterance::Text(text) => Box::pin(stream::iter([text])),
            Utterance::Stream(chunks) => chunks,
        }
    }
}

impl From<String> for Utterance {
    fn from(text: String) -> Self {
        Utterance::Text(text)
    }
}

impl From<&str> for Utterance {
    fn from(text: &str) -> Self {
        Utterance::Text(text.to_string())
    }
}

impl fmt::Debug for Utterance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Utterance::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Utterance::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Runs after each playback cycle of the async queue.
#[async_trait]
pub trait PostPlayHook: Send + Sync {
    /// `first_audio_delay` is zero when no audio arrived.
    async fn after_playback(&self, first_audio_delay: Duration) -> Result<()>;
}

struct Pending {
    enqueued_at: Instant,
    utterance: Utterance,
}

struct QueueInner {
    items: Mutex<VecDeque<Pending>>,
    capacity: usize,
    ttl: Duration,
    notify: Notify,
    orchestrator: Orchestrator,
    hook: Mutex<Option<Arc<dyn PostPlayHook>>>,
}

impl QueueInner {
    fn items(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn next(&self) -> Pending {
        loop {
            if let Some(pending) = self.items().pop_front() {
                return pending;
            }
            self.notify.notified().await;
        }
    }

    fn expired(&self, pending: &Pending) -> bool {
        pending.enqueued_at.elapsed() > self.ttl
    }

    /// First-audio delay to report for a cycle; zero when nothing played,
    /// since the slot's metrics then belong to another session.
    fn playback_delay(&self, played: bool) -> Duration {
        if !played {
            return Duration::ZERO;
        }
        self.orchestrator
            .metrics()
            .first_audio_delay()
            .unwrap_or_default()
    }

    async fn run(self: Arc<Self>) {
        loop {
            let pending = self.next().await;
            if self.expired(&pending) {
                warn!(
                    age_ms = pending.enqueued_at.elapsed().as_millis() as u64,
                    "queued utterance expired, dropping"
                );
                continue;
            }

            // Another path may hold the slot; wait while the item is fresh.
            while self.orchestrator.is_busy() {
                if self.expired(&pending) {
                    break;
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            if self.expired(&pending) {
                warn!("queued utterance expired while waiting, dropping");
                continue;
            }

            let played = self
                .orchestrator
                .speak_stream(pending.utterance.into_stream())
                .await;
            debug!(played, "async queue cycle done");

            let hook = self.hook.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(hook) = hook {
                let delay = self.playback_delay(played);
                if let Err(e) = hook.after_playback(delay).await {
                    error!(error = %e, "post-play hook failed");
                }
            }
        }
    }
}

/// Asynchronous admission path.
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncQueue {
    pub fn new(orchestrator: Orchestrator, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                ttl,
                notify: Notify::new(),
                orchestrator,
                hook: Mutex::new(None),
            }),
            consumer: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn set_post_play_hook(&self, hook: Option<Arc<dyn PostPlayHook>>) {
        *self.inner.hook.lock().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    /// Spawn the consumer on the current tokio runtime if not running.
    ///
    /// Returns false outside a runtime.
    pub fn start(&self) -> bool {
        let mut consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
        if consumer.as_ref().is_some_and(|h| !h.is_finished()) {
            return true;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("async queue needs a tokio runtime");
            return false;
        };
        *consumer = Some(runtime.spawn(Arc::clone(&self.inner).run()));
        info!(capacity = self.inner.capacity, "async queue started");
        true
    }

    /// Abort the consumer and drop every pending item.
    pub fn stop(&self) {
        if let Some(handle) = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.inner.items().clear();
        info!("async queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Queue complete text, starting the consumer if needed.
    pub fn enqueue_text(&self, text: impl Into<String>) -> AdmitOutcome {
        self.start();
        self.admit(Utterance::Text(text.into()))
    }

    /// Queue a text stream.
    ///
    /// While anything is playing or pending, the stream is first drained into
    /// one string so two live producers never feed the same session.
    pub async fn enqueue_text_stream(&self, chunks: TextStream) -> AdmitOutcome {
        self.start();
        if self.inner.orchestrator.is_busy() || !self.is_empty() {
            let text: String = chunks.collect::<Vec<String>>().await.concat();
            debug!(text = %preview(&text), "busy, queued stream as text");
            return self.admit(Utterance::Text(text));
        }
        self.admit(Utterance::Stream(chunks))
    }
}

impl Admission for AsyncQueue {
    type Item = Utterance;

    fn admit(&self, utterance: Utterance) -> AdmitOutcome {
        let outcome = {
            let mut items = self.inner.items();
            let mut evicted = false;
            while items.len() >= self.inner.capacity.max(1) {
                items.pop_front();
                evicted = true;
            }
            items.push_back(Pending {
                enqueued_at: Instant::now(),
                utterance,
            });
            let depth = items.len();
            if evicted {
                debug!(depth, "async queue full, evicted oldest");
                AdmitOutcome::Evicted { depth }
            } else {
                AdmitOutcome::Queued { depth }
            }
        };
        self.inner.notify.notify_one();
        outcome
    }

    fn pending(&self) -> usize {
        self.inner.items().len()
    }
}

impl Drop for AsyncQueue {
    fn drop(&mut self) {
        if let Some(handle) = self
            .consumer
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
