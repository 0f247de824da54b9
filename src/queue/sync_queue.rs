//! Bounded FIFO drained by a dedicated worker thread.
//!
//! The worker retries each item until the orchestrator accepts it or the
//! item's deadline passes. A full queue rejects new items; nothing already
//! queued is ever dropped to make room.

use crate::defaults::RETRY_INTERVAL;
use crate::error::{Result, SayshError};
use crate::player::Orchestrator;
use crate::queue::{AdmitOutcome, Admission, preview};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Text waiting for the synchronous path.
#[derive(Debug, Clone)]
pub struct SyncItem {
    pub enqueued_at: Instant,
    pub text: String,
    /// Give up this long after `enqueued_at`; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl SyncItem {
    pub fn new(text: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            enqueued_at: Instant::now(),
            text: text.into(),
            timeout,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.enqueued_at + t)
    }
}

/// Synchronous admission path with its worker.
pub struct SyncQueue {
    tx: Sender<SyncItem>,
    rx: Receiver<SyncItem>,
    orchestrator: Orchestrator,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncQueue {
    /// Create the queue; call [`SyncQueue::start`] to begin dispatching.
    pub fn new(orchestrator: Orchestrator, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            orchestrator,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker if it is not already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let rx = self.rx.clone();
        let orchestrator = self.orchestrator.clone();
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("saysh-sync-queue".to_string())
            .spawn(move || worker_loop(rx, orchestrator, running))
            .map_err(|e| SayshError::Other(format!("Failed to spawn queue worker: {}", e)))?;
        *worker = Some(handle);
        info!("sync queue worker started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker, waiting up to 1s for it to exit.
    ///
    /// A worker stuck inside a blocking playback is detached.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };

        let deadline = Instant::now() + Duration::from_secs(1);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                error!("sync queue worker panicked");
            }
        } else {
            warn!("sync queue worker still busy, detaching");
        }
    }
}

impl Admission for SyncQueue {
    type Item = SyncItem;

    fn admit(&self, item: SyncItem) -> AdmitOutcome {
        let text = preview(&item.text);
        match self.tx.try_send(item) {
            Ok(()) => {
                let depth = self.tx.len();
                info!(depth, text = %text, "text queued for playback");
                AdmitOutcome::Queued { depth }
            }
            Err(TrySendError::Full(_)) => {
                warn!(capacity = ?self.tx.capacity(), text = %text, "sync queue full, text rejected");
                AdmitOutcome::Rejected
            }
            Err(TrySendError::Disconnected(_)) => AdmitOutcome::Rejected,
        }
    }

    fn pending(&self) -> usize {
        self.tx.len()
    }
}

impl Drop for SyncQueue {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn worker_loop(rx: Receiver<SyncItem>, orchestrator: Orchestrator, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(RETRY_INTERVAL) {
            Ok(item) => dispatch(&orchestrator, item, &running),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("sync queue worker exiting");
}

/// Retry `item` until it plays, fails, or its deadline passes.
fn dispatch(orchestrator: &Orchestrator, item: SyncItem, running: &AtomicBool) {
    let deadline = item.deadline();
    loop {
        if let Some(deadline) = deadline
            && Instant::now() > deadline
        {
            warn!(text = %preview(&item.text), "queued text timed out, dropping");
            return;
        }

        match orchestrator.tts(&item.text) {
            Ok(true) => {
                info!(
                    waited_ms = item.enqueued_at.elapsed().as_millis() as u64,
                    "queued text played"
                );
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, text = %preview(&item.text), "queued text failed, dropping");
                return;
            }
        }

        if !running.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(RETRY_INTERVAL);
    }
}
