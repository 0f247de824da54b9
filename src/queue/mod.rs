//! Admission paths onto the single synthesis session.
//!
//! Two disciplines share one capability: [`SyncQueue`] keeps every item and
//! retries until its deadline, [`AsyncQueue`] keeps only the freshest items
//! and drops anything that waited longer than its time-to-live.

pub mod async_queue;
pub mod sync_queue;

pub use async_queue::{AsyncQueue, PostPlayHook, TextStream, Utterance};
pub use sync_queue::{SyncItem, SyncQueue};

/// What happened to an item offered to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Accepted; `depth` items are now pending.
    Queued { depth: usize },
    /// Accepted after evicting the oldest pending item.
    Evicted { depth: usize },
    /// Not accepted.
    Rejected,
}

impl AdmitOutcome {
    pub fn is_accepted(self) -> bool {
        !matches!(self, AdmitOutcome::Rejected)
    }
}

/// Offer items to a queue.
pub trait Admission {
    type Item;

    fn admit(&self, item: Self::Item) -> AdmitOutcome;

    /// Items waiting for dispatch.
    fn pending(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

/// First few characters of `text` for log lines.
pub(crate) fn preview(text: &str) -> String {
    const LEN: usize = 20;
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(LEN).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
