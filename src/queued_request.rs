//! One suspended admission attempt.
//!
//! A `QueuedRequest` lives for one logical `request_quota` call. It moves through
//! `created -> waiting -> {processing | aborted}`: arming it installs a fresh wake-up channel
//! (waiting), a bundle handing it capacity consumes that channel (processing), and an abort
//! invalidates it for good. After processing, the same request may be armed again when the
//! admission walk has to queue once more.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::trace;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedState {
    Created,
    Waiting,
    Processing,
    Aborted,
}

struct Slot {
    state: QueuedState,
    wake: Option<oneshot::Sender<()>>,
}

pub struct QueuedRequest {
    id: u64,
    manager_name: String,
    slot: Mutex<Slot>,
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("manager_name", &self.manager_name)
            .field("state", &self.state())
            .finish()
    }
}

impl QueuedRequest {
    pub fn new(manager_name: impl Into<String>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            manager_name: manager_name.into(),
            slot: Mutex::new(Slot { state: QueuedState::Created, wake: None }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn manager_name(&self) -> &str {
        &self.manager_name
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> QueuedState {
        self.lock().state
    }

    /// An aborted request must never be handed capacity again.
    pub fn is_valid(&self) -> bool {
        self.state() != QueuedState::Aborted
    }

    /// Prepare for the next wait. Returns the receiving end of the wake-up.
    pub(crate) fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.lock();
        if slot.state != QueuedState::Aborted {
            slot.state = QueuedState::Waiting;
            slot.wake = Some(tx);
        }
        rx
    }

    /// Wake the waiting caller so it re-runs its admission walk.
    ///
    /// Returns `false` when there was nobody to wake (aborted, or already processing).
    pub(crate) fn process(&self) -> bool {
        let mut slot = self.lock();
        if slot.state != QueuedState::Waiting {
            return false;
        }
        slot.state = QueuedState::Processing;
        if let Some(wake) = slot.wake.take() {
            // a dropped receiver is cleaned up by the caller's own abort
            let _ = wake.send(());
        }
        trace!(request = self.id, "queued request processing");
        true
    }

    /// Invalidate for good. Returns the state it was in before.
    pub(crate) fn abort(&self) -> QueuedState {
        let mut slot = self.lock();
        let previous = slot.state;
        slot.state = QueuedState::Aborted;
        slot.wake = None;
        trace!(request = self.id, ?previous, "queued request aborted");
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn ids_are_unique() {
        let a = QueuedRequest::new("m");
        let b = QueuedRequest::new("m");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), QueuedState::Created);
    }

    #[tokio::test]
    async fn process_wakes_armed_request_once() {
        let request = QueuedRequest::new("m");
        let rx = request.arm();
        assert_eq!(request.state(), QueuedState::Waiting);
        assert!(request.process());
        assert!(!request.process());
        assert_eq!(request.state(), QueuedState::Processing);
        assert!(rx.await.is_ok());
    }

    #[test]
    fn aborted_request_is_never_processed() {
        let request = QueuedRequest::new("m");
        let mut rx = request.arm();
        assert_eq!(request.abort(), QueuedState::Waiting);
        assert!(!request.is_valid());
        assert!(!request.process());

        // the sender was dropped with the abort
        assert!(matches!((&mut rx).now_or_never(), Some(Err(_))));

        let _ = request.arm();
        assert_eq!(request.state(), QueuedState::Aborted);
    }
}
