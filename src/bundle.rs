//! Per-scope state of one rule: a throttling, an optional wait list, and the timers that free
//! capacity.
//!
//! Every access to a bundle's state goes through its mutex, so check-then-reserve sequences
//! are atomic. Admission walks that span several bundles lock them in ascending [`ScopeBundle::id`]
//! order.
//!
//! Wake-ups are handed out one at a time: [`ScopeBundle::more_available`] pops the first valid
//! waiter and counts it as *in flight* until that waiter has finished its next admission pass.
//! While a waiter is in flight, newcomers queue behind it instead of taking the freed capacity.

use crate::error::ConfigError;
use crate::grant::RuleFeedback;
use crate::queued_request::{QueuedRequest, QueuedState};
use crate::queueing::Queueing;
use crate::throttling::{ErrorContext, OnError, Reservation, Throttling};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, trace};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct BundleState {
    pub(crate) throttling: Box<dyn Throttling>,
    pub(crate) queueing: Option<Box<dyn Queueing>>,
    /// Woken waiters that have not finished their admission pass yet.
    pub(crate) in_flight: usize,
}

impl BundleState {
    /// Whether `amount` can be admitted now. Requests that never queued also have to respect
    /// everybody already waiting.
    pub(crate) fn admits(&self, amount: u64, queued: bool) -> bool {
        if !queued {
            if let Some(queueing) = &self.queueing {
                if queueing.number_waiting() > 0 || self.in_flight > 0 {
                    return false;
                }
            }
        }
        self.throttling.is_available(amount)
    }

    pub(crate) fn has_queue(&self) -> bool {
        self.queueing.is_some()
    }

    pub(crate) fn enqueue(&mut self, request: Arc<QueuedRequest>, again: bool) {
        if let Some(queueing) = self.queueing.as_mut() {
            if again {
                queueing.add_again(request);
            } else {
                queueing.add(request);
            }
        }
    }
}

pub struct ScopeBundle {
    id: u64,
    rule: String,
    key: String,
    on_error: Option<OnError>,
    runtime: Handle,
    state: Mutex<BundleState>,
}

impl fmt::Debug for ScopeBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ScopeBundle")
            .field("id", &self.id)
            .field("rule", &self.rule)
            .field("key", &self.key)
            .field("throttling", &state.throttling)
            .field("waiting", &state.queueing.as_ref().map(|q| q.number_waiting()))
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

impl ScopeBundle {
    /// Create a bundle and arm its window timer, if the throttling resets on a schedule.
    ///
    /// Timers run on the current tokio runtime.
    pub(crate) fn new(
        rule: String,
        key: String,
        throttling: Box<dyn Throttling>,
        queueing: Option<Box<dyn Queueing>>,
        on_error: Option<OnError>,
    ) -> Result<Arc<Self>, ConfigError> {
        let runtime = Handle::try_current().map_err(|_| ConfigError::MissingRuntime)?;
        let first_reset = throttling.next_reset();
        let bundle = Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            rule,
            key,
            on_error,
            runtime,
            state: Mutex::new(BundleState { throttling, queueing, in_flight: 0 }),
        });
        if let Some(delay) = first_reset {
            bundle.arm_window(delay);
        }
        trace!(rule = %bundle.rule, scope = %bundle.key, "scope bundle created");
        Ok(bundle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Formatted scope key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn used(&self) -> u64 {
        self.lock().throttling.used()
    }

    pub fn limit(&self) -> Option<u64> {
        self.lock().throttling.limit()
    }

    pub fn number_waiting(&self) -> usize {
        self.lock().queueing.as_ref().map_or(0, |q| q.number_waiting())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BundleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake the next valid waiter, unless one is already in flight.
    pub fn more_available(&self) {
        let mut state = self.lock();
        if state.in_flight > 0 {
            return;
        }
        let BundleState { queueing, in_flight, .. } = &mut *state;
        let Some(queueing) = queueing.as_mut() else {
            return;
        };
        while let Some(request) = queueing.next() {
            if request.process() {
                *in_flight += 1;
                debug!(
                    rule = %self.rule,
                    scope = %self.key,
                    request = request.id(),
                    waiting = queueing.number_waiting(),
                    "woke queued request"
                );
                return;
            }
        }
    }

    /// A woken waiter finished its pass without re-queueing here.
    pub(crate) fn finish_wake(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.more_available();
    }

    /// Cancel a waiter queued on this bundle and pass on any wake-up it consumed.
    pub(crate) fn abort(&self, request: &QueuedRequest) {
        {
            let mut state = self.lock();
            match request.abort() {
                QueuedState::Waiting => {
                    if let Some(queueing) = state.queueing.as_mut() {
                        queueing.remove(request.id());
                    }
                }
                QueuedState::Processing => state.in_flight = state.in_flight.saturating_sub(1),
                QueuedState::Created | QueuedState::Aborted => {}
            }
        }
        debug!(rule = %self.rule, scope = %self.key, request = request.id(), "queued request aborted");
        self.more_available();
    }

    /// Hand back a granted reservation with its feedback.
    pub(crate) fn release(self: &Arc<Self>, amount: u64, feedback: &RuleFeedback) {
        let (wake, decays) = {
            let mut state = self.lock();
            let mut wake = state.throttling.dismiss(amount, feedback);
            let mut decays = Vec::new();
            // the hook sees the state after the release, so saturating blocks fully
            if let (Some(error), Some(on_error)) = (&feedback.error, &self.on_error) {
                let mut ctx = ErrorContext::new(&mut *state.throttling);
                on_error(&mut ctx, error);
                wake |= ctx.wake;
                decays = ctx.decays;
            }
            (wake, decays)
        };
        for reservation in decays {
            self.schedule_decay(reservation);
        }
        if wake {
            self.more_available();
        }
    }

    /// Arm the expiry timer of a decaying reservation.
    pub(crate) fn schedule_decay(self: &Arc<Self>, reservation: Reservation) {
        let Some(after) = reservation.decays_after else {
            return;
        };
        if reservation.amount == 0 {
            return;
        }
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(bundle) = weak.upgrade() {
                let wake = bundle.lock().throttling.expire(reservation.amount);
                trace!(rule = %bundle.rule, scope = %bundle.key, amount = reservation.amount, "reservation expired");
                if wake {
                    bundle.more_available();
                }
            }
        });
    }

    fn arm_window(self: &Arc<Self>, first: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let mut delay = first;
            loop {
                tokio::time::sleep(delay).await;
                let Some(bundle) = weak.upgrade() else {
                    return;
                };
                let next = {
                    let mut state = bundle.lock();
                    state.throttling.reset_window();
                    state.throttling.next_reset()
                };
                trace!(rule = %bundle.rule, scope = %bundle.key, "window reset");
                bundle.more_available();
                match next {
                    Some(next) => delay = next,
                    None => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queueing::Fifo;
    use crate::throttling::{LimitConcurrency, WindowSliding};

    fn concurrency(limit: u64, queued: bool) -> Arc<ScopeBundle> {
        let queueing: Option<Box<dyn Queueing>> = if queued { Some(Box::new(Fifo::new())) } else { None };
        ScopeBundle::new(
            "test".into(),
            String::new(),
            Box::new(LimitConcurrency::new(Some(limit)).unwrap()),
            queueing,
            None,
        )
        .unwrap()
    }

    #[test]
    fn requires_a_runtime() {
        let err = ScopeBundle::new(
            "test".into(),
            String::new(),
            Box::new(LimitConcurrency::new(Some(1)).unwrap()),
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::MissingRuntime);
    }

    #[tokio::test]
    async fn newcomers_respect_waiters_and_in_flight() {
        let bundle = concurrency(1, true);
        assert!(bundle.lock().admits(1, false));

        let waiter = Arc::new(QueuedRequest::new("m"));
        let _rx = waiter.arm();
        bundle.lock().enqueue(waiter.clone(), false);
        assert!(!bundle.lock().admits(1, false));
        assert!(bundle.lock().admits(1, true));

        bundle.more_available();
        let state = bundle.lock();
        assert_eq!(state.in_flight, 1);
        assert!(!state.admits(1, false));
    }

    #[tokio::test]
    async fn more_available_wakes_one_at_a_time() {
        let bundle = concurrency(1, true);
        let (a, b) = (Arc::new(QueuedRequest::new("m")), Arc::new(QueuedRequest::new("m")));
        let rx_a = a.arm();
        let _rx_b = b.arm();
        bundle.lock().enqueue(a.clone(), false);
        bundle.lock().enqueue(b.clone(), false);

        bundle.more_available();
        bundle.more_available();
        assert_eq!(a.state(), QueuedState::Processing);
        assert_eq!(b.state(), QueuedState::Waiting);
        assert!(rx_a.await.is_ok());

        bundle.finish_wake();
        assert_eq!(b.state(), QueuedState::Processing);
    }

    #[tokio::test]
    async fn abort_removes_ghost_entry() {
        let bundle = concurrency(1, true);
        let (a, b) = (Arc::new(QueuedRequest::new("m")), Arc::new(QueuedRequest::new("m")));
        let _rx_a = a.arm();
        let _rx_b = b.arm();
        bundle.lock().enqueue(a.clone(), false);
        bundle.lock().enqueue(b.clone(), false);

        bundle.abort(&a);
        assert_eq!(bundle.number_waiting(), 0);
        assert_eq!(b.state(), QueuedState::Processing);
        assert!(!a.is_valid());
    }

    #[tokio::test]
    async fn abort_after_wake_passes_it_on() {
        let bundle = concurrency(1, true);
        let (a, b) = (Arc::new(QueuedRequest::new("m")), Arc::new(QueuedRequest::new("m")));
        let _rx_a = a.arm();
        let _rx_b = b.arm();
        bundle.lock().enqueue(a.clone(), false);
        bundle.lock().enqueue(b.clone(), false);
        bundle.more_available();

        bundle.abort(&a);
        assert_eq!(b.state(), QueuedState::Processing);
        assert_eq!(bundle.lock().in_flight, 1);
    }

    #[tokio::test]
    async fn release_frees_concurrency() {
        let bundle = concurrency(1, false);
        bundle.lock().throttling.reserve(1);
        assert_eq!(bundle.used(), 1);
        bundle.release(1, &RuleFeedback::default());
        assert_eq!(bundle.used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn decaying_reservation_expires() {
        let bundle = ScopeBundle::new(
            "sliding".into(),
            String::new(),
            Box::new(WindowSliding::new(Some(1), Some(Duration::from_millis(50))).unwrap()),
            None,
            None,
        )
        .unwrap();
        let reservation = bundle.lock().throttling.reserve(1);
        bundle.schedule_decay(reservation);
        assert_eq!(bundle.used(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(bundle.used(), 0);
    }
}
