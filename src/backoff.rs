//! Manager-wide cool-down after reported upstream failures.
//!
//! A [`Backoff`] is activated by errors reported through grant feedback or
//! `report_error`. While active, every new admission pass of its manager first waits for the
//! cool-down window to elapse. Activations that pile up beyond `limit` without a successful
//! wait-out turn into a permanent [`QuotaError::BackoffLimit`] until [`Backoff::reset`].
//!
//! Two policies:
//! - `timeout`: fixed delay after each activation (default 1s, unbounded activations).
//! - `exponential`: the delay doubles with each activation, starting at twice the base
//!   (default base 1s, jittered, limit 5).
//!
//! ```rust
//! use quotaflow::{Backoff, ReportedError};
//! use std::time::Duration;
//!
//! let backoff = Backoff::timeout(Duration::from_millis(500))
//!     .with_should_backoff(|e: &ReportedError| e.status == Some(429));
//! assert!(!backoff.activate(&ReportedError::new("bad request").with_status(400)));
//! assert!(backoff.activate(&ReportedError::new("slow down").with_status(429)));
//! assert!(backoff.is_active());
//! ```

use crate::error::{ConfigError, QuotaError, ReportedError, Result};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Upper bound for a single cool-down window (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_TIMEOUT_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_EXPONENTIAL_BASE: Duration = Duration::from_millis(1000);
pub const DEFAULT_EXPONENTIAL_LIMIT: u32 = 5;

/// Decides whether a reported error should activate the backoff.
pub type BackoffPredicate = Arc<dyn Fn(&ReportedError) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    Timeout { delay: Duration },
    Exponential { base: Duration, jitter: Jitter },
}

impl BackoffPolicy {
    fn window(&self, accumulator: u32) -> Duration {
        match self {
            BackoffPolicy::Timeout { delay } => (*delay).min(MAX_BACKOFF),
            BackoffPolicy::Exponential { base, jitter } => {
                let scaled = base.checked_mul(accumulator).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF);
                jitter.apply(scaled)
            }
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    active: bool,
    count: u32,
    accumulator: u32,
    next_window: Option<Instant>,
}

impl BackoffState {
    fn new() -> Self {
        Self { active: false, count: 0, accumulator: 1, next_window: None }
    }
}

/// Cool-down state for one manager.
pub struct Backoff {
    policy: BackoffPolicy,
    limit: Option<u32>,
    should_backoff: Option<BackoffPredicate>,
    sleeper: Arc<dyn Sleeper>,
    state: Mutex<BackoffState>,
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("policy", &self.policy)
            .field("limit", &self.limit)
            .field("state", &*self.lock())
            .finish()
    }
}

impl Backoff {
    fn with_policy(policy: BackoffPolicy, limit: Option<u32>) -> Self {
        Self {
            policy,
            limit,
            should_backoff: None,
            sleeper: Arc::new(TokioSleeper),
            state: Mutex::new(BackoffState::new()),
        }
    }

    /// Fixed cool-down after each activation, no activation limit.
    pub fn timeout(delay: Duration) -> Self {
        Self::with_policy(BackoffPolicy::Timeout { delay }, None)
    }

    /// Doubling cool-down (2×base, 4×base, ...) with up to 1ms additive jitter and a limit of 5.
    pub fn exponential(base: Duration) -> Self {
        Self::with_policy(
            BackoffPolicy::Exponential { base, jitter: Jitter::additive(Duration::from_millis(1)) },
            Some(DEFAULT_EXPONENTIAL_LIMIT),
        )
    }

    /// Maximum number of consecutive activations; `None` means unbounded.
    pub fn with_limit(mut self, limit: Option<u32>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_should_backoff<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ReportedError) -> bool + Send + Sync + 'static,
    {
        self.should_backoff = Some(Arc::new(predicate));
        self
    }

    /// Replace the jitter of an exponential backoff.
    pub fn with_jitter(mut self, jitter: Jitter) -> std::result::Result<Self, ConfigError> {
        match &mut self.policy {
            BackoffPolicy::Exponential { jitter: existing, .. } => {
                *existing = jitter;
                Ok(self)
            }
            BackoffPolicy::Timeout { .. } => {
                Err(ConfigError::InvalidOption("jitter is only supported by exponential backoff".into()))
            }
        }
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Consecutive activations since the last reset.
    pub fn count(&self) -> u32 {
        self.lock().count
    }

    fn lock(&self) -> MutexGuard<'_, BackoffState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a reported failure. Returns whether the backoff was activated.
    pub fn activate(&self, error: &ReportedError) -> bool {
        if let Some(predicate) = &self.should_backoff {
            if !predicate(error) {
                return false;
            }
        }
        let mut state = self.lock();
        state.active = true;
        state.count = state.count.saturating_add(1);
        state.accumulator = state.accumulator.saturating_mul(2);
        let window = self.policy.window(state.accumulator);
        state.next_window = Some(Instant::now() + window);
        warn!(count = state.count, window_ms = window.as_millis() as u64, error = %error, "backoff activated");
        true
    }

    pub fn reset(&self) {
        *self.lock() = BackoffState::new();
    }

    /// Wait out an active cool-down, including any extension it gets while waiting.
    ///
    /// Fails with `BackoffLimit` once the activation count exceeds the limit, and with
    /// `OutOfQuota` if the cool-down would outlast `deadline`.
    pub async fn wait_if_necessary(&self, manager_name: &str, deadline: Option<Instant>) -> Result<()> {
        loop {
            let (remaining, window) = {
                let mut state = self.lock();
                if !state.active {
                    return Ok(());
                }
                if let Some(limit) = self.limit {
                    if state.count > limit {
                        error!(manager = manager_name, count = state.count, limit, "backoff limit reached");
                        return Err(QuotaError::BackoffLimit { manager_name: manager_name.to_string() });
                    }
                }
                let now = Instant::now();
                match state.next_window {
                    Some(window) if window > now => (window - now, window),
                    _ => {
                        *state = BackoffState::new();
                        return Ok(());
                    }
                }
            };

            if let Some(deadline) = deadline {
                if Instant::now() + remaining > deadline {
                    debug!(manager = manager_name, "backoff outlasts max wait");
                    return Err(QuotaError::out_of_quota(manager_name, None));
                }
            }

            debug!(manager = manager_name, remaining_ms = remaining.as_millis() as u64, "waiting out backoff");
            self.sleeper.sleep(remaining).await;

            let mut state = self.lock();
            if state.next_window == Some(window) {
                *state = BackoffState::new();
                return Ok(());
            }
            // re-activated while sleeping
        }
    }
}
