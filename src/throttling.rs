//! Quantitative admission strategies.
//!
//! One [`Throttling`] instance exists per (rule, scope) pair, owned by a
//! [`ScopeBundle`](crate::bundle::ScopeBundle) that serializes access to it. Strategies never
//! spawn timers themselves: a reservation reports when it decays, and window strategies report
//! when their next reset is due. The bundle owns the timers.
//!
//! | key                 | behaviour                                                   |
//! |---------------------|-------------------------------------------------------------|
//! | `limit-absolute`    | lifetime counter, only grows                                |
//! | `limit-concurrency` | in-flight counter, released on dismiss                      |
//! | `window-fixed`      | counter zeroed at each window start                         |
//! | `window-sliding`    | every reservation expires `window` after it was taken       |
//! | `unlimited`         | always admits                                               |

mod limit;
mod unlimited;
mod window;

pub use limit::{LimitAbsolute, LimitConcurrency};
pub use unlimited::Unlimited;
pub use window::{WindowFixed, WindowSchedule, WindowSliding};

use crate::clock::Clock;
use crate::error::{ConfigError, ReportedError};
use crate::grant::RuleFeedback;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Capacity taken by one `reserve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub amount: u64,
    /// Set when the reserved amount must be handed back through `expire` after this delay.
    pub decays_after: Option<Duration>,
}

impl Reservation {
    pub fn permanent(amount: u64) -> Self {
        Self { amount, decays_after: None }
    }

    pub fn decaying(amount: u64, after: Duration) -> Self {
        Self { amount, decays_after: Some(after) }
    }

    pub fn none() -> Self {
        Self::permanent(0)
    }
}

/// A pluggable admission algorithm.
///
/// Methods returning `bool` report whether capacity may have been freed, in which case the
/// owning bundle wakes its next waiter.
pub trait Throttling: Send + fmt::Debug {
    /// Pure check: would reserving `amount` now stay within the limit.
    fn is_available(&self, amount: u64) -> bool;

    /// Take `amount`. Only called right after a successful `is_available(amount)`.
    fn reserve(&mut self, amount: u64) -> Reservation;

    /// Hand back a reservation made earlier, applying the rule's feedback.
    fn dismiss(&mut self, amount: u64, feedback: &RuleFeedback) -> bool;

    /// Called when a decaying reservation runs out.
    fn expire(&mut self, _amount: u64) -> bool {
        false
    }

    fn used(&self) -> u64;

    /// `None` for strategies without a numeric limit.
    fn limit(&self) -> Option<u64>;

    /// Replace the limit. Zero is ignored.
    fn set_limit(&mut self, limit: u64) -> bool;

    /// Reserve whatever capacity is left, blocking admission until it is freed or reset.
    fn saturate(&mut self) -> Reservation {
        match self.limit() {
            Some(limit) => {
                let remaining = limit.saturating_sub(self.used());
                if remaining == 0 {
                    Reservation::none()
                } else {
                    self.reserve(remaining)
                }
            }
            None => Reservation::none(),
        }
    }

    /// Delay until the next window reset, for strategies that reset on a schedule.
    fn next_reset(&self) -> Option<Duration> {
        None
    }

    /// Start a new window.
    fn reset_window(&mut self) {}
}

/// Parameters shared by all throttling constructors.
#[derive(Clone, Default)]
pub struct ThrottlingOptions {
    pub limit: Option<u64>,
    pub window: Option<Duration>,
    pub schedule: Option<WindowSchedule>,
    pub clock: Option<Arc<dyn Clock>>,
}

impl fmt::Debug for ThrottlingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottlingOptions")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("schedule", &self.schedule)
            .finish()
    }
}

/// Hook run when dismiss feedback carries an error, after the reservation was handed back.
pub type OnError = Arc<dyn Fn(&mut ErrorContext<'_>, &ReportedError) + Send + Sync>;

/// View of a throttling handed to [`OnError`] hooks.
pub struct ErrorContext<'a> {
    throttling: &'a mut dyn Throttling,
    pub(crate) decays: Vec<Reservation>,
    pub(crate) wake: bool,
}

impl<'a> ErrorContext<'a> {
    pub(crate) fn new(throttling: &'a mut dyn Throttling) -> Self {
        Self { throttling, decays: Vec::new(), wake: false }
    }

    /// Block admission until the throttling frees capacity on its own.
    pub fn saturate(&mut self) {
        let reservation = self.throttling.saturate();
        if reservation.amount > 0 && reservation.decays_after.is_some() {
            self.decays.push(reservation);
        }
    }

    pub fn used(&self) -> u64 {
        self.throttling.used()
    }

    pub fn limit(&self) -> Option<u64> {
        self.throttling.limit()
    }

    pub fn set_limit(&mut self, limit: u64) {
        self.wake |= self.throttling.set_limit(limit);
    }
}

/// `used`/`limit` pair shared by the limiting strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Counter {
    pub(crate) used: u64,
    pub(crate) limit: u64,
}

impl Counter {
    pub(crate) fn new(limit: Option<u64>) -> Result<Self, ConfigError> {
        match limit {
            Some(limit) if limit > 0 => Ok(Self { used: 0, limit }),
            _ => Err(ConfigError::MissingLimit),
        }
    }

    pub(crate) fn is_available(&self, amount: u64) -> bool {
        self.used.checked_add(amount).is_some_and(|total| total <= self.limit)
    }

    pub(crate) fn take(&mut self, amount: u64) {
        self.used = self.used.saturating_add(amount);
    }

    pub(crate) fn give_back(&mut self, amount: u64) {
        self.used = self.used.saturating_sub(amount);
    }

    pub(crate) fn set_limit(&mut self, limit: u64) -> bool {
        if limit == 0 {
            warn!("ignoring non-positive limit");
            return false;
        }
        self.limit = limit;
        self.is_available(1)
    }

    /// Apply a limit carried by feedback. Returns whether capacity is available afterwards.
    pub(crate) fn learn(&mut self, feedback: &RuleFeedback) -> Option<bool> {
        feedback.limit.map(|limit| self.set_limit(limit))
    }
}
