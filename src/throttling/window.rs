//! Time-window strategies.
//!
//! Both use cutoff semantics: a fixed window forgets everything at its boundary, a sliding
//! window forgets each reservation exactly `window` after it was taken.

use super::{Counter, Reservation, Throttling};
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::grant::RuleFeedback;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Shortest delay a window timer is armed with.
const MIN_RESET_DELAY: Duration = Duration::from_millis(1);

/// When the next fixed window starts.
#[derive(Clone)]
pub enum WindowSchedule {
    /// Windows of this length aligned to the unix epoch.
    Aligned(Duration),
    /// Caller-supplied start of the next window, in epoch milliseconds.
    Custom(Arc<dyn Fn() -> u64 + Send + Sync>),
}

impl WindowSchedule {
    pub fn custom<F>(start_of_next_window: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        WindowSchedule::Custom(Arc::new(start_of_next_window))
    }

    /// Epoch milliseconds at which the window following `now_millis` starts.
    pub fn start_of_next_window(&self, now_millis: u64) -> u64 {
        match self {
            WindowSchedule::Aligned(window) => {
                let window = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
                (now_millis / window).saturating_add(1).saturating_mul(window)
            }
            WindowSchedule::Custom(next) => next(),
        }
    }
}

impl fmt::Debug for WindowSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSchedule::Aligned(window) => f.debug_tuple("Aligned").field(window).finish(),
            WindowSchedule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Counter that is zeroed whenever a new window starts.
pub struct WindowFixed {
    counter: Counter,
    schedule: WindowSchedule,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for WindowFixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowFixed")
            .field("counter", &self.counter)
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl WindowFixed {
    pub fn new(limit: Option<u64>, schedule: WindowSchedule) -> Result<Self, ConfigError> {
        if let WindowSchedule::Aligned(window) = &schedule {
            if window.is_zero() {
                return Err(ConfigError::InvalidWindow { strategy: "window-fixed".into() });
            }
        }
        Ok(Self { counter: Counter::new(limit)?, schedule, clock: Arc::new(SystemClock) })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Throttling for WindowFixed {
    fn is_available(&self, amount: u64) -> bool {
        self.counter.is_available(amount)
    }

    fn reserve(&mut self, amount: u64) -> Reservation {
        self.counter.take(amount);
        Reservation::permanent(amount)
    }

    fn dismiss(&mut self, _amount: u64, feedback: &RuleFeedback) -> bool {
        self.counter.learn(feedback).unwrap_or(false)
    }

    fn used(&self) -> u64 {
        self.counter.used
    }

    fn limit(&self) -> Option<u64> {
        Some(self.counter.limit)
    }

    fn set_limit(&mut self, limit: u64) -> bool {
        self.counter.set_limit(limit)
    }

    fn next_reset(&self) -> Option<Duration> {
        let now = self.clock.now_millis();
        let start = self.schedule.start_of_next_window(now);
        Some(Duration::from_millis(start.saturating_sub(now)).max(MIN_RESET_DELAY))
    }

    fn reset_window(&mut self) {
        self.counter.used = 0;
    }
}

/// Counter where every reservation expires `window` after it was taken.
#[derive(Debug, Clone)]
pub struct WindowSliding {
    counter: Counter,
    window: Duration,
}

impl WindowSliding {
    pub fn new(limit: Option<u64>, window: Option<Duration>) -> Result<Self, ConfigError> {
        let counter = Counter::new(limit)?;
        match window {
            Some(window) if !window.is_zero() => Ok(Self { counter, window }),
            _ => Err(ConfigError::InvalidWindow { strategy: "window-sliding".into() }),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Throttling for WindowSliding {
    fn is_available(&self, amount: u64) -> bool {
        self.counter.is_available(amount)
    }

    fn reserve(&mut self, amount: u64) -> Reservation {
        self.counter.take(amount);
        Reservation::decaying(amount, self.window)
    }

    fn dismiss(&mut self, _amount: u64, feedback: &RuleFeedback) -> bool {
        self.counter.learn(feedback).unwrap_or(false)
    }

    fn expire(&mut self, amount: u64) -> bool {
        self.counter.give_back(amount);
        self.counter.is_available(1)
    }

    fn used(&self) -> u64 {
        self.counter.used
    }

    fn limit(&self) -> Option<u64> {
        Some(self.counter.limit)
    }

    fn set_limit(&mut self, limit: u64) -> bool {
        self.counter.set_limit(limit)
    }
}
