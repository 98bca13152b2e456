//! Counter strategies without a time component.

use super::{Counter, Reservation, Throttling};
use crate::error::ConfigError;
use crate::grant::RuleFeedback;

/// Lifetime quota: reservations are never handed back (e.g. total bytes uploaded).
///
/// Feedback may raise or lower the limit; `used` never decreases.
#[derive(Debug, Clone)]
pub struct LimitAbsolute {
    counter: Counter,
}

impl LimitAbsolute {
    pub fn new(limit: Option<u64>) -> Result<Self, ConfigError> {
        Ok(Self { counter: Counter::new(limit)? })
    }
}

impl Throttling for LimitAbsolute {
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
}

/// Concurrency cap: a reservation is in flight until its grant is dismissed.
#[derive(Debug, Clone)]
pub struct LimitConcurrency {
    counter: Counter,
}

impl LimitConcurrency {
    pub fn new(limit: Option<u64>) -> Result<Self, ConfigError> {
        Ok(Self { counter: Counter::new(limit)? })
    }
}

impl Throttling for LimitConcurrency {
    fn is_available(&self, amount: u64) -> bool {
        self.counter.is_available(amount)
    }

    fn reserve(&mut self, amount: u64) -> Reservation {
        self.counter.take(amount);
        Reservation::permanent(amount)
    }

    fn dismiss(&mut self, amount: u64, feedback: &RuleFeedback) -> bool {
        self.counter.give_back(amount);
        self.counter.learn(feedback);
        true
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
