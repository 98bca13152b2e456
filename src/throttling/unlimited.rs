use super::{Reservation, Throttling};
use crate::grant::RuleFeedback;

/// Admits everything. Pair it with a backoff to block on reported errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl Throttling for Unlimited {
    fn is_available(&self, _amount: u64) -> bool {
        true
    }

    fn reserve(&mut self, _amount: u64) -> Reservation {
        Reservation::none()
    }

    fn dismiss(&mut self, _amount: u64, _feedback: &RuleFeedback) -> bool {
        false
    }

    fn used(&self) -> u64 {
        0
    }

    fn limit(&self) -> Option<u64> {
        None
    }

    fn set_limit(&mut self, _limit: u64) -> bool {
        false
    }

    fn saturate(&mut self) -> Reservation {
        Reservation::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_denies() {
        let mut throttling = Unlimited;
        for amount in [1, 10, 1_000_000, u64::MAX] {
            assert!(throttling.is_available(amount));
            throttling.reserve(amount);
        }
        throttling.saturate();
        assert!(throttling.is_available(u64::MAX));
    }
}
